//! Error types for the role protocol

use thiserror::Error;

use crate::codec::FrameKind;
use crate::types::RoleId;

/// Result type for role protocol operations
pub type Result<T> = core::result::Result<T, Error>;

/// Rejected `add_role` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddError {
    /// `min` is zero or larger than `max`
    #[error("invalid role range: min {min}, max {max}")]
    InvalidRange { min: u32, max: u32 },
    /// The table already holds [`crate::ROLE_MAX`] descriptors
    #[error("role table is full")]
    TableFull,
}

/// Every role has reached its maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no role below its maximum is left to allocate")]
pub struct Exhausted;

/// Envelope that is not a usable role message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("not a role frame ({0:?})")]
    NotRole(FrameKind),
    #[error("unknown role opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("malformed program name in query body")]
    MalformedName,
    #[error("frame too short ({0} bytes)")]
    Truncated(usize),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
}

/// Program name that cannot be carried in a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("program name is empty")]
    Empty,
    #[error("program name is {len} bytes, limit is {limit}")]
    TooLong { len: usize, limit: usize },
    #[error("program name contains a NUL byte")]
    InteriorNul,
}

/// Transmission failure reported by the radio
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("radio link is down")]
    Disconnected,
    #[error("radio rejected frame: {0}")]
    Rejected(String),
}

/// Negotiation could not reach a role to resume into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("no roles registered")]
    NoRoles,
    #[error("assigned role {0} is not in the role table")]
    UnknownRole(RoleId),
    #[error(transparent)]
    Exhausted(#[from] Exhausted),
}

/// Invalid protocol configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Any role protocol error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Add(#[from] AddError),
    #[error(transparent)]
    Exhausted(#[from] Exhausted),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Name(#[from] NameError),
    #[error(transparent)]
    Radio(#[from] RadioError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
