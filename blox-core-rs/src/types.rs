//! Base types and protocol constants
//!
//! Sizes here are fixed by the radio frame layout that deployed Blox speak,
//! so changing any of them breaks interoperability.

use core::fmt;

use crate::error::NameError;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Maximum number of role descriptors a program may register
pub const ROLE_MAX: usize = 64;

/// Bytes of application data carried by one radio frame
pub const FRAME_DATA_LEN: usize = 75;

/// Width of the on-air program name field (name bytes plus NUL terminator)
pub const NAME_FIELD_LEN: usize = 32;

/// Longest program name that fits the name field
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;

/// Default hold period in milliseconds
pub const HOLD_PERIOD_MS: u32 = 1000;

// ============================================================================
// Basic Types
// ============================================================================

/// Hardware identifier of a Blox
pub type NodeId = u32;

/// Index of a role descriptor in the role table
pub type RoleId = u8;

/// Destination id that every node accepts
pub const BROADCAST_ID: NodeId = 0xFFFF_FFFF;

/// Name of a stored program image
pub type ProgramName = heapless::String<MAX_NAME_LEN>;

/// Build a [`ProgramName`], rejecting names that cannot travel in a query.
pub fn program_name(name: &str) -> Result<ProgramName, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.as_bytes().contains(&0) {
        return Err(NameError::InteriorNul);
    }
    let mut out = ProgramName::new();
    out.push_str(name)
        .map_err(|_| NameError::TooLong {
            len: name.len(),
            limit: MAX_NAME_LEN,
        })?;
    Ok(out)
}

// ============================================================================
// Node State
// ============================================================================

/// Negotiation state of this node for the running program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Still looking for a parent
    #[default]
    Empty,
    /// Coordinating role assignment for the program
    Parent,
    /// Assigned a role by a parent
    Child(RoleId),
}

impl NodeState {
    /// Role id handed to us by a parent, if any
    pub fn child_role(&self) -> Option<RoleId> {
        match self {
            NodeState::Child(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Empty => write!(f, "empty"),
            NodeState::Parent => write!(f, "parent"),
            NodeState::Child(id) => write!(f, "child({})", id),
        }
    }
}

// ============================================================================
// Role Entries
// ============================================================================

/// Handle to the code a node runs once its role is settled.
///
/// The protocol stores and returns these but never looks inside. On hardware
/// the handle is a plain function that does not return; hosted embeddings use
/// whatever value lets them observe which role was entered.
pub trait RoleEntry: Copy {
    /// Hand control to the role
    fn enter(self);
}

impl RoleEntry for fn() {
    fn enter(self) {
        self()
    }
}
