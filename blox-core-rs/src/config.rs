//! Protocol timing configuration
//!
//! Every window in the protocol is a multiple of the hold period, the time
//! one message is rebroadcast for. Nodes negotiating together must agree on
//! it, so in practice it is fixed per deployment.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::HOLD_PERIOD_MS;

/// Role protocol timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Redundant broadcast window (milliseconds)
    pub hold_period_ms: u32,
    /// Sleep between receive queue polls while waiting (milliseconds)
    pub poll_interval_ms: u32,
    /// Longest a parent waits for a started Blox to ask for its role
    pub exchange_timeout_ms: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            hold_period_ms: HOLD_PERIOD_MS,
            poll_interval_ms: 1,
            exchange_timeout_ms: 4 * HOLD_PERIOD_MS,
        }
    }
}

impl ProtocolConfig {
    /// Config with the given hold period and the exchange timeout scaled to it
    pub fn with_hold_period(hold_period_ms: u32) -> Self {
        Self {
            hold_period_ms,
            exchange_timeout_ms: hold_period_ms.saturating_mul(4),
            ..Default::default()
        }
    }

    /// Set the receive poll interval
    pub fn with_poll_interval(mut self, poll_interval_ms: u32) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    /// Set the exchange timeout
    pub fn with_exchange_timeout(mut self, exchange_timeout_ms: u32) -> Self {
        self.exchange_timeout_ms = exchange_timeout_ms;
        self
    }

    /// Hold period scaled by `n`
    pub fn holds(&self, n: u32) -> u32 {
        self.hold_period_ms.saturating_mul(n)
    }

    /// Reject settings the protocol cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hold_period_ms == 0 {
            return Err(ConfigError::Zero("hold_period_ms"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("poll_interval_ms"));
        }
        Ok(())
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
