//! # Blox Role Bootstrap
//!
//! Write a distributed program once as a set of roles, each wanting between
//! a minimum and a maximum number of Blox, and let the Blox in radio range
//! work out who runs what.
//!
//! ## How it works
//!
//! The Blox a user starts the program on asks whether a parent already
//! exists. If none answers it becomes the parent, finds Blox that have the
//! program image stored, starts them, and hands each one a role as it comes
//! up. Every node then records its role and warm-resets straight into it.
//!
//! ```ignore
//! use blox_core::prelude::*;
//!
//! fn main() -> ! {
//!     // Two words the linker script reserves outside .bss
//!     let resume = unsafe { RawResumeCell::new(0x2000_6000 as *mut usize) };
//!     let hal = XBeeHal::new();
//!     match Protocol::init(&hal, &resume, "role_test", ProtocolConfig::default()) {
//!         Ok(Startup::Ready(mut role)) => {
//!             role.add_role(blink_led1 as fn(), 1, 2)?;
//!             role.add_role(blink_led2 as fn(), 1, 5)?;
//!             role.run(&board)?;
//!         }
//!         ...
//!     }
//! }
//! ```
//!
//! Allocation is fair: every role reaches its minimum before any role gets a
//! Blox beyond it, and the rest are spread round-robin up to the maximums.
//!
//! Two parents for the same program can exist at once and are not
//! reconciled. Delivery is best effort, made likely by repeating every
//! message for a hold period.

pub mod types;
pub mod error;
pub mod codec;
pub mod config;
pub mod table;
pub mod alloc;
pub mod hal;
pub mod resume;
pub mod protocol;
pub mod base;
#[cfg(feature = "sim")]
pub mod sim;

// Re-exports for convenience
pub use types::*;
pub use error::{
    AddError, ConfigError, DecodeError, Error, Exhausted, NameError, RadioError, Result, RunError,
};
pub use codec::{Envelope, FrameKind, Opcode, RoleMessage};
pub use config::ProtocolConfig;
pub use table::{RoleDescriptor, RoleInfo, RoleTable};
pub use self::alloc::{Allocator, Phase};
pub use hal::{Board, Hal, ProgramStore, RxGate};
pub use resume::{MemoryResumeCell, RawResumeCell, ResumeCell, ResumeState};
pub use protocol::{Outcome, Protocol, Startup};
pub use base::BaseListener;

/// Prelude - commonly used items
pub mod prelude {
    pub use crate::types::*;
    pub use crate::codec::{Envelope, RoleMessage};
    pub use crate::config::ProtocolConfig;
    pub use crate::hal::{Board, Hal, ProgramStore};
    pub use crate::resume::{RawResumeCell, ResumeCell};
    pub use crate::protocol::{Protocol, Startup};
    pub use crate::base::BaseListener;
}

// ============================================================================
// Version
// ============================================================================

/// Crate version
pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");
