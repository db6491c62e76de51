//! Fair two-phase role allocation
//!
//! A parent hands out role ids one Blox at a time. Every role is first
//! filled up to its minimum, then the remaining Blox are spread round-robin
//! until every role sits at its maximum. The scan cursor carries over between
//! calls, so consecutive Blox land on different roles wherever there is a
//! choice.

use tracing::debug;

use crate::error::Exhausted;
use crate::table::{RoleDescriptor, RoleTable};
use crate::types::RoleId;

/// Which threshold the allocator is filling towards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Bringing every role up to `min`
    #[default]
    Minimum,
    /// Spreading the rest up to `max`
    Maximum,
    /// Every role is at `max`
    Exhausted,
}

/// Deterministic role id dispenser
#[derive(Debug, Clone, Default)]
pub struct Allocator {
    cursor: usize,
    phase: Phase,
}

impl Allocator {
    /// Start in the minimum-fill phase at the first role
    pub const fn new() -> Self {
        Self {
            cursor: 0,
            phase: Phase::Minimum,
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Index the next scan starts from
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Charge one Blox to the next role and return its id
    pub fn next_id<E>(&mut self, table: &mut RoleTable<E>) -> Result<RoleId, Exhausted> {
        loop {
            let open: fn(&RoleDescriptor<E>) -> bool = match self.phase {
                Phase::Minimum => RoleDescriptor::below_min,
                Phase::Maximum => RoleDescriptor::below_max,
                Phase::Exhausted => return Err(Exhausted),
            };

            if let Some(id) = self.scan(table, open) {
                return Ok(id);
            }

            self.phase = match self.phase {
                Phase::Minimum => Phase::Maximum,
                _ => Phase::Exhausted,
            };
            debug!("Role: allocator moved to {:?} phase", self.phase);
        }
    }

    /// One full cycle from the cursor looking for a role that is still open
    fn scan<E>(
        &mut self,
        table: &mut RoleTable<E>,
        open: fn(&RoleDescriptor<E>) -> bool,
    ) -> Option<RoleId> {
        let count = table.count() as usize;
        if count == 0 {
            return None;
        }

        for step in 0..count {
            let id = (self.cursor + step) % count;
            let role = table.get(id as RoleId)?;
            if open(role) && table.charge(id as RoleId) {
                self.cursor = (id + 1) % count;
                return Some(id as RoleId);
            }
        }

        None
    }
}
