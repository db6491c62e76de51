//! Role table and per-node role bookkeeping
//!
//! [`RoleTable`] is the bounded catalog of role descriptors with the
//! aggregate `needed`/`wanted` counters. [`RoleInfo`] wraps it with what one
//! node knows about the running program: its name, how many Blox were found
//! and started, and the role this node reserved for itself.

use heapless::Vec;
use tracing::debug;

use crate::error::AddError;
use crate::types::{NodeId, ProgramName, RoleId, ROLE_MAX};

// ============================================================================
// Descriptors
// ============================================================================

/// One role of a distributed program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleDescriptor<E> {
    /// Fewest Blox the program needs in this role
    pub min: u32,
    /// Most Blox the program can use in this role
    pub max: u32,
    /// Code to run for this role
    pub entry: E,
    /// Blox handed this role so far (never exceeds `max`)
    pub allocated: u32,
}

impl<E> RoleDescriptor<E> {
    /// Still short of the minimum?
    pub fn below_min(&self) -> bool {
        self.allocated < self.min
    }

    /// Still room below the maximum?
    pub fn below_max(&self) -> bool {
        self.allocated < self.max
    }
}

// ============================================================================
// Role Table
// ============================================================================

/// Bounded, append-only table of role descriptors
#[derive(Debug, Clone)]
pub struct RoleTable<E> {
    roles: Vec<RoleDescriptor<E>, ROLE_MAX>,
    needed: u32,
    wanted: u32,
}

impl<E> Default for RoleTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> RoleTable<E> {
    /// Create an empty table
    pub const fn new() -> Self {
        Self {
            roles: Vec::new(),
            needed: 0,
            wanted: 0,
        }
    }

    /// Append a role needing between `min` and `max` Blox
    pub fn add(&mut self, entry: E, min: u32, max: u32) -> Result<RoleId, AddError> {
        if self.roles.is_full() {
            return Err(AddError::TableFull);
        }
        if min == 0 || min > max {
            return Err(AddError::InvalidRange { min, max });
        }

        let id = self.roles.len() as RoleId;
        self.roles
            .push(RoleDescriptor {
                min,
                max,
                entry,
                allocated: 0,
            })
            .map_err(|_| AddError::TableFull)?;
        self.needed = self.needed.saturating_add(min);
        self.wanted = self.wanted.saturating_add(max);

        Ok(id)
    }

    /// Number of roles
    pub fn count(&self) -> u32 {
        self.roles.len() as u32
    }

    /// Sum of role minimums
    pub fn needed(&self) -> u32 {
        self.needed
    }

    /// Sum of role maximums
    pub fn wanted(&self) -> u32 {
        self.wanted
    }

    /// No roles registered yet?
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Descriptor at `id`
    pub fn get(&self, id: RoleId) -> Option<&RoleDescriptor<E>> {
        self.roles.get(id as usize)
    }

    /// All descriptors in registration order
    pub fn roles(&self) -> &[RoleDescriptor<E>] {
        &self.roles
    }

    /// Charge one Blox to role `id` if it still has room below its maximum.
    ///
    /// Returns false if the role does not exist or is already full.
    pub fn charge(&mut self, id: RoleId) -> bool {
        match self.roles.get_mut(id as usize) {
            Some(role) if role.below_max() => {
                role.allocated += 1;
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// Role Info
// ============================================================================

/// Everything a node tracks about the program it is negotiating
#[derive(Debug, Clone)]
pub struct RoleInfo<E> {
    name: ProgramName,
    table: RoleTable<E>,
    /// Blox holding the program image found so far, counting this node
    pub num_found: u32,
    /// Blox that have started the program so far, counting this node
    pub num_started: u32,
    found: Vec<NodeId, ROLE_MAX>,
    reserved: Option<RoleId>,
}

impl<E> RoleInfo<E> {
    /// Fresh bookkeeping for `name`; this node counts as found and started
    pub fn new(name: ProgramName) -> Self {
        Self {
            name,
            table: RoleTable::new(),
            num_found: 1,
            num_started: 1,
            found: Vec::new(),
            reserved: None,
        }
    }

    /// Program name
    pub fn name(&self) -> &ProgramName {
        &self.name
    }

    /// Register a role.
    ///
    /// The very first role is charged to this node straight away, which is
    /// what a node does when it may end up as both parent and worker.
    pub fn add(&mut self, entry: E, min: u32, max: u32) -> Result<RoleId, AddError> {
        let id = self.table.add(entry, min, max)?;

        if self.table.count() == 1 && self.table.charge(id) {
            self.reserved = Some(id);
            debug!("Role: reserved role {} for this node", id);
        }

        Ok(id)
    }

    /// Role this node reserved for itself, if any
    pub fn reserved(&self) -> Option<RoleId> {
        self.reserved
    }

    /// Role descriptors
    pub fn table(&self) -> &RoleTable<E> {
        &self.table
    }

    /// Role descriptors, for the allocator
    pub fn table_mut(&mut self) -> &mut RoleTable<E> {
        &mut self.table
    }

    /// Number of roles
    pub fn count(&self) -> u32 {
        self.table.count()
    }

    /// Sum of role minimums
    pub fn needed(&self) -> u32 {
        self.table.needed()
    }

    /// Sum of role maximums
    pub fn wanted(&self) -> u32 {
        self.table.wanted()
    }

    /// Record a peer that acknowledged holding the program
    pub fn record_found(&mut self, peer: NodeId) {
        // Counts every acknowledgement: a peer that missed its ProgStart and
        // answers a later round is counted again. Only the id list dedups.
        self.num_found = self.num_found.saturating_add(1);
        if !self.found.contains(&peer) {
            // A full list only loses the id; the counter above stays exact.
            let _ = self.found.push(peer);
        }
    }

    /// Record a peer that was given a role
    pub fn record_started(&mut self) {
        self.num_started = self.num_started.saturating_add(1);
    }

    /// Distinct peers that acknowledged the program, in order of first reply
    pub fn found_peers(&self) -> &[NodeId] {
        &self.found
    }
}
