//! Role negotiation state machine
//!
//! One [`Protocol`] value per node drives the whole bootstrap:
//!
//! 1. Ask whether a parent already runs this program (`ParentQuery`)
//! 2. If one answers, take the role it hands out and reset into it
//! 3. Otherwise become parent: look for Blox holding the program image
//!    (`ProgQuery`), start each one that answers (`ProgStart`), and assign it
//!    a role when its copy of the program asks (`ParentAck`)
//! 4. Record our own role and reset into it
//!
//! Received frames are queued by the radio and handled whenever the node
//! polls, either between broadcast copies or in [`Protocol::step`]. A handler
//! that blocks holds receive delivery off for as long as it runs.

use core::convert::Infallible;

use tracing::{debug, info, trace, warn};

use crate::alloc::Allocator;
use crate::codec::{Envelope, RoleMessage};
use crate::config::ProtocolConfig;
use crate::error::{AddError, Result, RunError};
use crate::hal::{time_until, Board, Hal, RxGate};
use crate::resume::ResumeCell;
use crate::table::RoleInfo;
use crate::types::{program_name, NodeId, NodeState, RoleEntry, RoleId, BROADCAST_ID};

/// What [`Protocol::init`] found at boot
pub enum Startup<'a, H: Hal, E: RoleEntry> {
    /// A role was recorded before the last reset and has been entered
    Resumed(E),
    /// No role recorded; register roles and run negotiation
    Ready(Protocol<'a, H, E>),
}

/// Settled result of a negotiation, recorded in the resume cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome<E> {
    /// Parent, or child of some other parent
    pub state: NodeState,
    /// Role this node will run
    pub role_id: RoleId,
    /// Entry of that role
    pub entry: E,
}

/// Per-node role protocol
pub struct Protocol<'a, H: Hal, E: RoleEntry> {
    hal: &'a H,
    resume: &'a dyn ResumeCell<E>,
    config: ProtocolConfig,
    info: RoleInfo<E>,
    state: NodeState,
    allocator: Allocator,
    /// Peer whose discovery exchange is outstanding. Frames from anyone else
    /// are ignored while it is set.
    in_progress: Option<NodeId>,
}

impl<'a, H: Hal, E: RoleEntry> Protocol<'a, H, E> {
    /// Boot-time entry point.
    ///
    /// Consults the resume cell before anything else. A recorded role is
    /// cleared and entered, and negotiation is skipped for this boot.
    pub fn init(
        hal: &'a H,
        resume: &'a dyn ResumeCell<E>,
        name: &str,
        config: ProtocolConfig,
    ) -> Result<Startup<'a, H, E>> {
        if let Some(entry) = resume.take() {
            info!("Role: resuming '{}' into recorded role", name);
            entry.enter();
            return Ok(Startup::Resumed(entry));
        }

        config.validate()?;
        let name = program_name(name)?;

        info!(
            "Role: node {:#010x} negotiating '{}' on {}",
            hal.local_id(),
            name,
            hal.platform_name()
        );
        hal.enable_rx();

        Ok(Startup::Ready(Self {
            hal,
            resume,
            config,
            info: RoleInfo::new(name),
            state: NodeState::Empty,
            allocator: Allocator::new(),
            in_progress: None,
        }))
    }

    /// Register a role needing between `min` and `max` Blox
    pub fn add_role(&mut self, entry: E, min: u32, max: u32) -> core::result::Result<RoleId, AddError> {
        let id = self.info.add(entry, min, max)?;
        debug!("Role: added role {} (min {}, max {})", id, min, max);
        Ok(id)
    }

    /// Current negotiation state
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Role bookkeeping
    pub fn info(&self) -> &RoleInfo<E> {
        &self.info
    }

    /// Peer whose discovery exchange is outstanding
    pub fn in_progress(&self) -> Option<NodeId> {
        self.in_progress
    }

    /// Protocol timing
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    // ========================================================================
    // Run
    // ========================================================================

    /// Negotiate, record the outcome and reset into it.
    ///
    /// Returns only when there is nothing sensible to reset into.
    pub fn run<B: Board + ?Sized>(mut self, board: &B) -> core::result::Result<Infallible, RunError> {
        let outcome = self.negotiate()?;
        info!(
            "Role: resetting into role {} as {}",
            outcome.role_id, outcome.state
        );
        board.reset()
    }

    /// Everything [`Protocol::run`] does short of the reset.
    ///
    /// The settled role is already in the resume cell when this returns, and
    /// receive delivery is off.
    pub fn negotiate(&mut self) -> core::result::Result<Outcome<E>, RunError> {
        if self.info.table().is_empty() {
            return Err(RunError::NoRoles);
        }

        // Is there a parent already?
        let query = RoleMessage::ParentQuery {
            name: self.info.name().clone(),
        };
        self.broadcast_for(&query, self.config.holds(2));

        if self.state.child_role().is_none() {
            info!("Role: no parent for '{}', becoming parent", self.info.name());
            self.state = NodeState::Parent;
            self.discover();
        }

        let role_id = match self.state {
            NodeState::Child(id) => id,
            _ => {
                if self.info.num_found < self.info.needed() {
                    warn!(
                        "Role: found {} of {} Blox needed for '{}', starting anyway",
                        self.info.num_found,
                        self.info.needed(),
                        self.info.name()
                    );
                }
                match self.info.reserved() {
                    Some(id) => id,
                    None => self.allocator.next_id(self.info.table_mut())?,
                }
            }
        };

        let entry = self
            .info
            .table()
            .get(role_id)
            .map(|role| role.entry)
            .ok_or(RunError::UnknownRole(role_id))?;

        self.hal.disable_rx();
        self.resume.store(entry);
        info!(
            "Role: settled on role {} as {} ({} found, {} started)",
            role_id, self.state, self.info.num_found, self.info.num_started
        );

        Ok(Outcome {
            state: self.state,
            role_id,
            entry,
        })
    }

    /// Parent-side discovery loop
    fn discover(&mut self) {
        let query = RoleMessage::ProgQuery {
            name: self.info.name().clone(),
        };

        loop {
            self.in_progress = None;
            let found_before = self.info.num_found;

            self.broadcast_for(&query, self.config.holds(4));
            let deadline = self.hal.now_ms().wrapping_add(self.config.holds(4));
            self.step(deadline);

            if self.state != NodeState::Parent {
                break;
            }
            if self.info.num_found == found_before {
                debug!("Role: discovery round found nobody new");
                break;
            }

            self.await_exchange();
            if self.state != NodeState::Parent {
                break;
            }
            if self.info.num_found >= self.info.wanted() {
                debug!("Role: found all {} Blox wanted", self.info.wanted());
                break;
            }
        }
    }

    /// Wait for the started peer to come back asking for its role
    fn await_exchange(&mut self) {
        let Some(peer) = self.in_progress else {
            return;
        };
        let deadline = self
            .hal
            .now_ms()
            .wrapping_add(self.config.exchange_timeout_ms);

        while self.in_progress.is_some() && self.state == NodeState::Parent {
            let now = self.hal.now_ms();
            if time_until(now, deadline) == 0 {
                warn!(
                    "Role: Blox {:#010x} never asked for a role, giving up on it",
                    peer
                );
                self.in_progress = None;
                break;
            }
            self.step(now.wrapping_add(self.config.poll_interval_ms));
        }
    }

    /// Send `message` to everyone for `duration_ms`, handling received frames
    /// between copies. Stops early once a parent has assigned us a role.
    fn broadcast_for(&mut self, message: &RoleMessage, duration_ms: u32) {
        let frame = message.to_envelope(self.hal.local_id(), BROADCAST_ID);
        let start = self.hal.now_ms();
        let mut failures = 0u32;

        while self.hal.now_ms().wrapping_sub(start) < duration_ms {
            if let Err(e) = self.hal.send(&frame) {
                failures += 1;
                trace!("Role: send failed: {}", e);
            }
            self.drain();
            if self.state.child_role().is_some() {
                break;
            }
        }

        if failures > 0 {
            warn!(
                "Role: {} copies of {:?} failed to send",
                failures,
                message.opcode()
            );
        }
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Handle queued frames until `deadline`, sleeping between polls
    pub fn step(&mut self, deadline: u32) {
        loop {
            self.drain();
            let left = time_until(self.hal.now_ms(), deadline);
            if left == 0 {
                break;
            }
            self.hal.wait_ms(left.min(self.config.poll_interval_ms));
        }
    }

    fn drain(&mut self) {
        while let Some(frame) = self.hal.recv() {
            self.handle(&frame);
        }
    }

    /// Process one received frame
    pub fn handle(&mut self, frame: &Envelope) {
        let message = match RoleMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                trace!("Role: dropping frame from {:#010x}: {}", frame.src, e);
                return;
            }
        };

        if !frame.is_for(self.hal.local_id()) {
            trace!("Role: frame for {:#010x} is not ours", frame.dst);
            return;
        }
        if let Some(peer) = self.in_progress {
            if frame.src != peer {
                trace!(
                    "Role: busy with {:#010x}, ignoring {:#010x}",
                    peer,
                    frame.src
                );
                return;
            }
        }

        let src = frame.src;
        match message {
            RoleMessage::ParentQuery { name } => self.on_parent_query(src, &name),
            RoleMessage::ParentAck { role_id } => self.on_parent_ack(src, role_id),
            RoleMessage::ProgAck => self.on_prog_ack(src),
            other => debug!(
                "Role: {:?} from {:#010x} is for the base program",
                other.opcode(),
                src
            ),
        }
    }

    fn on_parent_query(&mut self, src: NodeId, name: &str) {
        if self.state != NodeState::Parent || name != self.info.name().as_str() {
            debug!("Role: not parent for '{}', ignoring query", name);
            return;
        }

        let hal = self.hal;
        let _gate = RxGate::new(hal);
        // The querier is still transmitting
        hal.wait_ms(self.config.hold_period_ms);

        match self.allocator.next_id(self.info.table_mut()) {
            Ok(role_id) => {
                info!("Role: assigning role {} to {:#010x}", role_id, src);
                let reply = RoleMessage::ParentAck { role_id }.to_envelope(hal.local_id(), src);
                if let Err(e) = hal.send_for(&reply, self.config.hold_period_ms) {
                    warn!("Role: ParentAck to {:#010x} failed: {}", src, e);
                }
                self.info.record_started();
            }
            Err(e) => warn!("Role: no role for {:#010x}: {}", src, e),
        }
        self.in_progress = None;
    }

    fn on_parent_ack(&mut self, src: NodeId, role_id: RoleId) {
        if self.state == NodeState::Parent {
            warn!(
                "Role: {:#010x} claims to be parent too, giving up parenthood",
                src
            );
        } else {
            info!("Role: parent {:#010x} assigned role {}", src, role_id);
        }
        self.state = NodeState::Child(role_id);
    }

    fn on_prog_ack(&mut self, src: NodeId) {
        if self.state != NodeState::Parent {
            debug!("Role: ProgAck from {:#010x} but not a parent", src);
            return;
        }

        self.in_progress = Some(src);
        let hal = self.hal;
        let _gate = RxGate::new(hal);
        // The acknowledging Blox is still transmitting
        hal.wait_ms(self.config.hold_period_ms);

        info!("Role: starting '{}' on {:#010x}", self.info.name(), src);
        let start = RoleMessage::ProgStart {
            name: self.info.name().clone(),
        }
        .to_envelope(hal.local_id(), src);
        if let Err(e) = hal.send_for(&start, self.config.hold_period_ms) {
            warn!("Role: ProgStart to {:#010x} failed: {}", src, e);
        }
        self.info.record_found(src);
    }
}
