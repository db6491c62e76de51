//! In-memory radio ether and simulated Blox
//!
//! Lets a room of Blox run on one host, one thread per node. Frames travel
//! through a shared [`Ether`] in their hosted wire encoding, with optional
//! random loss, and land in per-node receive queues that behave like the
//! radio's interrupt-fed buffer: bounded, and discarding while gated.
//!
//! [`SimNode`] walks a node through its whole lifecycle: base program,
//! program start, negotiation, warm reset, and the resumed role.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::base::BaseListener;
use crate::codec::{Envelope, ENVELOPE_LEN};
use crate::config::ProtocolConfig;
use crate::error::{Error, RadioError};
use crate::hal::{Hal, ProgramStore};
use crate::protocol::{Protocol, Startup};
use crate::resume::MemoryResumeCell;
use crate::types::{NodeId, NodeState, ProgramName, RoleEntry, RoleId};

// ============================================================================
// Ether
// ============================================================================

/// Simulated radio channel settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtherConfig {
    /// Time one frame occupies the sender (milliseconds)
    pub airtime_ms: u32,
    /// Probability that a receiver misses a frame (0.0-1.0)
    pub loss_rate: f64,
    /// Frames a node's receive queue holds before dropping new ones
    pub rx_queue_depth: usize,
}

impl Default for EtherConfig {
    fn default() -> Self {
        Self {
            airtime_ms: 2,
            loss_rate: 0.0,
            rx_queue_depth: 32,
        }
    }
}

impl EtherConfig {
    /// Set the per-frame airtime
    pub fn with_airtime(mut self, airtime_ms: u32) -> Self {
        self.airtime_ms = airtime_ms;
        self
    }

    /// Set the per-receiver loss probability
    pub fn with_loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = loss_rate.clamp(0.0, 1.0);
        self
    }

    /// Set the receive queue depth
    pub fn with_rx_queue_depth(mut self, depth: usize) -> Self {
        self.rx_queue_depth = depth.max(1);
        self
    }
}

/// Frame counters for the whole ether
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtherStats {
    /// Frames put on air
    pub sent: u64,
    /// Copies queued at a receiver
    pub delivered: u64,
    /// Copies lost to random loss
    pub lost: u64,
    /// Copies discarded by a gated or full receiver
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct InboxState {
    enabled: bool,
    queue: VecDeque<[u8; ENVELOPE_LEN]>,
}

/// One node's receive queue
#[derive(Debug)]
struct Inbox {
    state: Mutex<InboxState>,
    depth: usize,
}

impl Inbox {
    fn new(depth: usize) -> Self {
        Self {
            state: Mutex::new(InboxState::default()),
            depth,
        }
    }

    fn deliver(&self, bytes: [u8; ENVELOPE_LEN]) -> bool {
        let mut state = self.state.lock();
        if !state.enabled || state.queue.len() >= self.depth {
            return false;
        }
        state.queue.push_back(bytes);
        true
    }

    fn pop(&self) -> Option<[u8; ENVELOPE_LEN]> {
        self.state.lock().queue.pop_front()
    }

    fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.enabled = enabled;
        if !enabled {
            state.queue.clear();
        }
    }
}

/// Shared broadcast medium
#[derive(Debug)]
pub struct Ether {
    epoch: Instant,
    config: EtherConfig,
    inboxes: Mutex<HashMap<NodeId, Arc<Inbox>>>,
    sent: AtomicU64,
    delivered: AtomicU64,
    lost: AtomicU64,
    dropped: AtomicU64,
}

impl Ether {
    /// Create an empty ether
    pub fn new(config: EtherConfig) -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            config,
            inboxes: Mutex::new(HashMap::new()),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Bring a radio with hardware id `id` onto the channel
    pub fn attach(self: &Arc<Self>, id: NodeId) -> SimHal {
        let inbox = Arc::new(Inbox::new(self.config.rx_queue_depth));
        if self.inboxes.lock().insert(id, inbox.clone()).is_some() {
            warn!("Sim: node {:#010x} attached twice, replacing its radio", id);
        }
        debug!("Sim: node {:#010x} attached", id);
        SimHal {
            id,
            ether: self.clone(),
            inbox,
        }
    }

    /// Take a radio off the channel
    pub fn detach(&self, id: NodeId) {
        self.inboxes.lock().remove(&id);
    }

    /// Channel settings
    pub fn config(&self) -> &EtherConfig {
        &self.config
    }

    /// Frame counters so far
    pub fn stats(&self) -> EtherStats {
        EtherStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn transmit(&self, frame: &Envelope) -> Result<(), RadioError> {
        let receivers: Vec<(NodeId, Arc<Inbox>)> = {
            let inboxes = self.inboxes.lock();
            if !inboxes.contains_key(&frame.src) {
                return Err(RadioError::Disconnected);
            }
            inboxes
                .iter()
                .filter(|(id, _)| **id != frame.src && frame.is_for(**id))
                .map(|(id, inbox)| (*id, inbox.clone()))
                .collect()
        };

        self.sent.fetch_add(1, Ordering::Relaxed);
        let bytes = frame.to_bytes();
        let mut rng = rand::thread_rng();

        for (id, inbox) in receivers {
            if self.config.loss_rate > 0.0 && rng.gen::<f64>() < self.config.loss_rate {
                self.lost.fetch_add(1, Ordering::Relaxed);
                trace!("Sim: copy to {:#010x} lost", id);
            } else if inbox.deliver(bytes) {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(())
    }
}

// ============================================================================
// Simulated HAL
// ============================================================================

/// Real-time HAL on the in-memory ether
#[derive(Debug, Clone)]
pub struct SimHal {
    id: NodeId,
    ether: Arc<Ether>,
    inbox: Arc<Inbox>,
}

impl Hal for SimHal {
    fn now_ms(&self) -> u32 {
        self.ether.now_ms()
    }

    fn wait_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }

    fn local_id(&self) -> NodeId {
        self.id
    }

    fn send(&self, frame: &Envelope) -> Result<(), RadioError> {
        let airtime = self.ether.config.airtime_ms.max(1);
        std::thread::sleep(Duration::from_millis(airtime as u64));
        self.ether.transmit(frame)
    }

    fn recv(&self) -> Option<Envelope> {
        while let Some(bytes) = self.inbox.pop() {
            match Envelope::from_bytes(&bytes) {
                Ok(frame) => return Some(frame),
                Err(e) => trace!("Sim: node {:#010x} dropped bad frame: {}", self.id, e),
            }
        }
        None
    }

    fn enable_rx(&self) {
        self.inbox.set_enabled(true);
    }

    fn disable_rx(&self) {
        self.inbox.set_enabled(false);
    }

    fn platform_name(&self) -> &'static str {
        "sim"
    }
}

// ============================================================================
// Program store
// ============================================================================

/// One role of a stored application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSpec<E> {
    pub entry: E,
    pub min: u32,
    pub max: u32,
}

/// Program images every simulated Blox has flashed
#[derive(Debug, Clone)]
pub struct SimStore<E> {
    programs: HashMap<String, Vec<RoleSpec<E>>>,
}

impl<E> Default for SimStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> SimStore<E> {
    /// Store with no programs
    pub fn new() -> Self {
        Self {
            programs: HashMap::new(),
        }
    }

    /// Add a program and the roles it registers at startup
    pub fn with_program(mut self, name: impl Into<String>, roles: Vec<RoleSpec<E>>) -> Self {
        self.programs.insert(name.into(), roles);
        self
    }

    /// Roles of a stored program
    pub fn roles(&self, name: &str) -> Option<&[RoleSpec<E>]> {
        self.programs.get(name).map(Vec::as_slice)
    }
}

impl<E> ProgramStore for SimStore<E> {
    fn has_program(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }
}

// ============================================================================
// Node lifecycle
// ============================================================================

/// Simulation failure
#[derive(Debug, Error)]
pub enum SimError {
    #[error("no image of '{0}' in the program store")]
    UnknownProgram(String),
    #[error(transparent)]
    Protocol(#[from] Error),
}

/// Role a simulated Blox ended up running
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment<E> {
    /// Program the role belongs to
    pub program: String,
    /// Role index in the program's table
    pub role_id: RoleId,
    /// Did this node act as parent?
    pub parent: bool,
    /// Program image holders the node knew of when it settled
    pub found: u32,
    /// Blox the node had started when it settled
    pub started: u32,
    /// Entry that was resumed into
    #[serde(skip)]
    pub entry: E,
}

/// How a simulated Blox finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport<E> {
    /// Hardware id
    pub node: NodeId,
    /// Boots, counting the first
    pub boots: u32,
    /// Role entered, or `None` if the node stayed in its base program
    pub assignment: Option<Assignment<E>>,
}

/// What a boot brings up
enum Boot {
    Base,
    Program(ProgramName),
}

/// One simulated Blox
pub struct SimNode<E: RoleEntry> {
    hal: SimHal,
    store: Arc<SimStore<E>>,
    config: ProtocolConfig,
    /// Survives warm resets, like reserved RAM
    resume: MemoryResumeCell<E>,
    /// Last negotiation outcome, kept for the report
    settled: Option<Assignment<E>>,
    boots: u32,
    shutdown: Arc<AtomicBool>,
}

impl<E: RoleEntry> SimNode<E> {
    /// Node on `hal` with every program in `store` flashed
    pub fn new(hal: SimHal, store: Arc<SimStore<E>>, config: ProtocolConfig) -> Self {
        Self {
            hal,
            store,
            config,
            resume: MemoryResumeCell::new(),
            settled: None,
            boots: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Power the node off from outside once `flag` is set. Only a node idling
    /// in its base program notices; negotiation always runs to the end.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Hardware id
    pub fn id(&self) -> NodeId {
        self.hal.local_id()
    }

    /// Boot and run until the node enters a role, or `budget` runs out or
    /// the node is shut down while in its base program.
    ///
    /// `start` launches a program straight away, as a user would from the
    /// base program's menu; otherwise the node idles in its base program.
    pub fn run(mut self, start: Option<&str>, budget: Duration) -> Result<NodeReport<E>, SimError> {
        let give_up = Instant::now() + budget;
        let mut boot = match start {
            Some(name) => Boot::Program(crate::types::program_name(name).map_err(Error::from)?),
            None => Boot::Base,
        };

        loop {
            self.boots += 1;
            // A reset drops whatever the radio had queued
            self.hal.disable_rx();

            boot = match boot {
                Boot::Base => match self.base_program(give_up) {
                    Some(name) => Boot::Program(name),
                    None => {
                        debug!("Sim: node {:#010x} stayed in its base program", self.id());
                        return Ok(self.report(None));
                    }
                },
                Boot::Program(name) => {
                    let roles = self
                        .store
                        .roles(&name)
                        .ok_or_else(|| SimError::UnknownProgram(name.to_string()))?;

                    match Protocol::init(&self.hal, &self.resume, &name, self.config)? {
                        Startup::Resumed(entry) => {
                            let assignment = self.settled.take().map(|a| Assignment { entry, ..a });
                            info!(
                                "Sim: node {:#010x} running '{}' after {} boots",
                                self.id(),
                                name,
                                self.boots
                            );
                            return Ok(self.report(assignment));
                        }
                        Startup::Ready(mut protocol) => {
                            for role in roles {
                                protocol
                                    .add_role(role.entry, role.min, role.max)
                                    .map_err(Error::from)?;
                            }
                            let outcome = protocol.negotiate().map_err(Error::from)?;
                            self.settled = Some(Assignment {
                                program: name.to_string(),
                                role_id: outcome.role_id,
                                parent: outcome.state == NodeState::Parent,
                                found: protocol.info().num_found,
                                started: protocol.info().num_started,
                                entry: outcome.entry,
                            });
                            // Warm reset back into the same program
                            Boot::Program(name)
                        }
                    }
                }
            };
        }
    }

    fn base_program(&self, give_up: Instant) -> Option<ProgramName> {
        let mut base = BaseListener::new(&self.hal, &*self.store, self.config);
        while Instant::now() < give_up && !self.shutdown.load(Ordering::Relaxed) {
            let deadline = self.hal.now_ms().wrapping_add(self.config.hold_period_ms);
            if let Some(name) = base.poll(deadline) {
                return Some(name);
            }
        }
        None
    }

    fn report(&self, assignment: Option<Assignment<E>>) -> NodeReport<E> {
        NodeReport {
            node: self.id(),
            boots: self.boots,
            assignment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RoleMessage;
    use crate::types::BROADCAST_ID;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Role(u8);

    impl RoleEntry for Role {
        fn enter(self) {}
    }

    #[test]
    fn test_ether_delivers_to_others_only() {
        let ether = Ether::new(EtherConfig::default().with_airtime(1));
        let a = ether.attach(1);
        let b = ether.attach(2);
        let c = ether.attach(3);
        for hal in [&a, &b, &c] {
            hal.enable_rx();
        }

        a.send(&RoleMessage::ProgAck.to_envelope(1, BROADCAST_ID)).unwrap();
        a.send(&RoleMessage::ProgAck.to_envelope(1, 3)).unwrap();

        assert!(a.recv().is_none());
        assert_eq!(b.recv().map(|f| f.dst), Some(BROADCAST_ID));
        assert!(b.recv().is_none());
        assert_eq!(c.recv().map(|f| f.dst), Some(BROADCAST_ID));
        assert_eq!(c.recv().map(|f| f.dst), Some(3));

        let stats = ether.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.delivered, 3);
    }

    #[test]
    fn test_gated_inbox_discards() {
        let ether = Ether::new(EtherConfig::default().with_airtime(1));
        let a = ether.attach(1);
        let b = ether.attach(2);
        let frame = RoleMessage::ProgAck.to_envelope(1, 2);

        a.send(&frame).unwrap();
        assert!(b.recv().is_none());

        b.enable_rx();
        a.send(&frame).unwrap();
        b.disable_rx();
        b.enable_rx();
        assert!(b.recv().is_none());
        assert_eq!(ether.stats().dropped, 1);
    }

    #[test]
    fn test_queue_depth_and_loss() {
        let ether = Ether::new(
            EtherConfig::default()
                .with_airtime(1)
                .with_rx_queue_depth(2),
        );
        let a = ether.attach(1);
        let b = ether.attach(2);
        b.enable_rx();
        let frame = RoleMessage::ProgAck.to_envelope(1, 2);
        for _ in 0..3 {
            a.send(&frame).unwrap();
        }
        assert_eq!(ether.stats().delivered, 2);
        assert_eq!(ether.stats().dropped, 1);

        let lossy = Ether::new(EtherConfig::default().with_airtime(1).with_loss_rate(1.0));
        let a = lossy.attach(1);
        let b = lossy.attach(2);
        b.enable_rx();
        a.send(&frame).unwrap();
        assert!(b.recv().is_none());
        assert_eq!(lossy.stats().lost, 1);
    }

    #[test]
    fn test_detached_radio_cannot_send() {
        let ether = Ether::new(EtherConfig::default().with_airtime(1));
        let a = ether.attach(1);
        ether.detach(1);
        assert_eq!(
            a.send(&RoleMessage::ProgAck.to_envelope(1, BROADCAST_ID)),
            Err(RadioError::Disconnected)
        );
    }

    #[test]
    fn test_lone_starter_resumes_as_parent() {
        let ether = Ether::new(EtherConfig::default().with_airtime(1));
        let store = Arc::new(SimStore::new().with_program(
            "solo",
            vec![
                RoleSpec { entry: Role(0), min: 1, max: 1 },
                RoleSpec { entry: Role(1), min: 1, max: 2 },
            ],
        ));
        let node = SimNode::new(ether.attach(1), store, ProtocolConfig::with_hold_period(10));

        let report = node.run(Some("solo"), Duration::from_secs(5)).unwrap();
        let assignment = report.assignment.unwrap();

        assert_eq!(report.boots, 2);
        assert!(assignment.parent);
        assert_eq!(assignment.role_id, 0);
        assert_eq!(assignment.entry, Role(0));
        assert_eq!(assignment.found, 1);
    }

    #[test]
    fn test_idle_node_stays_in_base_program() {
        let ether = Ether::new(EtherConfig::default());
        let store: Arc<SimStore<Role>> = Arc::new(SimStore::new());
        let node = SimNode::new(ether.attach(7), store, ProtocolConfig::with_hold_period(10));

        let report = node.run(None, Duration::from_millis(50)).unwrap();
        assert_eq!(report.node, 7);
        assert_eq!(report.boots, 1);
        assert!(report.assignment.is_none());
    }

    #[test]
    fn test_shutdown_ends_base_program() {
        let ether = Ether::new(EtherConfig::default());
        let store: Arc<SimStore<Role>> = Arc::new(SimStore::new());
        let flag = Arc::new(AtomicBool::new(true));
        let node = SimNode::new(ether.attach(7), store, ProtocolConfig::with_hold_period(10))
            .with_shutdown(flag);

        let started = Instant::now();
        let report = node.run(None, Duration::from_secs(30)).unwrap();
        assert!(report.assignment.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_program() {
        let ether = Ether::new(EtherConfig::default());
        let store: Arc<SimStore<Role>> = Arc::new(SimStore::new());
        let node = SimNode::new(ether.attach(1), store, ProtocolConfig::with_hold_period(10));

        assert!(matches!(
            node.run(Some("missing"), Duration::from_secs(1)),
            Err(SimError::UnknownProgram(name)) if name == "missing"
        ));
    }
}
