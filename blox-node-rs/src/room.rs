//! A room of simulated Blox negotiating one program
//!
//! One starter node launches the program from its menu; every other node
//! idles in its base program with the same image flashed. Each node runs on
//! a blocking thread; the driver waits for the starter, gives its children
//! time to resume, then powers the idle nodes off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blox_core::sim::{Ether, EtherConfig, EtherStats, NodeReport, RoleSpec, SimError, SimNode, SimStore};
use blox_core::{NodeId, ProtocolConfig, RoleEntry, ROLE_MAX};
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Hardware id of the starter node
pub const STARTER_ID: NodeId = 0x0000_0001;

/// Hardware id of the first base node
pub const FIRST_BASE_ID: NodeId = 0x0000_0100;

/// Demo role: blinks one of the board LEDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedRole(pub u8);

impl RoleEntry for LedRole {
    fn enter(self) {
        info!("Role: LED{} blinking", self.0);
    }
}

/// Room driver failure
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("bad role '{0}', expected MIN:MAX with 1 <= MIN <= MAX")]
    BadRole(String),
    #[error("{given} roles given, a program holds at most {max}")]
    TooManyRoles { given: usize, max: usize },
    #[error("room did not settle within {0:?}")]
    Timeout(Duration),
    #[error("node thread failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Sim(#[from] SimError),
}

/// Parse a role list like `1:2,1:5` into (min, max) pairs
pub fn parse_roles(list: &str) -> Result<Vec<(u32, u32)>, RoomError> {
    let roles = list
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let bad = || RoomError::BadRole(item.to_string());
            let (min, max) = item.split_once(':').ok_or_else(bad)?;
            let min: u32 = min.trim().parse().map_err(|_| bad())?;
            let max: u32 = max.trim().parse().map_err(|_| bad())?;
            if min == 0 || min > max {
                return Err(bad());
            }
            Ok((min, max))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if roles.len() > ROLE_MAX {
        return Err(RoomError::TooManyRoles {
            given: roles.len(),
            max: ROLE_MAX,
        });
    }
    Ok(roles)
}

/// Everything needed to run a room
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub program: String,
    pub roles: Vec<(u32, u32)>,
    pub base_nodes: u32,
    pub protocol: ProtocolConfig,
    pub ether: EtherConfig,
    pub timeout: Duration,
}

/// Outcome of a room run
#[derive(Debug, Serialize)]
pub struct RoomReport {
    pub program: String,
    pub roles: Vec<(u32, u32)>,
    pub elapsed_ms: u64,
    pub ether: EtherStats,
    pub nodes: Vec<NodeReport<LedRole>>,
}

impl RoomReport {
    /// Blox running each role, in role order
    pub fn role_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.roles.len()];
        for node in &self.nodes {
            if let Some(assignment) = &node.assignment {
                if let Some(count) = counts.get_mut(assignment.role_id as usize) {
                    *count += 1;
                }
            }
        }
        counts
    }
}

/// Run the room to completion
pub async fn run_room(config: RoomConfig) -> Result<RoomReport, RoomError> {
    let started = Instant::now();
    let ether = Ether::new(config.ether);
    let roles: Vec<RoleSpec<LedRole>> = config
        .roles
        .iter()
        .enumerate()
        .map(|(i, (min, max))| RoleSpec {
            entry: LedRole(u8::try_from(i + 1).unwrap_or(u8::MAX)),
            min: *min,
            max: *max,
        })
        .collect();
    let store = Arc::new(SimStore::new().with_program(config.program.clone(), roles));
    let power_off = Arc::new(AtomicBool::new(false));
    let budget = config.timeout;

    let bases: Vec<_> = (0..config.base_nodes)
        .map(|i| {
            let node = SimNode::new(ether.attach(FIRST_BASE_ID + i), store.clone(), config.protocol)
                .with_shutdown(power_off.clone());
            tokio::task::spawn_blocking(move || node.run(None, budget))
        })
        .collect();

    let starter = SimNode::new(ether.attach(STARTER_ID), store, config.protocol);
    let program = config.program.clone();
    let starter = tokio::task::spawn_blocking(move || starter.run(Some(&program), budget));

    let settle = async {
        let starter = starter.await??;
        debug!("Sim: starter settled, waiting for children");

        // Children resume within a hold or two of their ParentAck
        let grace = Duration::from_millis(config.protocol.holds(4) as u64);
        tokio::time::sleep(grace).await;
        power_off.store(true, Ordering::Relaxed);

        let mut nodes = vec![starter];
        for result in join_all(bases).await {
            nodes.push(result??);
        }
        Ok::<_, RoomError>(nodes)
    };

    let nodes = tokio::time::timeout(config.timeout + Duration::from_secs(5), settle)
        .await
        .map_err(|_| RoomError::Timeout(config.timeout))??;

    Ok(RoomReport {
        program: config.program,
        roles: config.roles,
        elapsed_ms: started.elapsed().as_millis() as u64,
        ether: ether.stats(),
        nodes,
    })
}
