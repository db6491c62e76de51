//! Blox Node - role negotiation on a simulated radio
//!
//! Runs one starter Blox and a room of base-program Blox through parent
//! election, discovery and role assignment, then prints who runs what.

mod room;

use std::path::{Path, PathBuf};
use std::time::Duration;

use blox_core::sim::EtherConfig;
use blox_core::{ConfigError, ProtocolConfig};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::room::{parse_roles, run_room, RoomConfig};

/// Simulated Blox room
#[derive(Parser, Debug)]
#[command(name = "blox-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Program every Blox has stored
    #[arg(short, long, default_value = "role_test")]
    program: String,

    /// Roles as MIN:MAX pairs, in registration order
    #[arg(short, long, default_value = "1:2,1:5")]
    roles: String,

    /// Base-program Blox besides the starter
    #[arg(short, long, default_value = "3")]
    nodes: u32,

    /// Protocol config file (JSON); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hold period in milliseconds; without --config the exchange timeout
    /// follows it at four holds
    #[arg(long)]
    hold_ms: Option<u32>,

    /// Radio airtime per frame in milliseconds
    #[arg(long, default_value = "2")]
    airtime_ms: u32,

    /// Per-receiver frame loss probability (0.0-1.0)
    #[arg(long, default_value = "0.0")]
    loss: f64,

    /// Give up after this many seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Write the full report as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Protocol settings from an optional JSON file and the `--hold-ms` flag.
///
/// A file's exchange timeout is kept as written; the built-in defaults scale
/// it with the hold period.
fn protocol_config(file: Option<&Path>, hold_ms: Option<u32>) -> Result<ProtocolConfig, ConfigError> {
    let mut protocol = match file {
        Some(path) => ProtocolConfig::load(path)?,
        // Short holds keep the demo quick; deployed radios use 1000ms
        None => ProtocolConfig::with_hold_period(50),
    };
    if let Some(hold_ms) = hold_ms {
        protocol.hold_period_ms = hold_ms;
        if file.is_none() {
            protocol.exchange_timeout_ms = hold_ms.saturating_mul(4);
        }
    }
    protocol.validate()?;
    Ok(protocol)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let protocol = protocol_config(args.config.as_deref(), args.hold_ms)?;

    let roles = parse_roles(&args.roles)?;
    let ether = EtherConfig::default()
        .with_airtime(args.airtime_ms)
        .with_loss_rate(args.loss);

    info!(
        "Blox room: '{}' with roles {:?} on {} base nodes, hold {}ms",
        args.program, roles, args.nodes, protocol.hold_period_ms
    );

    let report = run_room(RoomConfig {
        program: args.program.clone(),
        roles,
        base_nodes: args.nodes,
        protocol,
        ether,
        timeout: Duration::from_secs(args.timeout_secs),
    })
    .await?;

    println!("\nRole assignment for '{}':", report.program);
    println!("  {:<12} {:<8} {:<6} {:<7} {:>5} {:>7}", "node", "role", "parent", "boots", "found", "started");
    for node in &report.nodes {
        match &node.assignment {
            Some(a) => println!(
                "  {:<12} {:<8} {:<6} {:<7} {:>5} {:>7}",
                format!("{:#010x}", node.node),
                a.role_id,
                if a.parent { "yes" } else { "" },
                node.boots,
                a.found,
                a.started
            ),
            None => println!("  {:<12} {:<8}", format!("{:#010x}", node.node), "(base)"),
        }
    }

    println!("\nPer role:");
    for (id, (count, (min, max))) in report.role_counts().iter().zip(&report.roles).enumerate() {
        let note = if count < min { "  below minimum" } else { "" };
        println!("  role {}: {} Blox (min {}, max {}){}", id, count, min, max, note);
    }
    println!(
        "\nEther: {} frames sent, {} delivered, {} lost, {} dropped ({} ms)",
        report.ether.sent, report.ether.delivered, report.ether.lost, report.ether.dropped, report.elapsed_ms
    );

    if let Some(path) = &args.json {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        info!("Report written to: {}", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hold_flag_scales_default_exchange() {
        let protocol = protocol_config(None, Some(20)).unwrap();
        assert_eq!(protocol.hold_period_ms, 20);
        assert_eq!(protocol.exchange_timeout_ms, 80);

        let protocol = protocol_config(None, None).unwrap();
        assert_eq!(protocol.hold_period_ms, 50);
    }

    #[test]
    fn test_hold_flag_keeps_file_exchange() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"hold_period_ms": 200, "exchange_timeout_ms": 5000}}"#).unwrap();

        let protocol = protocol_config(Some(file.path()), Some(20)).unwrap();
        assert_eq!(protocol.hold_period_ms, 20);
        assert_eq!(protocol.exchange_timeout_ms, 5000);
    }

    #[test]
    fn test_zero_hold_flag_rejected() {
        assert!(protocol_config(None, Some(0)).is_err());
    }
}
