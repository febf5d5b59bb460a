//! A faultline replica server: the stateful endpoint of the control plane.
//! Serves client requests while primary, answers LFD heartbeats, reports
//! state to the RM, and exchanges checkpoints with its peers.

#![warn(clippy::all)]

use faultline::error::Result;
use faultline::message::{parse_addr_table, Role, State};
use faultline::Server;

use clap::Parser;
use std::net::TcpListener;
use std::time::Duration;

#[derive(Parser)]
#[command(about = "A faultline replica server.", version)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:9001")]
    addr: String,

    /// Replica ID.
    #[arg(long, default_value = "S1")]
    rid: String,

    /// Initial counter value.
    #[arg(long, default_value_t = 0)]
    init_state: State,

    /// Startup role (primary or backup). The RM reassigns it at runtime; a
    /// replica started as primary also starts ready.
    #[arg(long, default_value = "backup")]
    role: Role,

    /// Backup replicas to checkpoint, as comma-separated ID=host:port pairs.
    #[arg(long, default_value = "")]
    backups: String,

    /// Checkpoint interval in milliseconds. 0 disables checkpointing.
    #[arg(long, default_value_t = 5000)]
    ckpt_ms: u64,

    /// Replication manager address.
    #[arg(long)]
    rm: Option<String>,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    faultline::logging::init(&args.log_level)?;

    let backups = parse_addr_table(&args.backups)?.into_iter().collect();
    let listener = TcpListener::bind(&args.addr)?;
    Server::new(
        args.rid,
        args.init_state,
        args.role,
        backups,
        Duration::from_millis(args.ckpt_ms),
        args.rm,
    )
    .serve(listener)
}
