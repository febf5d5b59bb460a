//! A faultline global fault detector: aggregates LFD liveness reports into
//! the cluster membership and publishes it to the RM.

#![warn(clippy::all)]

use faultline::error::Result;
use faultline::Gfd;

use clap::Parser;
use std::net::TcpListener;
use std::time::Duration;

#[derive(Parser)]
#[command(about = "A faultline global fault detector.", version)]
struct Args {
    /// Listen address for LFD connections.
    #[arg(long, default_value = "0.0.0.0:8000")]
    addr: String,

    /// Replication manager address.
    #[arg(long)]
    rm: Option<String>,

    /// LFD heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    hb_ms: u64,

    /// LFD heartbeat timeout in milliseconds.
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    faultline::logging::init(&args.log_level)?;

    let listener = TcpListener::bind(&args.addr)?;
    Gfd::new(
        Duration::from_millis(args.hb_ms),
        Duration::from_millis(args.timeout_ms),
        args.rm,
    )
    .serve(listener)
}
