//! A faultline local fault detector: heartbeats one replica server and
//! reports its liveness to the GFD. Exits once the server is declared
//! crashed.

#![warn(clippy::all)]

use faultline::error::Result;
use faultline::Lfd;

use clap::Parser;
use std::time::Duration;

#[derive(Parser)]
#[command(about = "A faultline local fault detector.", version)]
struct Args {
    /// Address of the server to monitor.
    #[arg(long, default_value = "127.0.0.1:9001")]
    target: String,

    /// GFD address.
    #[arg(long, default_value = "127.0.0.1:8000")]
    gfd: String,

    /// LFD identifier; the monitored server's ID is derived from it
    /// (LFD1 monitors S1).
    #[arg(long, default_value = "LFD1")]
    id: String,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    hb_ms: u64,

    /// Heartbeat timeout in milliseconds.
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,

    /// Maximum reconnection attempts before declaring a crash.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Base delay of the reconnection backoff, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    base_delay_ms: u64,

    /// Maximum delay of the reconnection backoff, in milliseconds.
    #[arg(long, default_value_t = 10000)]
    max_delay_ms: u64,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Derives the monitored server's ID from the LFD's own (LFD1 → S1).
fn server_id(lfd_id: &str) -> Result<String> {
    match lfd_id.strip_prefix("LFD") {
        Some(n) if !n.is_empty() => Ok(format!("S{n}")),
        _ => faultline::errinput!("LFD ID must look like LFD1, got {lfd_id:?}"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    faultline::logging::init(&args.log_level)?;

    let server = server_id(&args.id)?;
    let lfd = Lfd::new(
        args.id,
        server.clone(),
        args.target,
        args.gfd,
        Duration::from_millis(args.hb_ms),
        Duration::from_millis(args.timeout_ms),
        args.max_retries,
        Duration::from_millis(args.base_delay_ms),
        Duration::from_millis(args.max_delay_ms),
    );
    // run() only returns once the server has been declared crashed and the
    // DELETE has gone out; that verdict is this process's final output.
    lfd.run()?;
    println!("SERVER {server} DOWN");
    Ok(())
}
