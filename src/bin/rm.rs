//! A faultline replication manager: the authority over role assignment and
//! client redirection.

#![warn(clippy::all)]

use faultline::error::Result;
use faultline::message::parse_addr_table;
use faultline::Rm;

use clap::Parser;
use std::net::TcpListener;

#[derive(Parser)]
#[command(about = "A faultline replication manager.", version)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8001")]
    addr: String,

    /// Replica address table, as comma-separated ID=host:port pairs. Used
    /// to tell clients where the primary is.
    #[arg(long, default_value = "")]
    servers: String,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    faultline::logging::init(&args.log_level)?;

    let addrs = parse_addr_table(&args.servers)?.into_iter().collect();
    let listener = TcpListener::bind(&args.addr)?;
    Rm::new(addrs).serve(listener)
}
