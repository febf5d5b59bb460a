//! A faultline client: sends numbered requests to the current primary,
//! either interactively or at a fixed rate with --auto.

#![warn(clippy::all)]

use faultline::error::Result;
use faultline::message::parse_addr_table;
use faultline::Client;

use clap::Parser;
use rustyline::error::ReadlineError;
use std::time::Duration;

#[derive(Parser)]
#[command(about = "A faultline client.", version)]
struct Args {
    /// Replica address table, as comma-separated ID=host:port pairs.
    #[arg(long, default_value = "S1=127.0.0.1:9001")]
    servers: String,

    /// Client identifier.
    #[arg(long, default_value = "C1")]
    id: String,

    /// The primary to use until the RM says otherwise.
    #[arg(long)]
    primary: Option<String>,

    /// Replication manager address.
    #[arg(long)]
    rm: Option<String>,

    /// Interval between automatic sends, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Send generated messages at the given interval instead of prompting.
    #[arg(long)]
    auto: bool,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    faultline::logging::init(&args.log_level)?;

    let replicas = parse_addr_table(&args.servers)?;
    let client = Client::new(args.id.clone(), replicas, args.primary, args.rm);
    client.connect()?;

    let result = if args.auto {
        run_auto(&client, Duration::from_millis(args.interval_ms))
    } else {
        run_prompt(&client, &args.id)
    };
    client.close()?;
    result
}

/// Sends a generated message at a fixed rate, forever.
fn run_auto(client: &Client, interval: Duration) -> Result<()> {
    let ticker = crossbeam::channel::tick(interval);
    for n in 1u64.. {
        ticker.recv().map_err(|err| faultline::Error::Internal(err.to_string()))?;
        match client.send(&format!("auto-{n}"))? {
            Some(reply) => {
                println!("{}: state={} (request {})", reply.server, reply.state, reply.request_num)
            }
            None => println!("request dropped or deferred"),
        }
    }
    Ok(())
}

/// Reads messages from an interactive prompt and sends each one.
fn run_prompt(client: &Client, id: &str) -> Result<()> {
    let mut editor = rustyline::DefaultEditor::new()?;
    println!("Client {id} ready. Type a message and press enter; 'quit' exits.");
    loop {
        match editor.readline(&format!("{id}> ")) {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input == "quit" {
                    return Ok(());
                }
                editor.add_history_entry(input)?;
                match client.send(input)? {
                    Some(reply) => println!(
                        "{}: state={} (request {})",
                        reply.server, reply.state, reply.request_num
                    ),
                    None => println!("request dropped or deferred"),
                }
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}
