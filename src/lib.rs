#![warn(clippy::all)]

pub mod backoff;
pub mod client;
pub mod error;
pub mod gfd;
pub mod lfd;
pub mod logging;
pub mod message;
pub mod rm;
pub mod server;
pub mod wire;

pub use client::Client;
pub use error::{Error, Result};
pub use gfd::Gfd;
pub use lfd::Lfd;
pub use rm::Rm;
pub use server::Server;
