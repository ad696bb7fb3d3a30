//! Appliance admin-shell client.
//!
//! The storage appliance is managed exclusively through a text-oriented
//! administrative shell over SSH. This crate owns that single channel:
//! command formatting with strict identifier validation, line-oriented
//! output parsing, a token-bucket rate limit, a session circuit breaker,
//! and background reconnection with exponential backoff.

pub mod breaker;
pub mod client;
pub mod command;
pub mod error;
pub mod parser;
pub mod session;

pub use client::ShellClient;
pub use command::DiskSpec;
pub use error::{Result, ShellError};
pub use parser::DiskEntry;
pub use session::{ShellTransport, SshConfig, TransportFactory};
