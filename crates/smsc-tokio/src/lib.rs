//! Tokio-based drivers for the SMS center connectors
//!
//! This crate runs the connector state machines of `smsc-core` on the Tokio
//! runtime: it talks AT commands to GSM modems over a serial line, raw TCP or
//! telnet, and EMI/UCP to SMS centers over TCP.
//!
//! # Features
//!
//! - Asynchronous I/O with Tokio and `tokio-serial`
//! - Modem speed and type detection
//! - EMI receive port for SMS centers that open their own connections
//! - A daemon tracking the status of every connector
//!
//! The `smsc-http` crate provides an HTTP interface to send messages through
//! the connectors and control them.

mod at;
mod daemon;
mod emi;
mod transport;

pub use at::{AtConnection, Modem};
pub use daemon::{ConnectorState, Daemon};
pub use emi::{EmiConnection, EmiListener, connect};
pub use transport::{DeviceOpener, ModemIo, Opener, Transport, open};

/// Sleeps until `deadline`, forever without one.
async fn sleep_until_deadline(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
