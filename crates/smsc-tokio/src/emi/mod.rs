//! EMI/UCP connection driver and receive port.

mod connection;
mod listener;

pub use connection::{EmiConnection, connect};
pub use listener::EmiListener;
