//! AT modem driver.

mod connection;
mod device;

pub use connection::AtConnection;
pub use device::Modem;
