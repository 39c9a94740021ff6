use std::time::Instant;

use crate::ConnectorCommand;

/// Events that drive the EMI session state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmiEvent {
    /// Request from the gateway core
    Command(ConnectorCommand),

    /// The TCP connection requested by [`crate::emi::EmiAction::Connect`] is up
    RConnected { now: Instant },
    RConnectFailed { now: Instant },
    /// A complete `STX ... ETX` packet from the main connection
    RPacket { now: Instant, packet: Vec<u8> },
    /// The main connection broke or the SMSC closed it
    RClosed { now: Instant },

    /// Periodic wakeup
    Tick { now: Instant },
}
