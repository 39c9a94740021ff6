use std::fmt::Display;

use crate::{FailReason, Sms};

/// Operator visible connector status.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectorStatus {
    #[default]
    Connecting,
    Active,
    /// Receive-only session accepted on the listening port.
    ActiveRecv,
    Reconnecting,
    Disconnected,
    Dead,
}

impl Display for ConnectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Active => "online",
            Self::ActiveRecv => "online-recv",
            Self::Reconnecting => "re-connecting",
            Self::Disconnected => "disconnected",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Notifications from a connector to the gateway core.
///
/// Every outbound message handed to a connector comes back exactly once as
/// either [`GatewayEvent::Sent`] or [`GatewayEvent::SendFailed`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Inbound message or delivery report.
    Receive(Sms),
    Sent {
        sms: Sms,
        extra: Option<String>,
    },
    SendFailed {
        sms: Sms,
        reason: FailReason,
        text: String,
    },
    Connected,
    Killed,
    Status(ConnectorStatus),
}

impl GatewayEvent {
    #[must_use]
    pub fn send_failed(sms: Sms, reason: FailReason, text: impl Into<String>) -> Self {
        Self::SendFailed {
            sms,
            reason,
            text: text.into(),
        }
    }
}

/// Requests from the gateway core to a connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectorCommand {
    /// Open the connection to the modem or SMSC
    Connect,
    /// Queue an outbound message
    Send(Box<Sms>),
    /// Resume handling inbound operations after [`ConnectorCommand::Stop`]
    Start,
    /// Keep the connection but leave inbound operations unanswered
    Stop,
    /// Tear the connector down, after the queue is empty if `finish` is set
    Shutdown { finish: bool },
}
