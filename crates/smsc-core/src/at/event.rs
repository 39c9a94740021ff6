use std::time::Instant;

use crate::{
    ConnectorCommand, Sms,
    at::{CommandStatus, ExtractedPdu, ModemDefinition},
};

/// Events that drive the modem session state machine.
///
/// Apart from [`ModemEvent::Command`] and [`ModemEvent::Tick`] these report
/// the outcome of a [`crate::at::ModemAction`] executed by the device driver,
/// or something the modem sent on its own.
#[derive(Clone, Debug)]
pub enum ModemEvent {
    /// Request from the gateway core
    Command(ConnectorCommand),

    /// The device is open, with the line speed and modem type in use
    ROpened {
        now: Instant,
        speed: u32,
        modem: Box<ModemDefinition>,
    },
    /// Speed or modem detection, or opening the device failed
    ROpenFailed { now: Instant },

    /// Username and password were accepted
    RLoggedIn { now: Instant },
    RLoginFailed { now: Instant },

    /// The initialisation sequence finished
    RInitialized { now: Instant, phase2plus: bool },
    RInitFailed { now: Instant },

    /// Reading from or writing to the device failed, or the modem stopped
    /// answering
    RIoError { now: Instant },

    /// A `+CMTI`/`+CDSI` line: a message waits in the SIM storage
    RIndication { line: String },
    /// A `+CMT`, `+CDS` or `+CMGR` PDU, `stored` for the latter
    RMessage { pdu: ExtractedPdu, stored: bool },

    /// `AT+CMGS` succeeded, with the TP-MR the modem assigned
    RSubmitted { sms: Box<Sms>, msg_ref: Option<u32> },
    RSubmitFailed {
        sms: Box<Sms>,
        status: CommandStatus,
    },

    /// Periodic wakeup, at least once a second while connected
    Tick { now: Instant },
}

impl ModemEvent {
    /// The modem sent an unsolicited notification that a message was stored.
    #[must_use]
    pub fn indication(line: impl Into<String>) -> Self {
        Self::RIndication { line: line.into() }
    }
}
