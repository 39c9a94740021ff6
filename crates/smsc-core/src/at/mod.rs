//! GSM modem driven by AT commands.

mod event;
pub mod line;
pub mod modem;
pub mod pdu;
pub mod reply;
mod session;

pub use event::ModemEvent;
pub use line::{LineBuffer, Prompt};
pub use modem::ModemDefinition;
pub use pdu::{Decoded, ExtractedPdu};
pub use reply::{CommandStatus, ModemLine};
pub use session::{
    ModemAction, ModemContext, ModemSession, ModemState, State, StorageStep, indication_steps,
};
