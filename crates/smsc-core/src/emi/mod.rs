//! UCP/EMI (version 2) SMSC client.

pub mod convert;
mod event;
pub mod frame;
pub mod receiver;
mod session;
mod slots;

pub use event::EmiEvent;
pub use frame::{EmiKind, EmiMessage, take_packet};
pub use receiver::{Answer, EmiReceiver};
pub use session::{EmiAction, EmiContext, EmiSession, EmiState, State};
pub use slots::{Slot, SlotTable};
