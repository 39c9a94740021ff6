//! Protocol engines for the SMSC connectors of an SMS gateway.
//!
//! Each connector is a state machine fed with events and producing actions
//! for an I/O driver, together with [`GatewayEvent`]s for the gateway core.
//! Nothing in here performs I/O.

pub mod at;
pub mod charset;
mod config;
pub mod dcs;
mod dlr;
pub mod emi;
mod gateway;
mod queue;
pub mod septet;
mod sms;

pub use config::{
    AtConfig, AtDevice, Config, ConnectorConfig, ConnectorKind, EMI_MAX_TRN, EmiConfig,
    FlowControl, WaitAckExpire,
};
pub use dlr::{Dlr, DlrBackend, DlrEntry, DlrMask, DlrStorage, MemoryDlrStore};
pub use gateway::{ConnectorCommand, ConnectorStatus, GatewayEvent};
pub use queue::SmsQueue;
pub use sms::{Coding, FailReason, Sms, SmsType};

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

/// Next modem keepalive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tk(pub Instant);
/// Next SIM storage poll.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tp(pub Instant);
/// Next reconnect attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tr(pub Instant);
/// Deadline for the SMSC's login reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tw(pub Instant);

pub struct TxFut<T>(Option<T>);
impl<T: Unpin> Future for TxFut<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(action) = self.0.take() {
            Poll::Ready(action)
        } else {
            Poll::Pending
        }
    }
}

pub struct RxFut(Option<GatewayEvent>);
impl Future for RxFut {
    type Output = GatewayEvent;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(event) = self.0.take() {
            Poll::Ready(event)
        } else {
            Poll::Pending
        }
    }
}

/// Routes the engines' logging into the test output, filtered by `SMSC_LOG`.
#[cfg(test)]
pub(crate) fn test_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("SMSC_LOG"))
        .with_test_writer()
        .try_init()
        .ok();
}
