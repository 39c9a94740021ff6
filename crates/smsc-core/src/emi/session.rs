use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use statig::{
    Response, StateOrSuperstate,
    prelude::{InitializedStateMachine, IntoStateMachineExt as _},
    state_machine,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    ConnectorCommand, ConnectorConfig, ConnectorStatus, Dlr, EmiConfig, FailReason, GatewayEvent,
    RxFut, Sms, SmsQueue, Tr, Tw, TxFut,
    config::{FlowControl, WaitAckExpire},
    emi::{
        EmiEvent, EmiMessage, SlotTable, convert,
        frame::{self, reply},
        receiver,
    },
};

/// Minimum time between two ack timeout sweeps.
const CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Minimum time to wait for the login reply.
const MIN_LOGIN_WAIT: Duration = Duration::from_secs(30);

/// Work for the connection driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmiAction {
    /// Open the main TCP connection
    Connect { host: String, port: u16 },
    /// Write one packet to the main connection
    Send(EmiMessage),
    Close,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EmiContext {
    actions: VecDeque<EmiAction>,
    events: VecDeque<GatewayEvent>,
}
impl EmiContext {
    pub fn poll_action(&mut self) -> Option<EmiAction> {
        self.actions.pop_front()
    }
    pub fn action_future(&mut self) -> TxFut<EmiAction> {
        TxFut(self.poll_action())
    }
    pub fn poll_event(&mut self) -> Option<GatewayEvent> {
        self.events.pop_front()
    }
    pub fn event_future(&mut self) -> RxFut {
        RxFut(self.poll_event())
    }
}

#[derive(Debug, Clone)]
pub struct EmiSession(InitializedStateMachine<EmiState>);
impl Deref for EmiSession {
    type Target = InitializedStateMachine<EmiState>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl DerefMut for EmiSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
impl EmiSession {
    pub fn new(
        name: &str,
        connector: &ConnectorConfig,
        config: EmiConfig,
        dlr: Dlr,
        ctx: &mut EmiContext,
    ) -> Self {
        let sm = EmiState {
            name: name.to_owned(),
            smsc_id: connector.smsc_id.clone().unwrap_or_else(|| name.to_owned()),
            config,
            reconnect_delay: connector.reconnect_delay,
            throughput: connector.throughput,
            status: ConnectorStatus::Connecting,
            stopped: false,
            alternate: false,
            can_write: true,
            last_activity: None,
            check_time: None,
            shutdown: None,
            queue: SmsQueue::new(),
            slots: SlotTable::new(),
            sent: VecDeque::new(),
            dlr,
        }
        .uninitialized_state_machine()
        .init_with_context(ctx);
        Self(sm)
    }

    /// When the next [`EmiEvent::Tick`] is due, `None` while only I/O or a
    /// command can move the session on.
    #[must_use]
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let shutdown = self.shutdown.is_some();
        match self.state() {
            State::LoggingIn { deadline } => Some(if shutdown { now } else { deadline.0 }),
            State::Active {} => self.active_deadline(now),
            State::Parked {} => self.parked_deadline(now),
            State::Reconnecting { retry } => Some(if shutdown { now } else { retry.0 }),
            State::Idle {} | State::Connecting {} | State::Dead {} | State::Error {} => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmiState {
    pub name: String,
    pub smsc_id: String,
    pub config: EmiConfig,
    pub reconnect_delay: Duration,
    pub throughput: Option<u32>,
    pub status: ConnectorStatus,
    /// Inbound operations are left unanswered while stopped.
    pub stopped: bool,
    /// The current connection attempt goes to the alternate SMSC.
    alternate: bool,
    /// Stop-and-wait gate, opened by every reply.
    can_write: bool,
    /// Last alert or submit, `None` forces a keepalive.
    last_activity: Option<Instant>,
    check_time: Option<Instant>,
    /// Set once shut down, `true` to finish the queue first.
    shutdown: Option<bool>,
    queue: SmsQueue,
    slots: SlotTable,
    /// Send instants of the last second, for throughput limiting.
    sent: VecDeque<Instant>,
    dlr: Dlr,
}

impl EmiState {
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn unacked(&self) -> usize {
        self.slots.unacked()
    }

    #[must_use]
    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    fn enqueue(&mut self, sms: &Sms) {
        debug!("EMI2[{}]: queueing {sms}", self.name);
        self.queue.push(sms.clone());
    }

    fn set_status(&mut self, context: &mut EmiContext, status: ConnectorStatus) {
        if self.status != status {
            self.status = status;
            context.events.push_back(GatewayEvent::Status(status));
        }
    }

    fn has_alternate(&self) -> bool {
        self.config.alt_host.is_some() || self.config.alt_port.is_some()
    }

    fn can_send(&self) -> bool {
        (self.can_write || self.config.flow_control == FlowControl::Windowed)
            && self.slots.unacked() < self.config.window
            && self.shutdown != Some(false)
    }

    fn keepalive_due(&self, now: Instant) -> Option<Instant> {
        let keepalive = self.config.keepalive.filter(|k| !k.is_zero())?;
        self.can_send()
            .then(|| self.last_activity.map_or(now, |t| t + keepalive))
    }

    fn needs_keepalive(&self, now: Instant) -> bool {
        self.keepalive_due(now).is_some_and(|due| due <= now)
    }

    fn idle_due(&self, now: Instant) -> Option<Instant> {
        let idle = self.config.idle_timeout.filter(|i| !i.is_zero())?;
        (self.slots.unacked() == 0).then(|| self.last_activity.map_or(now, |t| t + idle))
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.idle_due(now).is_some_and(|due| due <= now)
    }

    /// When the throughput limit lets the next message go.
    fn throughput_free(&self, now: Instant) -> Instant {
        let Some(limit) = self
            .throughput
            .filter(|t| *t > 0)
            .and_then(|t| usize::try_from(t).ok())
        else {
            return now;
        };
        match self.sent.len().checked_sub(limit) {
            Some(oldest) => (self.sent[oldest] + Duration::from_secs(1)).max(now),
            None => now,
        }
    }

    fn active_deadline(&self, now: Instant) -> Option<Instant> {
        let unacked = self.slots.unacked();
        if self.shutdown.is_some() && unacked == 0 && self.queue.is_empty() {
            return Some(now);
        }
        let sweep = (unacked > 0).then(|| self.check_time.map_or(now, |t| t + CHECK_INTERVAL));
        let send = (self.can_send() && !self.queue.is_empty()).then(|| self.throughput_free(now));
        [sweep, send, self.keepalive_due(now), self.idle_due(now)]
            .into_iter()
            .flatten()
            .min()
    }

    fn parked_deadline(&self, now: Instant) -> Option<Instant> {
        let finished = self.shutdown.is_some() && self.queue.is_empty();
        if finished || (self.can_send() && !self.queue.is_empty()) {
            return Some(now);
        }
        self.keepalive_due(now)
    }

    fn transmit(&mut self, context: &mut EmiContext, msg: EmiMessage, now: Instant) {
        if msg.ot == 60 {
            debug!(
                "EMI2[{}]: Sending operation type 60, message with password not shown in log file.",
                self.name
            );
        } else {
            debug!("EMI2[{}]: emi2 sending packet: <{msg}>", self.name);
        }
        if msg.is_operation() && matches!(msg.ot, 31 | 51) {
            self.last_activity = Some(now);
        }
        context.actions.push_back(EmiAction::Send(msg));
    }

    /// Starts a connection attempt to the primary or the alternate SMSC.
    fn attempt(&mut self, context: &mut EmiContext, alternate: bool) -> Response<State> {
        self.alternate = alternate;
        let (host, port) = if alternate {
            info!("EMI2[{}]: connecting to Alternate SMSC", self.name);
            (
                self.config
                    .alt_host
                    .clone()
                    .unwrap_or_else(|| self.config.host.clone()),
                self.config.alt_port.unwrap_or(self.config.port),
            )
        } else {
            info!("EMI2[{}]: connecting to Primary SMSC", self.name);
            (self.config.host.clone(), self.config.port)
        };
        context.actions.push_back(EmiAction::Connect { host, port });
        Response::Transition(State::connecting())
    }

    /// Begins a new round of connection attempts, primary first.
    fn open(&mut self, context: &mut EmiContext) -> Response<State> {
        if self.status == ConnectorStatus::Active {
            self.set_status(context, ConnectorStatus::Reconnecting);
        }
        self.attempt(context, false)
    }

    /// After a failed attempt: the alternate SMSC is tried at once after the
    /// primary, otherwise the next round waits for the reconnect delay.
    fn attempt_failed(&mut self, context: &mut EmiContext, now: Instant) -> Response<State> {
        if self.shutdown.is_some() {
            return self.kill(context);
        }
        if !self.alternate && self.has_alternate() {
            return self.attempt(context, true);
        }
        error!(
            "EMI2[{}]: Couldn't connect to SMS center (retrying in {} seconds).",
            self.name,
            self.reconnect_delay.as_secs()
        );
        Response::Transition(State::reconnecting(Tr(now + self.reconnect_delay)))
    }

    fn connected(&mut self, context: &mut EmiContext) -> Response<State> {
        self.can_write = true;
        self.check_time = None;
        self.set_status(context, ConnectorStatus::Active);
        context.events.push_back(GatewayEvent::Connected);
        Response::Transition(State::active())
    }

    /// Hands every message still waiting for a reply back to the queue.
    fn clear_sent(&mut self) {
        for sms in self.slots.clear_sent() {
            self.queue.push(sms);
        }
    }

    fn close_and_reconnect(&mut self, context: &mut EmiContext) -> Response<State> {
        context.actions.push_back(EmiAction::Close);
        self.clear_sent();
        if self.shutdown.is_some() {
            return self.kill(context);
        }
        self.open(context)
    }

    fn kill(&mut self, context: &mut EmiContext) -> Response<State> {
        self.clear_sent();
        for sms in self.queue.drain() {
            context
                .events
                .push_back(GatewayEvent::send_failed(sms, FailReason::Shutdown, ""));
        }
        self.set_status(context, ConnectorStatus::Dead);
        debug!("EMI2[{}]: connection has completed shutdown.", self.name);
        context.events.push_back(GatewayEvent::Killed);
        Response::Transition(State::dead())
    }

    /// Marks the connector as shutting down. Without `finish` the queue is
    /// failed right away; replies still due are waited for while connected.
    fn shutdown(&mut self, context: &mut EmiContext, finish: bool) {
        debug!(
            "EMI2[{}]: Shutting down SMSCConn, {}",
            self.name,
            if finish { "slow" } else { "fast" }
        );
        self.shutdown = Some(finish);
        if !finish {
            for sms in self.queue.drain() {
                context
                    .events
                    .push_back(GatewayEvent::send_failed(sms, FailReason::Shutdown, ""));
            }
        }
    }

    fn control(&mut self, context: &mut EmiContext, command: &ConnectorCommand) {
        match command {
            ConnectorCommand::Send(sms) => self.enqueue(sms),
            ConnectorCommand::Start => self.stopped = false,
            ConnectorCommand::Stop => self.stopped = true,
            ConnectorCommand::Shutdown { finish } => self.shutdown(context, *finish),
            ConnectorCommand::Connect => (),
        }
    }

    /// Input from a connection that was already given up.
    fn stale(&self, event: &EmiEvent) {
        debug!(
            "EMI2[{}]: ignoring {event:?} from the closed connection",
            self.name
        );
    }

    fn parse(&self, packet: &[u8]) -> Option<EmiMessage> {
        debug!(
            "EMI2[{}]: emi2 parsing packet: <{}>",
            self.name,
            String::from_utf8_lossy(packet)
        );
        let msg = match EmiMessage::from_bytes(packet) {
            Ok(msg) => msg,
            Err(e) => {
                error!(
                    "EMI2[{}]: Invalid EMI packet: {} ({e})",
                    self.name,
                    String::from_utf8_lossy(packet)
                );
                return None;
            }
        };
        if let Some(code) = msg.error_code() {
            error!(
                "EMI2[{}]: Got negative ack. op:{}, trn:{}, error:{code} ({}), message:{}",
                self.name,
                msg.ot,
                msg.trn,
                frame::error_text(code),
                msg.field(reply::SM).unwrap_or_default()
            );
        }
        Some(msg)
    }

    fn operation(&mut self, context: &mut EmiContext, op: &EmiMessage, now: Instant) {
        if self.stopped {
            info!(
                "EMI2[{}]: Ignoring operation from main socket because the connection is stopped.",
                self.name
            );
            return;
        }
        let Some(answer) = receiver::answer(&self.name, &self.config, &self.smsc_id, &self.dlr, op)
        else {
            return;
        };
        if let Some(sms) = answer.received {
            context.events.push_back(GatewayEvent::Receive(sms));
        }
        self.transmit(context, answer.reply, now);
    }

    fn acknowledged(&mut self, context: &mut EmiContext, ack: &EmiMessage) {
        let Some(slot) = self.slots.ack(ack.trn, ack.ot) else {
            error!(
                "EMI2[{}]: Got ack for TRN {}, don't remember sending O?",
                self.name, ack.trn
            );
            return;
        };
        self.can_write = true;
        if slot.ot != 51 {
            return;
        }
        let Some(mut sms) = slot.sms else {
            error!("EMI2[{}]: reply to TRN {} has no message", self.name, ack.trn);
            return;
        };
        if ack.is_positive() {
            let ts = ack
                .field(reply::SM)
                .and_then(|sm| sm.split_once(':'))
                .filter(|(adc, _)| !adc.is_empty())
                .map(|(_, ts)| ts.to_owned());
            if let Some(ts) = ts {
                if sms.dlr_mask.is_enabled_device() {
                    self.dlr.add(&self.smsc_id, &ts, &mut sms, true);
                }
            }
            context
                .events
                .push_back(GatewayEvent::Sent { sms, extra: None });
        } else {
            let text = format!(
                "{}-{}",
                ack.field(reply::EC).unwrap_or_default(),
                ack.field(reply::SM).unwrap_or_default()
            );
            context
                .events
                .push_back(GatewayEvent::send_failed(sms, FailReason::Rejected, text));
        }
    }

    fn throughput_exceeded(&mut self, now: Instant) -> bool {
        let Some(limit) = self.throughput.filter(|t| *t > 0) else {
            return false;
        };
        while self
            .sent
            .front()
            .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(1))
        {
            self.sent.pop_front();
        }
        self.sent.len() >= usize::try_from(limit).unwrap_or(usize::MAX)
    }

    fn keepalive(&mut self, context: &mut EmiContext, now: Instant) {
        self.last_activity = Some(now);
        let Some(trn) = self.slots.next_trn() else {
            return;
        };
        if let Some(alert) = convert::alert(&self.config, trn) {
            self.slots.occupy(trn, 31, now, None);
            self.transmit(context, alert, now);
        }
        self.can_write = false;
    }

    /// Sends queued messages while the window allows.
    fn send_queued(&mut self, context: &mut EmiContext, now: Instant) {
        while self.can_send() && !self.queue.is_empty() {
            if self.throughput_exceeded(now) {
                break;
            }
            let Some(trn) = self.slots.next_trn() else {
                break;
            };
            let Some(sms) = self.queue.pop() else {
                break;
            };
            match convert::submit(&self.name, &self.config, &sms, trn) {
                Ok(msg) => {
                    self.sent.push_back(now);
                    self.slots.occupy(trn, 51, now, Some(sms));
                    self.transmit(context, msg, now);
                    self.can_write = false;
                }
                Err(e) => {
                    error!("EMI2[{}]: could not build submit: {e}", self.name);
                    context.events.push_back(GatewayEvent::send_failed(
                        sms,
                        FailReason::Malformed,
                        e.to_string(),
                    ));
                }
            }
        }
    }

    /// Applies the expiry policy to operations whose reply is overdue.
    /// Returns `true` if the connection must be dropped.
    fn sweep(&mut self, now: Instant) -> bool {
        if self.slots.unacked() == 0 || self.check_time.is_some_and(|t| now < t + CHECK_INTERVAL)
        {
            return false;
        }
        self.check_time = Some(now);
        let waitack = self.config.waitack.as_secs();
        for trn in self.slots.expired(now, self.config.waitack) {
            let Some(slot) = self.slots.get(trn) else {
                continue;
            };
            if slot.ot == 31 {
                warn!(
                    "EMI2[{}]: Alert (operation 31) was not ACKed within {waitack} seconds",
                    self.name
                );
                if self.config.flow_control == FlowControl::StopAndWait {
                    self.can_write = true;
                }
                continue;
            }
            match self.config.waitack_expire {
                WaitAckExpire::Disconnect => {
                    warn!(
                        "EMI2[{}]: received neither ACK nor NACK for message {trn} in {waitack} seconds, disconnecting and reconnection",
                        self.name
                    );
                    info!("EMI2[{}]: closing connection.", self.name);
                    return true;
                }
                WaitAckExpire::Resend => {
                    warn!(
                        "EMI2[{}]: received neither ACK nor NACK for message {trn} in {waitack} seconds, resending message",
                        self.name
                    );
                    if let Some(sms) = self.slots.ack(trn, 51).and_then(|s| s.sms) {
                        self.queue.push(sms);
                    }
                    if self.config.flow_control == FlowControl::StopAndWait {
                        self.can_write = true;
                    }
                }
                WaitAckExpire::Wait => {
                    warn!(
                        "EMI2[{}]: received neither ACK nor NACK for message {trn} in {waitack} seconds, carrying on waiting",
                        self.name
                    );
                }
            }
        }
        false
    }
}

#[state_machine(
    initial = "State::idle()",
    before_dispatch = "Self::before_dispatch",
    after_dispatch = "Self::after_dispatch",
    before_transition = "Self::before_transition",
    after_transition = "Self::after_transition",
    state(derive(Clone, Debug, PartialEq, Eq)),
    superstate(derive(Clone, Debug))
)]
impl EmiState {
    #[expect(clippy::needless_pass_by_value, reason = "due to macro")]
    fn before_dispatch(&mut self, state: StateOrSuperstate<State, Superstate>, event: &EmiEvent) {
        trace!(
            "EMI2[{}]: before dispatching `{:?}` to `{:?}`",
            self.name, event, state
        );
    }
    #[expect(clippy::needless_pass_by_value, reason = "due to macro")]
    fn after_dispatch(&mut self, state: StateOrSuperstate<State, Superstate>, event: &EmiEvent) {
        trace!(
            "EMI2[{}]: after dispatching `{:?}` to `{:?}`",
            self.name, event, state
        );
    }
    fn before_transition(&mut self, next: &State, prev: &State) {
        trace!(
            "EMI2[{}]: before transitioning from `{:?}` to `{:?}`",
            self.name, prev, next
        );
    }
    fn after_transition(&mut self, prev: &State, next: &State) {
        trace!(
            "EMI2[{}]: after transitioning from `{:?}` to `{:?}`",
            self.name, prev, next
        );
    }

    #[state]
    fn idle(&mut self, context: &mut EmiContext, event: &EmiEvent) -> Response<State> {
        match event {
            EmiEvent::Command(ConnectorCommand::Connect) => self.open(context),
            EmiEvent::Command(ConnectorCommand::Shutdown { finish }) => {
                self.shutdown(context, *finish);
                self.kill(context)
            }
            EmiEvent::Command(command) => {
                self.control(context, command);
                Response::Handled
            }
            EmiEvent::Tick { .. } => Response::Handled,
            EmiEvent::RConnected { .. }
            | EmiEvent::RConnectFailed { .. }
            | EmiEvent::RPacket { .. }
            | EmiEvent::RClosed { .. } => {
                error!("Unexpected Event {event:?} in IDLE");
                Response::Transition(State::error())
            }
        }
    }

    #[state]
    fn connecting(&mut self, context: &mut EmiContext, event: &EmiEvent) -> Response<State> {
        match event {
            EmiEvent::RConnected { now } => {
                if self.shutdown.is_some() {
                    context.actions.push_back(EmiAction::Close);
                    return self.kill(context);
                }
                let Some(login) = convert::login(&self.config) else {
                    return self.connected(context);
                };
                self.transmit(context, login, *now);
                let wait = self.config.waitack.max(MIN_LOGIN_WAIT);
                Response::Transition(State::logging_in(Tw(*now + wait)))
            }
            EmiEvent::RConnectFailed { now } => {
                error!(
                    "EMI2[{}]: opening TCP connection to {} failed",
                    self.name, self.config.host
                );
                self.attempt_failed(context, *now)
            }
            EmiEvent::Command(command) => {
                self.control(context, command);
                Response::Handled
            }
            EmiEvent::Tick { .. } => Response::Handled,
            EmiEvent::RPacket { .. } | EmiEvent::RClosed { .. } => {
                self.stale(event);
                Response::Handled
            }
        }
    }

    #[state]
    fn logging_in(
        &mut self,
        context: &mut EmiContext,
        event: &EmiEvent,
        deadline: &Tw,
    ) -> Response<State> {
        match event {
            EmiEvent::RPacket { now, packet } => {
                let Some(msg) = self.parse(packet) else {
                    return Response::Handled;
                };
                if msg.ot != 60 || msg.trn != 0 || msg.is_operation() {
                    warn!(
                        "EMI2[{}]: ignoring message {msg} while waiting for ack to ot:60 trn:0",
                        self.name
                    );
                    return Response::Handled;
                }
                if !msg.is_positive() {
                    error!("EMI2[{}]: Server rejected our login", self.name);
                    context.actions.push_back(EmiAction::Close);
                    return self.attempt_failed(context, *now);
                }
                // keepalive right after login
                self.last_activity = None;
                self.connected(context)
            }
            EmiEvent::Tick { now } if *now >= deadline.0 || self.shutdown.is_some() => {
                error!(
                    "EMI2[{}]: Got no reply to login attempt within {} seconds",
                    self.name,
                    self.config.waitack.max(MIN_LOGIN_WAIT).as_secs()
                );
                context.actions.push_back(EmiAction::Close);
                self.attempt_failed(context, *now)
            }
            EmiEvent::RClosed { now } => {
                error!("EMI2[{}]: connection closed in wait_for_ack", self.name);
                context.actions.push_back(EmiAction::Close);
                self.attempt_failed(context, *now)
            }
            EmiEvent::Command(command) => {
                self.control(context, command);
                Response::Handled
            }
            EmiEvent::Tick { .. } => Response::Handled,
            EmiEvent::RConnected { .. } | EmiEvent::RConnectFailed { .. } => {
                error!("Unexpected Event {event:?} in LOGGING_IN");
                Response::Transition(State::error())
            }
        }
    }

    #[state]
    fn active(&mut self, context: &mut EmiContext, event: &EmiEvent) -> Response<State> {
        match event {
            EmiEvent::Tick { now } => {
                let now = *now;
                if self.sweep(now) {
                    return self.close_and_reconnect(context);
                }
                if self.needs_keepalive(now) {
                    self.keepalive(context, now);
                }
                self.send_queued(context, now);
                if self.shutdown.is_some() && self.slots.unacked() == 0 && self.queue.is_empty() {
                    context.actions.push_back(EmiAction::Close);
                    return self.kill(context);
                }
                if self.is_idle(now) {
                    info!("EMI2[{}]: closing idle connection.", self.name);
                    context.actions.push_back(EmiAction::Close);
                    return Response::Transition(State::parked());
                }
                Response::Handled
            }
            EmiEvent::RPacket { now, packet } => {
                debug!("EMI2[{}]: Got packet from the main socket", self.name);
                let Some(msg) = self.parse(packet) else {
                    return Response::Handled;
                };
                if msg.is_operation() {
                    self.operation(context, &msg, *now);
                } else {
                    self.acknowledged(context, &msg);
                }
                Response::Handled
            }
            EmiEvent::RClosed { .. } => {
                info!("EMI2[{}]: Main connection closed by SMSC", self.name);
                self.close_and_reconnect(context)
            }
            EmiEvent::Command(command) => {
                self.control(context, command);
                Response::Handled
            }
            EmiEvent::RConnected { .. } | EmiEvent::RConnectFailed { .. } => {
                error!("Unexpected Event {event:?} in ACTIVE");
                Response::Transition(State::error())
            }
        }
    }

    /// Closed for idleness, reopened once there is something to send.
    #[state]
    fn parked(&mut self, context: &mut EmiContext, event: &EmiEvent) -> Response<State> {
        match event {
            EmiEvent::Tick { now } => {
                if self.shutdown.is_some() && self.queue.is_empty() {
                    return self.kill(context);
                }
                if self.needs_keepalive(*now) || (self.can_send() && !self.queue.is_empty()) {
                    return self.open(context);
                }
                Response::Handled
            }
            EmiEvent::Command(command) => {
                self.control(context, command);
                Response::Handled
            }
            EmiEvent::RPacket { .. } | EmiEvent::RClosed { .. } => {
                self.stale(event);
                Response::Handled
            }
            EmiEvent::RConnected { .. } | EmiEvent::RConnectFailed { .. } => {
                error!("Unexpected Event {event:?} in PARKED");
                Response::Transition(State::error())
            }
        }
    }

    #[state]
    fn reconnecting(
        &mut self,
        context: &mut EmiContext,
        event: &EmiEvent,
        retry: &Tr,
    ) -> Response<State> {
        match event {
            EmiEvent::Tick { .. } if self.shutdown.is_some() => self.kill(context),
            EmiEvent::Tick { now } if *now >= retry.0 => self.attempt(context, false),
            EmiEvent::Command(command) => {
                self.control(context, command);
                Response::Handled
            }
            EmiEvent::Tick { .. } => Response::Handled,
            EmiEvent::RPacket { .. } | EmiEvent::RClosed { .. } => {
                self.stale(event);
                Response::Handled
            }
            EmiEvent::RConnected { .. } | EmiEvent::RConnectFailed { .. } => {
                error!("Unexpected Event {event:?} in RECONNECTING");
                Response::Transition(State::error())
            }
        }
    }

    #[state]
    fn dead(&mut self, context: &mut EmiContext, event: &EmiEvent) -> Response<State> {
        if let EmiEvent::Command(ConnectorCommand::Send(sms)) = event {
            context.events.push_back(GatewayEvent::send_failed(
                sms.as_ref().clone(),
                FailReason::Shutdown,
                "connector is shut down",
            ));
        }
        Response::Handled
    }

    #[state]
    fn error() -> Response<State> {
        Response::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ConnectorKind, DlrMask,
        emi::frame::{e01, e50},
    };

    fn session(config: EmiConfig) -> (EmiSession, EmiContext) {
        crate::test_logging();
        let mut ctx = EmiContext::default();
        let connector = ConnectorConfig::new(ConnectorKind::Emi(config.clone()));
        let mut session = EmiSession::new("smsc", &connector, config, Dlr::default(), &mut ctx);
        session.handle_with_context(&EmiEvent::Command(ConnectorCommand::Connect), &mut ctx);
        (session, ctx)
    }

    fn actions(ctx: &mut EmiContext) -> Vec<EmiAction> {
        std::iter::from_fn(|| ctx.poll_action()).collect()
    }

    fn events(ctx: &mut EmiContext) -> Vec<GatewayEvent> {
        std::iter::from_fn(|| ctx.poll_event()).collect()
    }

    fn sent(ctx: &mut EmiContext) -> Vec<EmiMessage> {
        actions(ctx)
            .into_iter()
            .filter_map(|a| match a {
                EmiAction::Send(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn active(config: EmiConfig, now: Instant) -> (EmiSession, EmiContext) {
        let (mut session, mut ctx) = session(config);
        session.handle_with_context(&EmiEvent::RConnected { now }, &mut ctx);
        actions(&mut ctx);
        events(&mut ctx);
        (session, ctx)
    }

    fn send(session: &mut EmiSession, ctx: &mut EmiContext, sms: Sms) {
        session.handle_with_context(
            &EmiEvent::Command(ConnectorCommand::Send(Box::new(sms))),
            ctx,
        );
    }

    fn packet(session: &mut EmiSession, ctx: &mut EmiContext, msg: &EmiMessage, now: Instant) {
        session.handle_with_context(
            &EmiEvent::RPacket {
                now,
                packet: msg.to_bytes(),
            },
            ctx,
        );
    }

    fn ack(trn: u8, sm: &str) -> EmiMessage {
        let mut ack = EmiMessage::reply(51, trn, true).unwrap();
        ack.set(reply::SM, sm);
        ack
    }

    #[test]
    fn connect_without_login() {
        let (mut session, mut ctx) = session(EmiConfig::new("smsc.example.com", 5000));
        assert_eq!(
            actions(&mut ctx),
            [EmiAction::Connect {
                host: "smsc.example.com".to_owned(),
                port: 5000
            }]
        );
        session.handle_with_context(&EmiEvent::RConnected { now: Instant::now() }, &mut ctx);
        assert_eq!(*session.state(), State::active());
        assert_eq!(
            events(&mut ctx),
            [
                GatewayEvent::Status(ConnectorStatus::Active),
                GatewayEvent::Connected
            ]
        );
    }

    #[test]
    fn login_then_keepalive() {
        let now = Instant::now();
        let mut config = EmiConfig::new("smsc", 5000);
        config.username = Some("user".to_owned());
        config.password = Some("pw".to_owned());
        config.keepalive = Some(Duration::from_secs(60));
        let (mut session, mut ctx) = session(config);
        actions(&mut ctx);

        session.handle_with_context(&EmiEvent::RConnected { now }, &mut ctx);
        let login = sent(&mut ctx);
        assert_eq!(login.len(), 1);
        assert_eq!(login[0].ot, 60);
        assert_eq!(
            *session.state(),
            State::logging_in(Tw(now + Duration::from_secs(60)))
        );

        // an unrelated packet is ignored
        packet(&mut session, &mut ctx, &EmiMessage::operation(31, 3).unwrap(), now);
        assert_eq!(*session.state(), State::logging_in(Tw(now + Duration::from_secs(60))));

        packet(&mut session, &mut ctx, &EmiMessage::reply(60, 0, true).unwrap(), now);
        assert_eq!(*session.state(), State::active());

        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        let alert = sent(&mut ctx);
        assert_eq!(alert.len(), 1);
        assert_eq!(alert[0].ot, 31);
        assert_eq!(alert[0].field(0), Some("user"));
        assert_eq!(session.unacked(), 1);

        // not due again until the keepalive interval passed
        packet(&mut session, &mut ctx, &EmiMessage::reply(31, alert[0].trn, true).unwrap(), now);
        session.handle_with_context(&EmiEvent::Tick { now: now + Duration::from_secs(30) }, &mut ctx);
        assert!(sent(&mut ctx).is_empty());
        session.handle_with_context(&EmiEvent::Tick { now: now + Duration::from_secs(61) }, &mut ctx);
        assert_eq!(sent(&mut ctx).len(), 1);
    }

    #[test]
    fn rejected_login_tries_alternate() {
        let now = Instant::now();
        let mut config = EmiConfig::new("primary", 5000);
        config.alt_host = Some("alternate".to_owned());
        config.username = Some("user".to_owned());
        config.password = Some("pw".to_owned());
        let (mut session, mut ctx) = session(config);
        actions(&mut ctx);
        session.handle_with_context(&EmiEvent::RConnected { now }, &mut ctx);
        actions(&mut ctx);

        let mut nack = EmiMessage::reply(60, 0, false).unwrap();
        nack.set(reply::EC, "07");
        packet(&mut session, &mut ctx, &nack, now);
        assert_eq!(
            actions(&mut ctx),
            [
                EmiAction::Close,
                EmiAction::Connect {
                    host: "alternate".to_owned(),
                    port: 5000
                }
            ]
        );

        // the alternate failing too waits before the next round
        session.handle_with_context(&EmiEvent::RConnectFailed { now }, &mut ctx);
        assert_eq!(
            *session.state(),
            State::reconnecting(Tr(now + Duration::from_secs(10)))
        );
        session.handle_with_context(&EmiEvent::Tick { now: now + Duration::from_secs(10) }, &mut ctx);
        assert_eq!(
            actions(&mut ctx),
            [EmiAction::Connect {
                host: "primary".to_owned(),
                port: 5000
            }]
        );
    }

    #[test]
    fn input_after_rejected_login_is_ignored() {
        let now = Instant::now();
        let mut config = EmiConfig::new("smsc", 5000);
        config.username = Some("user".to_owned());
        config.password = Some("pw".to_owned());
        let (mut session, mut ctx) = session(config);
        session.handle_with_context(&EmiEvent::RConnected { now }, &mut ctx);
        actions(&mut ctx);

        // the nack and an alert arrive in the same read
        packet(&mut session, &mut ctx, &EmiMessage::reply(60, 0, false).unwrap(), now);
        let retry = State::reconnecting(Tr(now + Duration::from_secs(10)));
        assert_eq!(*session.state(), retry);
        assert_eq!(actions(&mut ctx), [EmiAction::Close]);
        packet(&mut session, &mut ctx, &EmiMessage::operation(31, 1).unwrap(), now);
        session.handle_with_context(&EmiEvent::RClosed { now }, &mut ctx);
        assert_eq!(*session.state(), retry);
        assert!(actions(&mut ctx).is_empty());
        assert!(events(&mut ctx).is_empty());
    }

    #[test]
    fn next_deadline_follows_login_keepalive_and_sweep() {
        let now = Instant::now();
        let mut config = EmiConfig::new("smsc", 5000);
        config.username = Some("user".to_owned());
        config.password = Some("pw".to_owned());
        config.keepalive = Some(Duration::from_secs(60));
        let (mut session, mut ctx) = session(config);
        assert_eq!(session.next_deadline(now), None);
        session.handle_with_context(&EmiEvent::RConnected { now }, &mut ctx);
        assert_eq!(session.next_deadline(now), Some(now + Duration::from_secs(60)));
        packet(&mut session, &mut ctx, &EmiMessage::reply(60, 0, true).unwrap(), now);
        actions(&mut ctx);

        // the first keepalive right away, then the sweep of its slot
        assert_eq!(session.next_deadline(now), Some(now));
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        let alert = sent(&mut ctx);
        assert_eq!(session.next_deadline(now), Some(now));
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        assert_eq!(session.next_deadline(now), Some(now + CHECK_INTERVAL));

        packet(&mut session, &mut ctx, &EmiMessage::reply(31, alert[0].trn, true).unwrap(), now);
        assert_eq!(session.next_deadline(now), Some(now + Duration::from_secs(60)));

        session.handle_with_context(
            &EmiEvent::Command(ConnectorCommand::Shutdown { finish: true }),
            &mut ctx,
        );
        let later = now + Duration::from_secs(5);
        assert_eq!(session.next_deadline(later), Some(later));
    }

    #[test]
    fn login_timeout() {
        let now = Instant::now();
        let mut config = EmiConfig::new("smsc", 5000);
        config.username = Some("user".to_owned());
        config.password = Some("pw".to_owned());
        config.waitack = Duration::from_secs(90);
        let (mut session, mut ctx) = session(config);
        session.handle_with_context(&EmiEvent::RConnected { now }, &mut ctx);
        actions(&mut ctx);
        session.handle_with_context(&EmiEvent::Tick { now: now + Duration::from_secs(60) }, &mut ctx);
        assert!(actions(&mut ctx).is_empty());
        let later = now + Duration::from_secs(90);
        session.handle_with_context(&EmiEvent::Tick { now: later }, &mut ctx);
        assert_eq!(actions(&mut ctx), [EmiAction::Close]);
        assert_eq!(
            *session.state(),
            State::reconnecting(Tr(later + Duration::from_secs(10)))
        );
    }

    #[test]
    fn ack_pairs_by_trn() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(EmiConfig::new("smsc", 5000), now);
        let mut sms = Sms::mt("4711", "+491701234567", "hi");
        sms.dlr_mask = DlrMask::SUCCESS;
        for _ in 0..8 {
            send(&mut session, &mut ctx, sms.clone());
        }
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        let submits = sent(&mut ctx);
        assert_eq!(submits.len(), 8);
        assert_eq!(submits[7].trn, 7);
        assert_eq!(session.unacked(), 8);

        packet(&mut session, &mut ctx, &ack(7, "00491701234567:020325100530"), now);
        assert_eq!(session.unacked(), 7);
        assert!(!session.slots().is_busy(7));
        let events = events(&mut ctx);
        assert_eq!(events.len(), 1);
        let GatewayEvent::Sent { sms: acked, .. } = &events[0] else {
            panic!("expected sent, got {events:?}");
        };
        assert_eq!(acked.foreign_id.as_deref(), Some("020325100530"));
        assert_eq!(acked.id, sms.id);

        // a second ack for the same TRN is ignored
        packet(&mut session, &mut ctx, &ack(7, ""), now);
        assert_eq!(session.unacked(), 7);
        assert!(ctx.poll_event().is_none());

        // the delivery notification resolves through the stored timestamp
        let mut notification = EmiMessage::operation(53, 12).unwrap();
        notification.set(e50::OADC, "00491701234567");
        notification.set(e50::SCTS, "020325100530");
        notification.set(e50::DST, "0");
        packet(&mut session, &mut ctx, &notification, now);
        let replies = sent(&mut ctx);
        assert_eq!(replies, [EmiMessage::reply(53, 12, true).unwrap()]);
        assert!(matches!(
            ctx.poll_event(),
            Some(GatewayEvent::Receive(report)) if report.dlr_mask == DlrMask::SUCCESS
        ));
    }

    #[test]
    fn nack_is_rejected_with_reason() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(EmiConfig::new("smsc", 5000), now);
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "hi"));
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        let trn = sent(&mut ctx)[0].trn;

        let mut nack = EmiMessage::reply(51, trn, false).unwrap();
        nack.set(reply::EC, "24");
        nack.set(reply::SM, "too long");
        packet(&mut session, &mut ctx, &nack, now);
        assert!(matches!(
            events(&mut ctx).as_slice(),
            [GatewayEvent::SendFailed { reason: FailReason::Rejected, text, .. }] if text == "24-too long"
        ));
        assert_eq!(session.unacked(), 0);
    }

    #[test]
    fn stop_and_wait_gates_sending() {
        let now = Instant::now();
        let mut config = EmiConfig::new("smsc", 5000);
        config.flow_control = FlowControl::StopAndWait;
        let (mut session, mut ctx) = active(config, now);
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "one"));
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "two"));
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        let first = sent(&mut ctx);
        assert_eq!(first.len(), 1);

        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        assert!(sent(&mut ctx).is_empty());
        assert_eq!(session.queued(), 1);

        packet(&mut session, &mut ctx, &ack(first[0].trn, ""), now);
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        assert_eq!(sent(&mut ctx).len(), 1);
    }

    #[test]
    fn window_limits_outstanding() {
        let now = Instant::now();
        let mut config = EmiConfig::new("smsc", 5000);
        config.window = 2;
        let (mut session, mut ctx) = active(config, now);
        for _ in 0..3 {
            send(&mut session, &mut ctx, Sms::mt("4711", "0171", "hi"));
        }
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        assert_eq!(sent(&mut ctx).len(), 2);
        assert_eq!(session.queued(), 1);
    }

    #[test]
    fn ack_timeout_disconnect_requeues() {
        let now = Instant::now();
        let mut config = EmiConfig::new("smsc", 5000);
        config.waitack = Duration::from_secs(30);
        let (mut session, mut ctx) = active(config, now);
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "hi"));
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        assert_eq!(sent(&mut ctx).len(), 1);

        // nothing was outstanding at `now`, so the first sweep runs here
        session.handle_with_context(&EmiEvent::Tick { now: now + Duration::from_secs(31) }, &mut ctx);
        assert_eq!(
            actions(&mut ctx),
            [
                EmiAction::Close,
                EmiAction::Connect {
                    host: "smsc".to_owned(),
                    port: 5000
                }
            ]
        );
        assert_eq!(session.queued(), 1);
        assert_eq!(session.unacked(), 0);
        assert_eq!(
            events(&mut ctx),
            [GatewayEvent::Status(ConnectorStatus::Reconnecting)]
        );

        // and goes out again once reconnected
        let later = now + Duration::from_secs(32);
        session.handle_with_context(&EmiEvent::RConnected { now: later }, &mut ctx);
        session.handle_with_context(&EmiEvent::Tick { now: later }, &mut ctx);
        assert_eq!(sent(&mut ctx).len(), 1);
    }

    #[test]
    fn ack_timeout_resend_and_sweep_is_idempotent() {
        let now = Instant::now();
        let mut config = EmiConfig::new("smsc", 5000);
        config.waitack = Duration::from_secs(30);
        config.waitack_expire = WaitAckExpire::Resend;
        config.window = 1;
        let (mut session, mut ctx) = active(config, now);
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "hi"));
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        let first = sent(&mut ctx);

        let later = now + Duration::from_secs(31);
        session.handle_with_context(&EmiEvent::Tick { now: later }, &mut ctx);
        let resent = sent(&mut ctx);
        assert_eq!(resent.len(), 1);
        assert_ne!(resent[0].trn, first[0].trn);
        assert_eq!(session.unacked(), 1);

        // an immediate second pass neither resends nor frees anything
        session.handle_with_context(&EmiEvent::Tick { now: later }, &mut ctx);
        assert!(sent(&mut ctx).is_empty());
        assert_eq!(session.unacked(), 1);
        assert!(events(&mut ctx).is_empty());
    }

    #[test]
    fn idle_connection_is_parked_and_reopened() {
        let now = Instant::now();
        let mut config = EmiConfig::new("smsc", 5000);
        config.idle_timeout = Some(Duration::from_secs(20));
        let (mut session, mut ctx) = active(config, now);
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "hi"));
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        let trn = sent(&mut ctx)[0].trn;
        packet(&mut session, &mut ctx, &ack(trn, ""), now);

        session.handle_with_context(&EmiEvent::Tick { now: now + Duration::from_secs(10) }, &mut ctx);
        assert_eq!(*session.state(), State::active());
        session.handle_with_context(&EmiEvent::Tick { now: now + Duration::from_secs(20) }, &mut ctx);
        assert_eq!(*session.state(), State::parked());
        assert_eq!(actions(&mut ctx), [EmiAction::Close]);

        session.handle_with_context(&EmiEvent::Tick { now: now + Duration::from_secs(40) }, &mut ctx);
        assert_eq!(*session.state(), State::parked());
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "again"));
        session.handle_with_context(&EmiEvent::Tick { now: now + Duration::from_secs(41) }, &mut ctx);
        assert_eq!(*session.state(), State::connecting());
    }

    #[test]
    fn stopped_session_ignores_operations() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(EmiConfig::new("smsc", 5000), now);
        session.handle_with_context(&EmiEvent::Command(ConnectorCommand::Stop), &mut ctx);
        let mut op = EmiMessage::operation(1, 2).unwrap();
        op.set(e01::ADC, "4711");
        op.set(e01::OADC, "0171");
        op.set(e01::MT, "3");
        op.set(e01::AMSG, "6869");
        packet(&mut session, &mut ctx, &op, now);
        assert!(sent(&mut ctx).is_empty());
        assert!(events(&mut ctx).is_empty());

        session.handle_with_context(&EmiEvent::Command(ConnectorCommand::Start), &mut ctx);
        packet(&mut session, &mut ctx, &op, now);
        assert_eq!(sent(&mut ctx), [EmiMessage::reply(1, 2, true).unwrap()]);
        assert!(matches!(
            events(&mut ctx).as_slice(),
            [GatewayEvent::Receive(sms)] if sms.text() == "hi"
        ));
    }

    #[test]
    fn broken_connection_requeues_and_reconnects() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(EmiConfig::new("smsc", 5000), now);
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "hi"));
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        actions(&mut ctx);
        session.handle_with_context(&EmiEvent::RClosed { now }, &mut ctx);
        assert_eq!(session.queued(), 1);
        assert_eq!(*session.state(), State::connecting());
    }

    #[test]
    fn fast_shutdown_waits_for_outstanding_replies() {
        let now = Instant::now();
        let mut config = EmiConfig::new("smsc", 5000);
        config.window = 1;
        let (mut session, mut ctx) = active(config, now);
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "in flight"));
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "queued"));
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        let trn = sent(&mut ctx)[0].trn;

        session.handle_with_context(
            &EmiEvent::Command(ConnectorCommand::Shutdown { finish: false }),
            &mut ctx,
        );
        assert!(matches!(
            events(&mut ctx).as_slice(),
            [GatewayEvent::SendFailed { reason: FailReason::Shutdown, .. }]
        ));
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        assert_eq!(*session.state(), State::active());

        packet(&mut session, &mut ctx, &ack(trn, ""), now);
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        assert_eq!(*session.state(), State::dead());
        assert_eq!(actions(&mut ctx), [EmiAction::Close]);
        let events = events(&mut ctx);
        assert!(matches!(events[0], GatewayEvent::Sent { .. }));
        assert_eq!(
            events[1..],
            [
                GatewayEvent::Status(ConnectorStatus::Dead),
                GatewayEvent::Killed
            ]
        );
    }

    #[test]
    fn slow_shutdown_drains_queue() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(EmiConfig::new("smsc", 5000), now);
        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "last"));
        session.handle_with_context(
            &EmiEvent::Command(ConnectorCommand::Shutdown { finish: true }),
            &mut ctx,
        );
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        let trn = sent(&mut ctx)[0].trn;
        packet(&mut session, &mut ctx, &ack(trn, ""), now);
        session.handle_with_context(&EmiEvent::Tick { now }, &mut ctx);
        assert_eq!(*session.state(), State::dead());

        send(&mut session, &mut ctx, Sms::mt("4711", "0171", "late"));
        assert!(matches!(
            events(&mut ctx).last(),
            Some(GatewayEvent::SendFailed { reason: FailReason::Shutdown, .. })
        ));
    }
}
