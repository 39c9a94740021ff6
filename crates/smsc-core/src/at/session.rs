use std::{
    collections::VecDeque,
    mem,
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use chrono::Utc;
use statig::{
    Response, StateOrSuperstate,
    prelude::{InitializedStateMachine, IntoStateMachineExt as _},
    state_machine,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    AtConfig, ConnectorCommand, ConnectorConfig, ConnectorStatus, Dlr, FailReason, GatewayEvent,
    RxFut, Sms, SmsQueue, Tk, Tp, Tr, TxFut,
    at::{
        CommandStatus, ExtractedPdu, ModemDefinition, ModemEvent,
        pdu::{self, Decoded},
        reply,
    },
};

/// Receiver of inbound messages when no own number is configured.
const DEFAULT_RECEIVER: &str = "1234";

/// Work for the device driver. Actions are executed strictly one after
/// another, each finishing before the next command is written to the modem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModemAction {
    /// Detect line speed and modem type if still unknown, then open the
    /// device
    Open,
    /// Answer the login and password prompts of a terminal server
    Login,
    /// Run the initialisation sequence, preceded by the modem's reset string
    /// if `reset` is set
    Initialize { reset: bool },
    /// Send the modem's keepalive command
    Keepalive,
    /// Read and delete the messages announced by `+CMTI`/`+CDSI`
    ReadStored(Vec<StorageStep>),
    /// Read and delete everything found in the message storage
    PollMemory,
    /// Submit `pdu` with `AT+CMGS`, preceded by `AT+CMMS=2` if `keep_link`
    Send {
        sms: Box<Sms>,
        pdu: String,
        keep_link: bool,
    },
    Close,
}

/// One step of reading stored messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageStep {
    /// `AT+CPMS="<storage>"`
    Select(String),
    /// `AT+CMGR=<location>`, then `AT+CMGD=<location>` if a message was read
    ReadDelete(u32),
}

/// Turns queued `+CMTI`/`+CDSI` lines into storage reads.
///
/// Without a configured storage the first one named by the modem is adopted.
/// The configured storage is selected again at the end.
pub fn indication_steps(
    name: &str,
    lines: impl IntoIterator<Item = String>,
    storage: &mut Option<String>,
) -> Vec<StorageStep> {
    let mut steps = Vec::new();
    let mut current = storage.clone();
    for line in lines {
        let Some((named, location)) = reply::parse_cmti(&line) else {
            error!("AT2[{name}]: got unparsable indication <{line}>");
            continue;
        };
        if let Some(named) = named {
            if storage.is_none() {
                info!("AT2[{name}]: no message storage set, using <{named}> from the modem");
                *storage = Some(named.clone());
            }
            if current.as_ref() != Some(&named) {
                current = Some(named.clone());
                steps.push(StorageStep::Select(named));
            }
        }
        steps.push(StorageStep::ReadDelete(location));
    }
    if let Some(configured) = storage.as_ref() {
        if current.as_ref() != Some(configured) {
            steps.push(StorageStep::Select(configured.clone()));
        }
    }
    steps
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ModemContext {
    actions: VecDeque<ModemAction>,
    events: VecDeque<GatewayEvent>,
}
impl ModemContext {
    pub fn poll_action(&mut self) -> Option<ModemAction> {
        self.actions.pop_front()
    }
    pub fn action_future(&mut self) -> TxFut<ModemAction> {
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
pub struct ModemSession(InitializedStateMachine<ModemState>);
impl Deref for ModemSession {
    type Target = InitializedStateMachine<ModemState>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl DerefMut for ModemSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
impl ModemSession {
    pub fn new(
        name: &str,
        connector: &ConnectorConfig,
        config: AtConfig,
        dlr: Dlr,
        ctx: &mut ModemContext,
    ) -> Self {
        let modem = config.modem_type.as_deref().and_then(|id| {
            let found = ModemDefinition::find(id);
            if found.is_none() {
                warn!("AT2[{name}]: unknown modem type <{id}>, detecting");
            }
            found
        });
        let sm = ModemState {
            name: name.to_owned(),
            smsc_id: connector.smsc_id.clone().unwrap_or_else(|| name.to_owned()),
            speed: config.speed,
            config,
            reconnect_delay: connector.reconnect_delay,
            throughput: connector.throughput,
            alt_dcs: connector.alt_dcs,
            modem,
            phase2plus: false,
            status: ConnectorStatus::Connecting,
            error_count: 0,
            finishing: false,
            queue: SmsQueue::new(),
            pending: Vec::new(),
            sent: VecDeque::new(),
            dlr,
        }
        .uninitialized_state_machine()
        .init_with_context(ctx);
        Self(sm)
    }

    /// When the next [`ModemEvent::Tick`] is due, `None` while only the
    /// device or a command can move the session on.
    #[must_use]
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        match self.state() {
            State::Active { keepalive, poll } => {
                let due = (!self.pending.is_empty() || (self.finishing && self.queue.is_empty()))
                    .then_some(now);
                let send = (self.modem.is_some() && !self.queue.is_empty())
                    .then(|| self.throughput_free(now));
                [
                    due,
                    send,
                    keepalive.as_ref().map(|k| k.0),
                    poll.as_ref().map(|p| p.0),
                ]
                .into_iter()
                .flatten()
                .min()
            }
            State::Reconnecting { retry } => Some(retry.0),
            State::Idle {}
            | State::Opening {}
            | State::LoggingIn {}
            | State::Initializing {}
            | State::Dead {}
            | State::Error {} => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModemState {
    pub name: String,
    pub smsc_id: String,
    pub config: AtConfig,
    pub reconnect_delay: Duration,
    pub throughput: Option<u32>,
    pub alt_dcs: bool,
    /// Configured or detected modem type, kept across reconnects.
    pub modem: Option<ModemDefinition>,
    /// Line speed, `0` until detected.
    pub speed: u32,
    /// The modem acknowledges deliveries with `AT+CNMA`.
    pub phase2plus: bool,
    pub status: ConnectorStatus,
    error_count: u32,
    finishing: bool,
    queue: SmsQueue,
    pending: Vec<String>,
    /// Send instants of the last second, for throughput limiting.
    sent: VecDeque<Instant>,
    dlr: Dlr,
}

impl ModemState {
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether a delivery must be acknowledged with `AT+CNMA`.
    #[must_use]
    pub fn needs_ack(&self, stored: bool) -> bool {
        self.phase2plus && !stored
    }

    fn enqueue(&mut self, sms: &Sms) {
        debug!("AT2[{}]: queueing {sms}", self.name);
        self.queue.push(sms.clone());
    }

    fn set_status(&mut self, context: &mut ModemContext, status: ConnectorStatus) {
        if self.status != status {
            self.status = status;
            context.events.push_back(GatewayEvent::Status(status));
        }
    }

    fn open(context: &mut ModemContext) -> Response<State> {
        context.actions.push_back(ModemAction::Open);
        Response::Transition(State::opening())
    }

    fn initialize(&mut self, context: &mut ModemContext) -> Response<State> {
        let reset = self
            .config
            .max_error_count
            .is_some_and(|max| max > 0 && self.error_count > max)
            && self
                .modem
                .as_ref()
                .is_some_and(|m| m.reset_string.is_some());
        if reset {
            info!("AT2[{}]: too many failed attempts, resetting modem", self.name);
            self.error_count = 0;
        }
        context.actions.push_back(ModemAction::Initialize { reset });
        Response::Transition(State::initializing())
    }

    fn reconnect(&mut self, context: &mut ModemContext, now: Instant) -> Response<State> {
        if self.status == ConnectorStatus::Active {
            self.set_status(context, ConnectorStatus::Reconnecting);
        }
        error!(
            "AT2[{}]: Couldn't connect (retrying in {} seconds).",
            self.name,
            self.reconnect_delay.as_secs()
        );
        Response::Transition(State::reconnecting(Tr(now + self.reconnect_delay)))
    }

    fn close_and_reconnect(&mut self, context: &mut ModemContext, now: Instant) -> Response<State> {
        context.actions.push_back(ModemAction::Close);
        self.reconnect(context, now)
    }

    fn kill(&mut self, context: &mut ModemContext) -> Response<State> {
        for sms in self.queue.drain() {
            context
                .events
                .push_back(GatewayEvent::send_failed(sms, FailReason::Shutdown, ""));
        }
        self.pending.clear();
        self.set_status(context, ConnectorStatus::Dead);
        context.events.push_back(GatewayEvent::Killed);
        Response::Transition(State::dead())
    }

    fn shutdown(&mut self, context: &mut ModemContext, connected: bool) -> Response<State> {
        debug!("AT2[{}]: Shutting down SMSCConn", self.name);
        if connected {
            context.actions.push_back(ModemAction::Close);
        }
        self.kill(context)
    }

    fn incoming(&mut self, context: &mut ModemContext, pdu: &ExtractedPdu) {
        let decoded = match pdu::decode(&pdu.pdu, Utc::now()) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("AT2[{}]: could not decode PDU to a message: {e}", self.name);
                return;
            }
        };
        match decoded {
            Decoded::Deliver(mut sms) => {
                sms.receiver = self
                    .config
                    .my_number
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| DEFAULT_RECEIVER.to_owned());
                sms.smsc_id = Some(self.smsc_id.clone());
                sms.smsc_number.clone_from(&pdu.smsc_number);
                context.events.push_back(GatewayEvent::Receive(sms));
            }
            Decoded::StatusReport {
                reference,
                receiver,
                status,
            } => {
                let Some(mut report) = self.dlr.find(
                    &self.smsc_id,
                    &reference.to_string(),
                    Some(&receiver),
                    status,
                    false,
                ) else {
                    debug!(
                        "AT2[{}]: Received delivery notification but can't find that ID in the DLR storage",
                        self.name
                    );
                    return;
                };
                report.msgdata = Decoded::status_text(status).into();
                context.events.push_back(GatewayEvent::Receive(report));
            }
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

    /// Hands the next queued message to the device. Returns whether a
    /// message left the queue.
    fn send_next(&mut self, context: &mut ModemContext, now: Instant) -> bool {
        let Some(modem) = &self.modem else {
            return false;
        };
        if self.queue.is_empty() {
            return false;
        }
        let keep_link = modem.enable_mms && self.queue.len() > 1;
        if self.throughput_exceeded(now) {
            debug!(
                "AT2[{}]: throughput limit exceeded (load: {}, throughput: {:?})",
                self.name,
                self.sent.len(),
                self.throughput
            );
            return false;
        }
        let Some(mut sms) = self.queue.pop() else {
            return false;
        };
        self.sent.push_back(now);

        if let Some(number) = self.config.my_number.as_ref().filter(|n| !n.is_empty()) {
            sms.sender.clone_from(number);
        }
        match pdu::encode(&sms, self.alt_dcs, self.config.validity_period, Utc::now()) {
            Ok(pdu) => context.actions.push_back(ModemAction::Send {
                sms: Box::new(sms),
                pdu,
                keep_link,
            }),
            Err(e) => {
                error!("AT2[{}]: Error encoding PDU: {e}", self.name);
                context.events.push_back(GatewayEvent::send_failed(
                    sms,
                    FailReason::Malformed,
                    e.to_string(),
                ));
            }
        }
        true
    }

    fn submitted(&mut self, context: &mut ModemContext, sms: &Sms, msg_ref: Option<u32>) {
        let mut sms = sms.clone();
        if sms.dlr_mask.is_enabled_device() {
            if let Some(msg_ref) = msg_ref {
                self.dlr
                    .add(&self.smsc_id, &msg_ref.to_string(), &mut sms, false);
            } else {
                error!(
                    "AT2[{}]: delivery notification requested, but I have no message ID!",
                    self.name
                );
            }
        }
        context
            .events
            .push_back(GatewayEvent::Sent { sms, extra: None });
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
impl ModemState {
    #[expect(clippy::needless_pass_by_value, reason = "due to macro")]
    fn before_dispatch(&mut self, state: StateOrSuperstate<State, Superstate>, event: &ModemEvent) {
        trace!(
            "AT2[{}]: before dispatching `{:?}` to `{:?}`",
            self.name, event, state
        );
    }
    #[expect(clippy::needless_pass_by_value, reason = "due to macro")]
    fn after_dispatch(&mut self, state: StateOrSuperstate<State, Superstate>, event: &ModemEvent) {
        trace!(
            "AT2[{}]: after dispatching `{:?}` to `{:?}`",
            self.name, event, state
        );
    }
    fn before_transition(&mut self, next: &State, prev: &State) {
        trace!(
            "AT2[{}]: before transitioning from `{:?}` to `{:?}`",
            self.name, prev, next
        );
    }
    fn after_transition(&mut self, prev: &State, next: &State) {
        trace!(
            "AT2[{}]: after transitioning from `{:?}` to `{:?}`",
            self.name, prev, next
        );
    }

    #[state]
    fn idle(&mut self, context: &mut ModemContext, event: &ModemEvent) -> Response<State> {
        match event {
            ModemEvent::Command(ConnectorCommand::Connect) => Self::open(context),
            ModemEvent::Command(ConnectorCommand::Send(sms)) => {
                self.enqueue(sms);
                Response::Handled
            }
            ModemEvent::Command(ConnectorCommand::Shutdown { .. }) => {
                self.shutdown(context, false)
            }
            ModemEvent::Command(ConnectorCommand::Start | ConnectorCommand::Stop)
            | ModemEvent::Tick { .. } => Response::Handled,
            ModemEvent::ROpened { .. }
            | ModemEvent::ROpenFailed { .. }
            | ModemEvent::RLoggedIn { .. }
            | ModemEvent::RLoginFailed { .. }
            | ModemEvent::RInitialized { .. }
            | ModemEvent::RInitFailed { .. }
            | ModemEvent::RIoError { .. }
            | ModemEvent::RIndication { .. }
            | ModemEvent::RMessage { .. }
            | ModemEvent::RSubmitted { .. }
            | ModemEvent::RSubmitFailed { .. } => {
                error!("Unexpected Event {event:?} in IDLE");
                Response::Transition(State::error())
            }
        }
    }

    #[state]
    fn opening(&mut self, context: &mut ModemContext, event: &ModemEvent) -> Response<State> {
        match event {
            ModemEvent::ROpened { speed, modem, .. } => {
                self.speed = *speed;
                if self.modem.is_none() {
                    self.modem = Some(modem.as_ref().clone());
                }
                if self.config.username.is_some() || self.config.password.is_some() {
                    context.actions.push_back(ModemAction::Login);
                    Response::Transition(State::logging_in())
                } else {
                    self.initialize(context)
                }
            }
            ModemEvent::ROpenFailed { now } => self.reconnect(context, *now),
            ModemEvent::Command(ConnectorCommand::Send(sms)) => {
                self.enqueue(sms);
                Response::Handled
            }
            ModemEvent::Command(ConnectorCommand::Shutdown { .. }) => {
                self.shutdown(context, true)
            }
            ModemEvent::Command(
                ConnectorCommand::Connect | ConnectorCommand::Start | ConnectorCommand::Stop,
            )
            | ModemEvent::Tick { .. } => Response::Handled,
            ModemEvent::RLoggedIn { .. }
            | ModemEvent::RLoginFailed { .. }
            | ModemEvent::RInitialized { .. }
            | ModemEvent::RInitFailed { .. }
            | ModemEvent::RIoError { .. }
            | ModemEvent::RIndication { .. }
            | ModemEvent::RMessage { .. }
            | ModemEvent::RSubmitted { .. }
            | ModemEvent::RSubmitFailed { .. } => {
                error!("Unexpected Event {event:?} in OPENING");
                Response::Transition(State::error())
            }
        }
    }

    #[state]
    fn logging_in(&mut self, context: &mut ModemContext, event: &ModemEvent) -> Response<State> {
        match event {
            ModemEvent::RLoggedIn { .. } => self.initialize(context),
            ModemEvent::RLoginFailed { now } | ModemEvent::RIoError { now } => {
                error!("AT2[{}]: at2_login_device failed.", self.name);
                self.close_and_reconnect(context, *now)
            }
            ModemEvent::RIndication { line } => {
                self.pending.push(line.clone());
                Response::Handled
            }
            ModemEvent::RMessage { pdu, .. } => {
                self.incoming(context, pdu);
                Response::Handled
            }
            ModemEvent::Command(ConnectorCommand::Send(sms)) => {
                self.enqueue(sms);
                Response::Handled
            }
            ModemEvent::Command(ConnectorCommand::Shutdown { .. }) => {
                self.shutdown(context, true)
            }
            ModemEvent::Command(
                ConnectorCommand::Connect | ConnectorCommand::Start | ConnectorCommand::Stop,
            )
            | ModemEvent::Tick { .. } => Response::Handled,
            ModemEvent::ROpened { .. }
            | ModemEvent::ROpenFailed { .. }
            | ModemEvent::RInitialized { .. }
            | ModemEvent::RInitFailed { .. }
            | ModemEvent::RSubmitted { .. }
            | ModemEvent::RSubmitFailed { .. } => {
                error!("Unexpected Event {event:?} in LOGGING_IN");
                Response::Transition(State::error())
            }
        }
    }

    #[state]
    fn initializing(&mut self, context: &mut ModemContext, event: &ModemEvent) -> Response<State> {
        match event {
            ModemEvent::RInitialized { now, phase2plus } => {
                self.error_count = 0;
                self.phase2plus = *phase2plus;
                info!("AT2[{}]: AT SMSC successfully opened.", self.name);
                self.set_status(context, ConnectorStatus::Active);
                context.events.push_back(GatewayEvent::Connected);
                // the first keepalive and memory poll are due right away
                let keepalive = self.config.keepalive.map(|_| Tk(*now));
                let poll = self.config.memory_poll_interval().map(|_| Tp(*now));
                Response::Transition(State::active(keepalive, poll))
            }
            ModemEvent::RInitFailed { now } => {
                error!(
                    "AT2[{}]: Initialization of device failed. Attempt #{} on {:?} max.",
                    self.name, self.error_count, self.config.max_error_count
                );
                self.error_count += 1;
                self.close_and_reconnect(context, *now)
            }
            ModemEvent::RIoError { now } => self.close_and_reconnect(context, *now),
            ModemEvent::RIndication { line } => {
                self.pending.push(line.clone());
                Response::Handled
            }
            ModemEvent::RMessage { pdu, .. } => {
                self.incoming(context, pdu);
                Response::Handled
            }
            ModemEvent::Command(ConnectorCommand::Send(sms)) => {
                self.enqueue(sms);
                Response::Handled
            }
            ModemEvent::Command(ConnectorCommand::Shutdown { .. }) => {
                self.shutdown(context, true)
            }
            ModemEvent::Command(
                ConnectorCommand::Connect | ConnectorCommand::Start | ConnectorCommand::Stop,
            )
            | ModemEvent::Tick { .. } => Response::Handled,
            ModemEvent::ROpened { .. }
            | ModemEvent::ROpenFailed { .. }
            | ModemEvent::RLoggedIn { .. }
            | ModemEvent::RLoginFailed { .. }
            | ModemEvent::RSubmitted { .. }
            | ModemEvent::RSubmitFailed { .. } => {
                error!("Unexpected Event {event:?} in INITIALIZING");
                Response::Transition(State::error())
            }
        }
    }

    #[state]
    fn active(
        &mut self,
        context: &mut ModemContext,
        event: &ModemEvent,
        keepalive: &Option<Tk>,
        poll: &Option<Tp>,
    ) -> Response<State> {
        match event {
            ModemEvent::Tick { now } => {
                let mut next_keepalive = *keepalive;
                let mut next_poll = *poll;

                if !self.pending.is_empty() {
                    let lines = mem::take(&mut self.pending);
                    if let Some(modem) = self.modem.as_mut() {
                        let steps = indication_steps(&self.name, lines, &mut modem.message_storage);
                        context.actions.push_back(ModemAction::ReadStored(steps));
                    }
                }
                if keepalive.is_some_and(|k| *now >= k.0) {
                    context.actions.push_back(ModemAction::Keepalive);
                    next_keepalive = self.config.keepalive.map(|k| Tk(*now + k));
                }
                if poll.is_some_and(|p| *now >= p.0) {
                    context.actions.push_back(ModemAction::PollMemory);
                    next_poll = self.config.memory_poll_interval().map(|i| Tp(*now + i));
                }
                if self.send_next(context, *now) {
                    next_keepalive = self.config.keepalive.map(|k| Tk(*now + k));
                }
                if self.finishing && self.queue.is_empty() {
                    return self.shutdown(context, true);
                }

                if next_keepalive == *keepalive && next_poll == *poll {
                    Response::Handled
                } else {
                    Response::Transition(State::active(next_keepalive, next_poll))
                }
            }
            ModemEvent::RSubmitted { sms, msg_ref } => {
                self.submitted(context, sms, *msg_ref);
                Response::Handled
            }
            ModemEvent::RSubmitFailed { sms, status } => {
                error!(
                    "AT2[{}]: Error received, notifying failure, status {status:?}",
                    self.name
                );
                let text = match status {
                    CommandStatus::Rejected(Some(code)) | CommandStatus::Error(Some(code)) => {
                        reply::error_string(*code)
                    }
                    _ => "ERROR",
                };
                context.events.push_back(GatewayEvent::send_failed(
                    sms.as_ref().clone(),
                    FailReason::Temporarily,
                    text,
                ));
                Response::Handled
            }
            ModemEvent::RIndication { line } => {
                self.pending.push(line.clone());
                Response::Handled
            }
            ModemEvent::RMessage { pdu, .. } => {
                self.incoming(context, pdu);
                Response::Handled
            }
            ModemEvent::RIoError { now } => self.close_and_reconnect(context, *now),
            ModemEvent::Command(ConnectorCommand::Send(sms)) => {
                self.enqueue(sms);
                Response::Handled
            }
            ModemEvent::Command(ConnectorCommand::Shutdown { finish: true }) => {
                debug!(
                    "AT2[{}]: Shutting down SMSCConn, slow, {} queued",
                    self.name,
                    self.queue.len()
                );
                self.finishing = true;
                Response::Handled
            }
            ModemEvent::Command(ConnectorCommand::Shutdown { finish: false }) => {
                self.shutdown(context, true)
            }
            ModemEvent::Command(
                ConnectorCommand::Connect | ConnectorCommand::Start | ConnectorCommand::Stop,
            ) => Response::Handled,
            ModemEvent::ROpened { .. }
            | ModemEvent::ROpenFailed { .. }
            | ModemEvent::RLoggedIn { .. }
            | ModemEvent::RLoginFailed { .. }
            | ModemEvent::RInitialized { .. }
            | ModemEvent::RInitFailed { .. } => {
                error!("Unexpected Event {event:?} in ACTIVE");
                Response::Transition(State::error())
            }
        }
    }

    #[state]
    fn reconnecting(
        &mut self,
        context: &mut ModemContext,
        event: &ModemEvent,
        retry: &Tr,
    ) -> Response<State> {
        match event {
            ModemEvent::Tick { now } if *now >= retry.0 => Self::open(context),
            ModemEvent::Command(ConnectorCommand::Send(sms)) => {
                self.enqueue(sms);
                Response::Handled
            }
            // outcomes of submits handed to the device before the link broke
            ModemEvent::RSubmitted { sms, msg_ref } => {
                self.submitted(context, sms, *msg_ref);
                Response::Handled
            }
            ModemEvent::RSubmitFailed { sms, .. } => {
                self.enqueue(sms);
                Response::Handled
            }
            ModemEvent::RMessage { pdu, .. } => {
                self.incoming(context, pdu);
                Response::Handled
            }
            ModemEvent::Command(ConnectorCommand::Shutdown { .. }) => {
                self.shutdown(context, false)
            }
            ModemEvent::Command(
                ConnectorCommand::Connect | ConnectorCommand::Start | ConnectorCommand::Stop,
            )
            | ModemEvent::Tick { .. }
            | ModemEvent::RIoError { .. } => Response::Handled,
            ModemEvent::ROpened { .. }
            | ModemEvent::ROpenFailed { .. }
            | ModemEvent::RLoggedIn { .. }
            | ModemEvent::RLoginFailed { .. }
            | ModemEvent::RInitialized { .. }
            | ModemEvent::RInitFailed { .. }
            | ModemEvent::RIndication { .. } => {
                error!("Unexpected Event {event:?} in RECONNECTING");
                Response::Transition(State::error())
            }
        }
    }

    #[state]
    fn dead(&mut self, context: &mut ModemContext, event: &ModemEvent) -> Response<State> {
        if let ModemEvent::Command(ConnectorCommand::Send(sms)) = event {
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
    use crate::{ConnectorKind, DlrMask};

    const HELLO: &str = "040B912120550521F300004230512103540005C82293F904";

    fn session(config: AtConfig) -> (ModemSession, ModemContext) {
        crate::test_logging();
        let mut ctx = ModemContext::default();
        let connector = ConnectorConfig::new(ConnectorKind::At(config.clone()));
        let mut session = ModemSession::new("modem", &connector, config, Dlr::default(), &mut ctx);
        session.handle_with_context(
            &ModemEvent::Command(ConnectorCommand::Connect),
            &mut ctx,
        );
        (session, ctx)
    }

    fn actions(ctx: &mut ModemContext) -> Vec<ModemAction> {
        std::iter::from_fn(|| ctx.poll_action()).collect()
    }

    fn events(ctx: &mut ModemContext) -> Vec<GatewayEvent> {
        std::iter::from_fn(|| ctx.poll_event()).collect()
    }

    fn active(config: AtConfig, now: Instant) -> (ModemSession, ModemContext) {
        let (mut session, mut ctx) = session(config);
        session.handle_with_context(
            &ModemEvent::ROpened {
                now,
                speed: 9600,
                modem: Box::default(),
            },
            &mut ctx,
        );
        session.handle_with_context(
            &ModemEvent::RInitialized {
                now,
                phase2plus: true,
            },
            &mut ctx,
        );
        actions(&mut ctx);
        events(&mut ctx);
        (session, ctx)
    }

    fn send(session: &mut ModemSession, ctx: &mut ModemContext, sms: Sms) {
        session.handle_with_context(
            &ModemEvent::Command(ConnectorCommand::Send(Box::new(sms))),
            ctx,
        );
    }

    #[test]
    fn connect_open_initialize() {
        let now = Instant::now();
        let (mut session, mut ctx) = session(AtConfig::serial("/dev/ttyS0"));
        assert_eq!(actions(&mut ctx), [ModemAction::Open]);
        assert_eq!(*session.state(), State::opening());

        session.handle_with_context(
            &ModemEvent::ROpened {
                now,
                speed: 19200,
                modem: Box::new(ModemDefinition::find("wavecom").unwrap()),
            },
            &mut ctx,
        );
        assert_eq!(actions(&mut ctx), [ModemAction::Initialize { reset: false }]);
        assert_eq!(session.speed, 19200);
        assert_eq!(session.modem.as_ref().unwrap().id, "wavecom");

        session.handle_with_context(
            &ModemEvent::RInitialized {
                now,
                phase2plus: true,
            },
            &mut ctx,
        );
        assert_eq!(
            events(&mut ctx),
            [
                GatewayEvent::Status(ConnectorStatus::Active),
                GatewayEvent::Connected
            ]
        );
        assert_eq!(*session.state(), State::active(None, None));
        assert!(session.needs_ack(false));
        assert!(!session.needs_ack(true));
    }

    #[test]
    fn credentials_log_in_first() {
        let mut config = AtConfig::serial("/dev/ttyS0");
        config.username = Some("user".to_owned());
        config.password = Some("secret".to_owned());
        let (mut session, mut ctx) = session(config);
        actions(&mut ctx);
        session.handle_with_context(
            &ModemEvent::ROpened {
                now: Instant::now(),
                speed: 9600,
                modem: Box::default(),
            },
            &mut ctx,
        );
        assert_eq!(actions(&mut ctx), [ModemAction::Login]);
        session.handle_with_context(&ModemEvent::RLoggedIn { now: Instant::now() }, &mut ctx);
        assert_eq!(actions(&mut ctx), [ModemAction::Initialize { reset: false }]);
    }

    #[test]
    fn failed_init_reconnects_and_resets() {
        let mut config = AtConfig::serial("/dev/ttyS0");
        config.modem_type = Some("falcom".to_owned());
        config.max_error_count = Some(1);
        let (mut session, mut ctx) = session(config);
        let now = Instant::now();

        for attempt in 0..3 {
            actions(&mut ctx);
            session.handle_with_context(
                &ModemEvent::ROpened {
                    now,
                    speed: 9600,
                    modem: Box::default(),
                },
                &mut ctx,
            );
            let reset = attempt == 2;
            assert_eq!(actions(&mut ctx), [ModemAction::Initialize { reset }]);
            session.handle_with_context(&ModemEvent::RInitFailed { now }, &mut ctx);
            assert_eq!(actions(&mut ctx), [ModemAction::Close]);
            assert_eq!(
                *session.state(),
                State::reconnecting(Tr(now + Duration::from_secs(10)))
            );

            session.handle_with_context(&ModemEvent::Tick { now }, &mut ctx);
            assert!(actions(&mut ctx).is_empty());
            session.handle_with_context(
                &ModemEvent::Tick {
                    now: now + Duration::from_secs(10),
                },
                &mut ctx,
            );
            assert_eq!(actions(&mut ctx), [ModemAction::Open]);
        }
        // never connected, so the status stays at connecting
        assert!(events(&mut ctx).is_empty());
        assert_eq!(session.modem.as_ref().unwrap().id, "falcom");
    }

    #[test]
    fn queued_message_is_sent_and_tracked() {
        let now = Instant::now();
        let mut config = AtConfig::serial("/dev/ttyS0");
        config.my_number = Some("+4917600000".to_owned());
        let (mut session, mut ctx) = session(config);
        let mut sms = Sms::mt("gateway", "+491761234567", "hi");
        sms.dlr_mask = DlrMask::SUCCESS | DlrMask::FAIL;
        send(&mut session, &mut ctx, sms);
        actions(&mut ctx);

        session.handle_with_context(
            &ModemEvent::ROpened {
                now,
                speed: 9600,
                modem: Box::default(),
            },
            &mut ctx,
        );
        session.handle_with_context(
            &ModemEvent::RInitialized {
                now,
                phase2plus: false,
            },
            &mut ctx,
        );
        actions(&mut ctx);
        events(&mut ctx);
        assert_eq!(session.queued(), 1);

        session.handle_with_context(&ModemEvent::Tick { now }, &mut ctx);
        let [ModemAction::Send { sms, pdu, keep_link }]: [_; 1] = actions(&mut ctx).try_into().unwrap()
        else {
            panic!("expected a send");
        };
        assert!(!keep_link);
        assert_eq!(sms.sender, "+4917600000");
        // status report requested, no validity, 2 septets
        assert_eq!(pdu, "31000C919471163254760000A702E834");

        session.handle_with_context(
            &ModemEvent::RSubmitted {
                sms,
                msg_ref: Some(42),
            },
            &mut ctx,
        );
        let [GatewayEvent::Sent { sms, extra: None }]: [_; 1] = events(&mut ctx).try_into().unwrap() else {
            panic!("expected sent");
        };
        assert_eq!(sms.foreign_id.as_deref(), Some("42"));

        // +CDS status report for reference 42, delivered
        let report = ExtractedPdu {
            pdu: "062A0B912120550521F3423051210354004230512103540000".to_owned(),
            smsc_number: None,
        };
        session.handle_with_context(
            &ModemEvent::RMessage {
                pdu: report,
                stored: false,
            },
            &mut ctx,
        );
        let [GatewayEvent::Receive(dlr)]: [_; 1] = events(&mut ctx).try_into().unwrap() else {
            panic!("expected a report");
        };
        assert_eq!(dlr.dlr_mask, DlrMask::SUCCESS);
        assert_eq!(dlr.msgdata, b"Success");
        assert_eq!(dlr.receiver, "+491761234567");
    }

    #[test]
    fn send_failure_is_temporary() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(AtConfig::serial("/dev/ttyS0"), now);
        session.handle_with_context(
            &ModemEvent::RSubmitFailed {
                sms: Box::new(Sms::mt("a", "123", "x")),
                status: CommandStatus::Rejected(Some(38)),
            },
            &mut ctx,
        );
        let [GatewayEvent::SendFailed { reason, text, .. }]: [_; 1] = events(&mut ctx).try_into().unwrap()
        else {
            panic!("expected failure");
        };
        assert_eq!(reason, FailReason::Temporarily);
        assert_eq!(text, reply::error_string(38));
    }

    #[test]
    fn unencodable_message_is_malformed() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(AtConfig::serial("/dev/ttyS0"), now);
        send(&mut session, &mut ctx, Sms::mt("a", "not a number", "x"));
        session.handle_with_context(&ModemEvent::Tick { now }, &mut ctx);
        assert!(actions(&mut ctx).is_empty());
        let [GatewayEvent::SendFailed { reason, .. }]: [_; 1] = events(&mut ctx).try_into().unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(reason, FailReason::Malformed);
    }

    #[test]
    fn inbound_message_is_delivered() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(AtConfig::serial("/dev/ttyS0"), now);
        session.handle_with_context(
            &ModemEvent::RMessage {
                pdu: ExtractedPdu {
                    pdu: HELLO.to_owned(),
                    smsc_number: Some("+4917200000".to_owned()),
                },
                stored: false,
            },
            &mut ctx,
        );
        let [GatewayEvent::Receive(sms)]: [_; 1] = events(&mut ctx).try_into().unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(sms.sender, "+12025550123");
        assert_eq!(sms.receiver, "1234");
        assert_eq!(sms.msgdata, b"HELLO");
        assert_eq!(sms.smsc_id.as_deref(), Some("modem"));
        assert_eq!(sms.smsc_number.as_deref(), Some("+4917200000"));

        // undecodable PDUs are dropped
        session.handle_with_context(
            &ModemEvent::RMessage {
                pdu: ExtractedPdu {
                    pdu: "04".to_owned(),
                    smsc_number: None,
                },
                stored: true,
            },
            &mut ctx,
        );
        assert!(events(&mut ctx).is_empty());
    }

    #[test]
    fn keepalive_and_memory_poll_timers() {
        let now = Instant::now();
        let mut config = AtConfig::serial("/dev/ttyS0");
        config.keepalive = Some(Duration::from_secs(30));
        config.sim_buffering = true;
        let (mut session, mut ctx) = active(config, now);

        session.handle_with_context(&ModemEvent::Tick { now }, &mut ctx);
        assert_eq!(
            actions(&mut ctx),
            [ModemAction::Keepalive, ModemAction::PollMemory]
        );
        let later = now + Duration::from_secs(10);
        session.handle_with_context(&ModemEvent::Tick { now: later }, &mut ctx);
        assert!(actions(&mut ctx).is_empty());

        // sending postpones the keepalive
        send(&mut session, &mut ctx, Sms::mt("a", "123", "x"));
        session.handle_with_context(&ModemEvent::Tick { now: later }, &mut ctx);
        assert!(matches!(
            actions(&mut ctx).as_slice(),
            [ModemAction::Send { .. }]
        ));
        session.handle_with_context(
            &ModemEvent::Tick {
                now: now + Duration::from_secs(30),
            },
            &mut ctx,
        );
        assert_eq!(actions(&mut ctx), [ModemAction::PollMemory]);
        session.handle_with_context(
            &ModemEvent::Tick {
                now: later + Duration::from_secs(30),
            },
            &mut ctx,
        );
        assert_eq!(actions(&mut ctx), [ModemAction::Keepalive]);
    }

    #[test]
    fn throughput_limits_sends_per_second() {
        let now = Instant::now();
        let mut config = AtConfig::serial("/dev/ttyS0");
        config.modem_type = Some("nokiaphone".to_owned());
        let mut ctx = ModemContext::default();
        let mut connector = ConnectorConfig::new(ConnectorKind::At(config.clone()));
        connector.throughput = Some(1);
        let mut session = ModemSession::new("modem", &connector, config, Dlr::default(), &mut ctx);
        for event in [
            ModemEvent::Command(ConnectorCommand::Connect),
            ModemEvent::ROpened {
                now,
                speed: 9600,
                modem: Box::default(),
            },
            ModemEvent::RInitialized {
                now,
                phase2plus: false,
            },
        ] {
            session.handle_with_context(&event, &mut ctx);
        }
        actions(&mut ctx);
        send(&mut session, &mut ctx, Sms::mt("a", "123", "one"));
        send(&mut session, &mut ctx, Sms::mt("a", "123", "two"));

        session.handle_with_context(&ModemEvent::Tick { now }, &mut ctx);
        let [ModemAction::Send { keep_link, .. }]: [_; 1] = actions(&mut ctx).try_into().unwrap() else {
            panic!("expected a send");
        };
        assert!(keep_link);
        let half = now + Duration::from_millis(500);
        assert_eq!(
            session.next_deadline(half),
            Some(now + Duration::from_secs(1))
        );
        session.handle_with_context(&ModemEvent::Tick { now: half }, &mut ctx);
        assert!(actions(&mut ctx).is_empty());
        session.handle_with_context(
            &ModemEvent::Tick {
                now: now + Duration::from_secs(1),
            },
            &mut ctx,
        );
        let [ModemAction::Send { keep_link, sms, .. }]: [_; 1] = actions(&mut ctx).try_into().unwrap()
        else {
            panic!("expected a send");
        };
        assert!(!keep_link);
        assert_eq!(sms.msgdata, b"two");
    }

    #[test]
    fn indications_are_read_on_tick() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(AtConfig::serial("/dev/ttyS0"), now);
        assert_eq!(session.next_deadline(now), None);
        session.handle_with_context(&ModemEvent::indication("+CMTI: \"SM\",3"), &mut ctx);
        assert!(actions(&mut ctx).is_empty());
        assert_eq!(session.next_deadline(now), Some(now));
        session.handle_with_context(&ModemEvent::Tick { now }, &mut ctx);
        assert_eq!(
            actions(&mut ctx),
            [ModemAction::ReadStored(vec![
                StorageStep::Select("SM".to_owned()),
                StorageStep::ReadDelete(3),
            ])]
        );
        assert_eq!(
            session.modem.as_ref().unwrap().message_storage.as_deref(),
            Some("SM")
        );
    }

    #[test]
    fn storage_switches_and_restores() {
        let mut storage = Some("SM".to_owned());
        let steps = indication_steps(
            "modem",
            [
                "+CMTI: \"SM\",1".to_owned(),
                "+CDSI: \"SR\",2".to_owned(),
                "+CMTI: \"SR\",4".to_owned(),
                "garbage".to_owned(),
            ],
            &mut storage,
        );
        assert_eq!(
            steps,
            [
                StorageStep::ReadDelete(1),
                StorageStep::Select("SR".to_owned()),
                StorageStep::ReadDelete(2),
                StorageStep::ReadDelete(4),
                StorageStep::Select("SM".to_owned()),
            ]
        );
        assert_eq!(storage.as_deref(), Some("SM"));
    }

    #[test]
    fn io_error_reconnects() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(AtConfig::serial("/dev/ttyS0"), now);
        session.handle_with_context(&ModemEvent::RIoError { now }, &mut ctx);
        assert_eq!(actions(&mut ctx), [ModemAction::Close]);
        assert_eq!(
            events(&mut ctx),
            [GatewayEvent::Status(ConnectorStatus::Reconnecting)]
        );
        assert_eq!(session.status, ConnectorStatus::Reconnecting);
        assert_eq!(
            session.next_deadline(now),
            Some(now + Duration::from_secs(10))
        );
    }

    #[test]
    fn shutdown_fails_queued_messages() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(AtConfig::serial("/dev/ttyS0"), now);
        send(&mut session, &mut ctx, Sms::mt("a", "123", "x"));
        session.handle_with_context(
            &ModemEvent::Command(ConnectorCommand::Shutdown { finish: false }),
            &mut ctx,
        );
        assert_eq!(actions(&mut ctx), [ModemAction::Close]);
        let events = events(&mut ctx);
        assert!(matches!(
            events.as_slice(),
            [
                GatewayEvent::SendFailed {
                    reason: FailReason::Shutdown,
                    ..
                },
                GatewayEvent::Status(ConnectorStatus::Dead),
                GatewayEvent::Killed
            ]
        ));

        send(&mut session, &mut ctx, Sms::mt("a", "123", "late"));
        assert!(matches!(
            self::events(&mut ctx).as_slice(),
            [GatewayEvent::SendFailed {
                reason: FailReason::Shutdown,
                ..
            }]
        ));
    }

    #[test]
    fn slow_shutdown_drains_queue() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(AtConfig::serial("/dev/ttyS0"), now);
        send(&mut session, &mut ctx, Sms::mt("a", "123", "x"));
        session.handle_with_context(
            &ModemEvent::Command(ConnectorCommand::Shutdown { finish: true }),
            &mut ctx,
        );
        assert!(actions(&mut ctx).is_empty());
        session.handle_with_context(&ModemEvent::Tick { now }, &mut ctx);
        assert!(matches!(
            actions(&mut ctx).as_slice(),
            [ModemAction::Send { .. }, ModemAction::Close]
        ));
        assert_eq!(*session.state(), State::dead());
    }

    #[test]
    fn late_submit_outcome_is_requeued() {
        let now = Instant::now();
        let (mut session, mut ctx) = active(AtConfig::serial("/dev/ttyS0"), now);
        session.handle_with_context(&ModemEvent::RIoError { now }, &mut ctx);
        assert_eq!(actions(&mut ctx), [ModemAction::Close]);
        events(&mut ctx);

        session.handle_with_context(
            &ModemEvent::RSubmitFailed {
                sms: Box::new(Sms::mt("a", "123", "x")),
                status: CommandStatus::Timeout,
            },
            &mut ctx,
        );
        session.handle_with_context(&ModemEvent::RIoError { now }, &mut ctx);
        assert!(matches!(session.state(), State::Reconnecting { .. }));
        assert!(events(&mut ctx).is_empty());
        assert_eq!(session.queued(), 1);
    }
}
