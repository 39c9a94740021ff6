use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{anyhow, bail};
use smsc_core::{
    AtConfig, AtDevice, ConnectorCommand, ConnectorConfig, Dlr, GatewayEvent,
    at::{
        CommandStatus, ModemAction, ModemContext, ModemDefinition, ModemEvent, ModemSession,
        Prompt, State,
    },
};
use tokio::{
    select,
    sync::mpsc::{Receiver, Sender},
    time::Instant,
};
use tracing::{debug, error, info};

use crate::{
    at::Modem,
    sleep_until_deadline,
    transport::{DeviceOpener, Opener},
};

async fn unsolicited(modem: Option<&mut Modem>) -> anyhow::Result<()> {
    match modem {
        Some(modem) => modem.readable().await,
        None => std::future::pending().await,
    }
}

/// Line speeds tried when none is configured, fastest first.
const SPEEDS: [u32; 5] = [115_200, 57_600, 38_400, 19_200, 9_600];
/// How long to keep reading once the modem started sending on its own.
const LISTEN: Duration = Duration::from_millis(100);

/// Drives one AT modem: executes the session's actions on the device and
/// feeds the outcomes back.
pub struct AtConnection<O = DeviceOpener> {
    session: ModemSession,
    ctx: ModemContext,
    opener: O,
    modem: Option<Modem>,
    /// The device failed; its remaining actions are skipped until reopened.
    broken: bool,
    tx: Sender<GatewayEvent>,
    rx: Receiver<ConnectorCommand>,
    queued: Arc<AtomicUsize>,
}

impl AtConnection {
    #[must_use]
    pub fn new(
        name: &str,
        connector: &ConnectorConfig,
        config: AtConfig,
        dlr: Dlr,
        tx: Sender<GatewayEvent>,
        rx: Receiver<ConnectorCommand>,
    ) -> Self {
        Self::with_opener(name, connector, config, dlr, DeviceOpener, tx, rx)
    }
}

impl<O: Opener> AtConnection<O> {
    #[must_use]
    pub fn with_opener(
        name: &str,
        connector: &ConnectorConfig,
        config: AtConfig,
        dlr: Dlr,
        opener: O,
        tx: Sender<GatewayEvent>,
        rx: Receiver<ConnectorCommand>,
    ) -> Self {
        let mut ctx = ModemContext::default();
        Self {
            session: ModemSession::new(name, connector, config, dlr, &mut ctx),
            ctx,
            opener,
            modem: None,
            broken: false,
            tx,
            rx,
            queued: Arc::default(),
        }
    }

    /// Number of messages waiting for the modem, updated as the driver runs.
    #[must_use]
    pub fn queued(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.queued)
    }

    fn handle(&mut self, event: ModemEvent) {
        self.session.handle_with_context(&event, &mut self.ctx);
    }

    /// Hands what the modem sent on its own to the session.
    fn forward_device_events(&mut self) {
        let events = self
            .modem
            .as_mut()
            .map(Modem::take_events)
            .unwrap_or_default();
        for event in events {
            self.handle(event);
        }
    }

    fn io_error(&mut self, e: &anyhow::Error) {
        error!("AT2[{}]: {e:#}", self.session.name);
        self.broken = true;
        self.forward_device_events();
        self.handle(ModemEvent::RIoError {
            now: Instant::now().into(),
        });
    }

    /// Opens the device at `speed` and checks that the modem answers.
    async fn try_speed(&mut self, speed: u32, hwfc: bool) -> anyhow::Result<Option<Modem>> {
        let config = &self.session.config;
        let io = self.opener.open(&config.device, speed, hwfc).await?;
        let telnet = matches!(config.device, AtDevice::Telnet { .. });
        let mut modem = Modem::new(&self.session.name, io, ModemDefinition::default(), telnet);
        if modem.answers().await? {
            Ok(Some(modem))
        } else {
            modem.close().await;
            Ok(None)
        }
    }

    /// Detects the line speed if unknown, then identifies the modem if its
    /// type is not configured.
    async fn open(&mut self) -> anyhow::Result<(Modem, u32)> {
        let name = self.session.name.clone();
        let known = self.session.modem.clone();
        let hwfc = known
            .as_ref()
            .is_none_or(|m| m.hardware_flow_control);
        let serial = matches!(self.session.config.device, AtDevice::Serial(_));

        let mut speed = self.session.speed;
        if speed == 0 {
            speed = known.as_ref().map_or(0, |m| m.speed);
        }
        let mut modem = None;
        if serial && speed == 0 {
            info!("AT2[{name}]: detecting modem speed.");
            for candidate in SPEEDS {
                debug!("AT2[{name}]: trying speed {candidate}");
                if let Some(found) = self.try_speed(candidate, hwfc).await? {
                    info!("AT2[{name}]: found modem speed {candidate}");
                    speed = candidate;
                    modem = Some(found);
                    break;
                }
            }
            if modem.is_none() {
                bail!("AT2[{name}]: cannot detect modem speed");
            }
        }
        let mut modem = match modem {
            Some(modem) => modem,
            None => {
                let config = &self.session.config;
                let io = self.opener.open(&config.device, speed, hwfc).await?;
                let telnet = matches!(config.device, AtDevice::Telnet { .. });
                Modem::new(&name, io, ModemDefinition::default(), telnet)
            }
        };
        modem.definition = match known {
            Some(definition) => definition,
            None => {
                let detected = modem.identify().await?;
                info!("AT2[{name}]: found modem <{}>", detected.name);
                detected
            }
        };
        Ok((modem, speed))
    }

    fn device(&mut self) -> anyhow::Result<&mut Modem> {
        self.modem
            .as_mut()
            .ok_or_else(|| anyhow!("AT2[{}]: device is not open", self.session.name))
    }

    #[expect(
        clippy::too_many_lines,
        reason = "one arm per action keeps the device protocol in one place"
    )]
    async fn execute(&mut self, action: ModemAction) {
        debug!("AT2[{}]: executing {action:?}", self.session.name);
        let config = self.session.config.clone();
        match action {
            ModemAction::Open => {
                if let Some(old) = self.modem.take() {
                    old.close().await;
                }
                self.broken = false;
                match self.open().await {
                    Ok((modem, speed)) => {
                        let definition = modem.definition.clone();
                        self.modem = Some(modem);
                        self.handle(ModemEvent::ROpened {
                            now: Instant::now().into(),
                            speed,
                            modem: Box::new(definition),
                        });
                    }
                    Err(e) => {
                        error!("{e:#}");
                        self.handle(ModemEvent::ROpenFailed {
                            now: Instant::now().into(),
                        });
                    }
                }
            }
            ModemAction::Close => {
                if let Some(modem) = self.modem.take() {
                    modem.close().await;
                }
            }
            ModemAction::Send { sms, .. } if self.broken => {
                self.handle(ModemEvent::RSubmitFailed {
                    sms,
                    status: CommandStatus::Timeout,
                });
            }
            _ if self.broken => {
                debug!("AT2[{}]: device failed, skipping {action:?}", self.session.name);
            }
            ModemAction::Login => {
                let result = match self.device() {
                    Ok(modem) => modem.login(&config).await,
                    Err(e) => Err(e),
                };
                self.forward_device_events();
                let now = Instant::now().into();
                match result {
                    Ok(()) => self.handle(ModemEvent::RLoggedIn { now }),
                    Err(e) => {
                        error!("{e:#}");
                        self.handle(ModemEvent::RLoginFailed { now });
                    }
                }
            }
            ModemAction::Initialize { reset } => {
                let result = match self.device() {
                    Ok(modem) => modem.initialize(&config, reset).await,
                    Err(e) => Err(e),
                };
                self.forward_device_events();
                let now = Instant::now().into();
                match result {
                    Ok(phase2plus) => {
                        if let Some(modem) = self.modem.as_mut() {
                            modem.ack_deliveries = phase2plus;
                        }
                        self.handle(ModemEvent::RInitialized { now, phase2plus });
                    }
                    Err(e) => {
                        error!("{e:#}");
                        self.handle(ModemEvent::RInitFailed { now });
                    }
                }
            }
            ModemAction::Keepalive => {
                let result = match self.device() {
                    Ok(modem) => modem.keepalive().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(status) if status.answered() => self.forward_device_events(),
                    Ok(status) => self.io_error(&anyhow!(
                        "modem does not answer the keepalive: {status:?}"
                    )),
                    Err(e) => self.io_error(&e),
                }
            }
            ModemAction::ReadStored(steps) => {
                let result = match self.device() {
                    Ok(modem) => modem.read_stored(&steps).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => self.forward_device_events(),
                    Err(e) => self.io_error(&e),
                }
            }
            ModemAction::PollMemory => {
                let result = match self.device() {
                    Ok(modem) => modem.poll_memory().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => self.forward_device_events(),
                    Err(e) => self.io_error(&e),
                }
            }
            ModemAction::Send {
                sms,
                pdu,
                keep_link,
            } => {
                let result = match self.device() {
                    Ok(modem) => modem.submit(&pdu, keep_link).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok((CommandStatus::Ok, msg_ref)) => {
                        self.forward_device_events();
                        self.handle(ModemEvent::RSubmitted { sms, msg_ref });
                    }
                    Ok((status, _)) => {
                        self.forward_device_events();
                        self.handle(ModemEvent::RSubmitFailed { sms, status });
                    }
                    Err(e) => {
                        self.handle(ModemEvent::RSubmitFailed {
                            sms,
                            status: CommandStatus::Timeout,
                        });
                        self.io_error(&e);
                    }
                }
            }
        }
    }

    /// Whether the device is watched for unsolicited lines.
    fn listening(&self) -> bool {
        !self.broken && matches!(self.session.state(), State::Active { .. })
    }

    /// Collects the lines the modem started sending on its own.
    async fn listen(&mut self) {
        let Some(modem) = self.modem.as_mut() else {
            return;
        };
        match modem.wait(LISTEN, Prompt::None).await {
            Ok(_) => self.forward_device_events(),
            Err(e) => self.io_error(&e),
        }
    }

    /// Runs until the connector is shut down.
    ///
    /// # Errors
    ///
    /// Fails if the session reached its error state or the gateway stopped
    /// listening.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        'connection: loop {
            let deadline = self.session.next_deadline(Instant::now().into());
            let listening = self.listening();
            select! {
                // device work first, then commands from the gateway, then
                // notifications to it, then timers, then the modem
                biased;

                action = self.ctx.action_future() => {
                    self.execute(action).await;
                }

                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        error!("AT2[{}]: command channel closed", self.session.name);
                        break 'connection;
                    };
                    debug!("AT2[{}]: handling command {cmd:?}", self.session.name);
                    self.handle(ModemEvent::Command(cmd));
                }

                event = self.ctx.event_future() => {
                    if let Err(e) = self.tx.send(event).await {
                        error!("AT2[{}]: gateway channel closed: {e}", self.session.name);
                        break 'connection;
                    }
                }

                () = sleep_until_deadline(deadline) => {
                    self.handle(ModemEvent::Tick { now: Instant::now().into() });
                }

                read = unsolicited(self.modem.as_mut().filter(|_| listening)) => {
                    match read {
                        Ok(()) => self.listen().await,
                        Err(e) => self.io_error(&e),
                    }
                }
            }

            self.queued
                .store(self.session.queued(), Ordering::Relaxed);
            match self.session.state() {
                State::Dead {} => break 'connection,
                State::Error {} => {
                    return Err(anyhow!(
                        "AT2[{}]: reached state ERROR, terminating",
                        self.session.name
                    ));
                }
                _ => (),
            }
        }

        while let Some(action) = self.ctx.poll_action() {
            self.execute(action).await;
        }
        while let Some(event) = self.ctx.poll_event() {
            self.tx.send(event).await?;
        }
        if let Some(modem) = self.modem.take() {
            modem.close().await;
        }
        debug!("AT2[{}]: connection thread has been shut down", self.session.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use smsc_core::{ConnectorKind, ConnectorStatus, Sms};
    use tokio::{
        io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream, duplex},
        sync::mpsc::channel,
    };

    use super::*;
    use crate::transport::Transport;

    /// Hands out prepared pipes instead of opening a device.
    struct Pipes(Vec<DuplexStream>);

    impl Opener for Pipes {
        async fn open(&mut self, _: &AtDevice, _: u32, _: bool) -> anyhow::Result<Transport> {
            let io = self.0.pop().ok_or_else(|| anyhow!("no modem"))?;
            Ok(Box::new(io))
        }
    }

    /// A modem that answers `OK` to everything, reports `+CMGS: 42` after a
    /// PDU and delivers one message after initialisation.
    async fn fake_modem(io: DuplexStream) {
        let (read, mut write) = tokio::io::split(io);
        let mut reader = BufReader::new(read);
        let mut line = Vec::new();
        loop {
            line.clear();
            let Ok(n) = reader.read_until(b'\r', &mut line).await else {
                return;
            };
            if n == 0 {
                return;
            }
            let cmd = String::from_utf8_lossy(&line).trim().to_owned();
            let answer: &[u8] = if cmd.starts_with("AT+CMGS=") {
                b"\r\n> "
            } else if cmd == "AT+CPIN?" {
                b"\r\n+CPIN: READY\r\n\r\nOK\r\n"
            } else if cmd == "ATI" {
                b"\r\nWAVECOM MODEM\r\nOK\r\n"
            } else if cmd == "AT+CNMI=1,2,0,1,0" {
                b"\r\nOK\r\n+CMT: ,24\r\n0791947106004034040B912120550521F300004230512103540005C82293F904\r\n"
            } else {
                b"\r\nOK\r\n"
            };
            if write.write_all(answer).await.is_err() {
                return;
            }
            // the PDU ends at ctrl-Z, not at a carriage return
            if cmd.starts_with("AT+CMGS=") {
                line.clear();
                if reader.read_until(0x1A, &mut line).await.is_err() {
                    return;
                }
                if write.write_all(b"\r\n+CMGS: 42\r\n\r\nOK\r\n").await.is_err() {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn initializes_receives_and_sends() {
        let (near, far) = duplex(8192);
        tokio::spawn(fake_modem(far));

        let mut config = AtConfig::serial("/dev/ttyS0");
        config.speed = 9600;
        config.modem_type = Some("generic".to_owned());
        let connector = ConnectorConfig::new(ConnectorKind::At(config.clone()));
        let (event_tx, mut event_rx) = channel(16);
        let (cmd_tx, cmd_rx) = channel(16);
        let mut connection = AtConnection::with_opener(
            "modem",
            &connector,
            config,
            Dlr::default(),
            Pipes(vec![near]),
            event_tx,
            cmd_rx,
        );
        let driver = tokio::spawn(async move { connection.run().await });

        cmd_tx.send(ConnectorCommand::Connect).await.unwrap();
        assert_eq!(
            event_rx.recv().await.unwrap(),
            GatewayEvent::Status(ConnectorStatus::Active)
        );
        assert_eq!(event_rx.recv().await.unwrap(), GatewayEvent::Connected);
        let GatewayEvent::Receive(sms) = event_rx.recv().await.unwrap() else {
            panic!("expected the delivered message");
        };
        assert_eq!(sms.text(), "HELLO");

        cmd_tx
            .send(ConnectorCommand::Send(Box::new(Sms::mt("4711", "0049171", "hi"))))
            .await
            .unwrap();
        let GatewayEvent::Sent { sms, .. } = event_rx.recv().await.unwrap() else {
            panic!("expected the submit to succeed");
        };
        assert_eq!(sms.text(), "hi");

        cmd_tx
            .send(ConnectorCommand::Shutdown { finish: false })
            .await
            .unwrap();
        assert_eq!(
            event_rx.recv().await.unwrap(),
            GatewayEvent::Status(ConnectorStatus::Dead)
        );
        assert_eq!(event_rx.recv().await.unwrap(), GatewayEvent::Killed);
        driver.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_retries() {
        let config = AtConfig::serial("/dev/ttyS0");
        let mut connector = ConnectorConfig::new(ConnectorKind::At(config.clone()));
        connector.reconnect_delay = Duration::from_secs(5);
        let (event_tx, mut event_rx) = channel(16);
        let (cmd_tx, cmd_rx) = channel(16);
        let mut connection = AtConnection::with_opener(
            "modem",
            &connector,
            config,
            Dlr::default(),
            Pipes(Vec::new()),
            event_tx,
            cmd_rx,
        );
        let queued = connection.queued();
        let driver = tokio::spawn(async move { connection.run().await });

        cmd_tx.send(ConnectorCommand::Connect).await.unwrap();
        cmd_tx
            .send(ConnectorCommand::Send(Box::new(Sms::mt("4711", "0049171", "hi"))))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(queued.load(Ordering::Relaxed), 1);

        cmd_tx
            .send(ConnectorCommand::Shutdown { finish: false })
            .await
            .unwrap();
        assert!(matches!(
            event_rx.recv().await.unwrap(),
            GatewayEvent::SendFailed { .. }
        ));
        assert_eq!(
            event_rx.recv().await.unwrap(),
            GatewayEvent::Status(ConnectorStatus::Dead)
        );
        assert_eq!(event_rx.recv().await.unwrap(), GatewayEvent::Killed);
        driver.await.unwrap().unwrap();
    }
}
