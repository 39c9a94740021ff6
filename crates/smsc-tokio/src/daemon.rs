use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use smsc_core::{
    Config, ConnectorCommand, ConnectorKind, ConnectorStatus, Dlr, GatewayEvent, Sms,
    emi::EmiReceiver,
};
use tokio::{
    net::TcpListener,
    spawn,
    sync::{
        Mutex,
        mpsc::{Receiver, Sender, channel, error::TrySendError},
    },
    task::JoinSet,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{AtConnection, EmiConnection, EmiListener};

/// Represents the state of a connector managed by the gateway daemon.
#[derive(Debug)]
pub struct ConnectorState {
    /// `at2` or `emi2`
    pub kind: &'static str,
    pub status: ConnectorStatus,
    /// Channel for sending commands to the connector
    pub command_tx: Sender<ConnectorCommand>,
    /// Inbound messages and delivery reports, dropped when not drained
    pub inbound_rx: Receiver<Sms>,
    /// Messages waiting to be sent
    pub queued: Arc<AtomicUsize>,
    pub received: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Runs the configured connectors and tracks their state.
///
/// # Examples
///
/// ```
/// use smsc_core::{AtConfig, Config, ConnectorConfig, ConnectorKind, EmiConfig};
/// use smsc_tokio::Daemon;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config {
///         connectors: [
///             (
///                 "modem".to_owned(),
///                 ConnectorConfig::new(ConnectorKind::At(AtConfig::serial("/dev/ttyUSB0"))),
///             ),
///             (
///                 "smsc".to_owned(),
///                 ConnectorConfig::new(ConnectorKind::Emi(EmiConfig::new("127.0.0.1", 5000))),
///             ),
///         ]
///         .into(),
///         dlr_storage: Default::default(),
///     };
///
///     let daemon = Daemon::new(config);
///
///     // Start the connectors and wait until all of them are shut down
///     // daemon.run().await?.join_all().await;
///
///     Ok(())
/// }
/// ```
pub struct Daemon {
    config: Config,
    dlr: Dlr,
    connectors: Arc<Mutex<HashMap<String, ConnectorState>>>,
}

impl Daemon {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            dlr: Dlr::new(config.dlr_storage),
            config,
            connectors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validates the configuration and starts every connector, each asked to
    /// connect right away.
    ///
    /// # Returns
    ///
    /// Returns a `JoinSet` with one task per connector driver and receive
    /// port. The caller can use it to wait for all of them to complete.
    ///
    /// # Errors
    ///
    /// Returns an error if a connector's configuration is invalid or a
    /// receive port cannot be bound.
    pub async fn run(&self) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
        let mut config = self.config.clone();
        config.validate()?;

        let mut handles = JoinSet::new();
        let connectors = self.connectors.clone();
        spawn(async move {
            loop {
                sleep(Duration::from_secs(15)).await;
                let connectors = connectors.lock().await;
                info!("connector state: {:?}", *connectors);
            }
        });

        for (name, connector) in &config.connectors {
            let (ev_tx, ev_rx) = channel(1024);
            let (command_tx, command_rx) = channel(1024);
            let (kind, queued) = match &connector.kind {
                ConnectorKind::At(at) => {
                    let mut conn = AtConnection::new(
                        name,
                        connector,
                        at.clone(),
                        self.dlr.clone(),
                        ev_tx.clone(),
                        command_rx,
                    );
                    let queued = conn.queued();
                    handles.spawn(supervise(
                        name.clone(),
                        async move { conn.run().await },
                        ev_tx,
                    ));
                    ("at2", queued)
                }
                ConnectorKind::Emi(emi) => {
                    let mut conn = EmiConnection::new(
                        name,
                        connector,
                        emi.clone(),
                        self.dlr.clone(),
                        ev_tx.clone(),
                        command_rx,
                    );
                    if let Some(port) = emi.receive_port {
                        let socket = TcpListener::bind(("0.0.0.0", port)).await?;
                        info!("EMI2[{name}]: waiting for SMSC connections on port {port}");
                        let smsc_id = connector.smsc_id.as_deref().unwrap_or(name);
                        let receiver =
                            EmiReceiver::new(name, smsc_id, emi.clone(), self.dlr.clone());
                        let mut listener =
                            EmiListener::new(receiver, conn.stopped(), ev_tx.clone());
                        handles.spawn(async move { listener.run(socket).await });
                    }
                    let queued = conn.queued();
                    handles.spawn(supervise(
                        name.clone(),
                        async move { conn.run().await },
                        ev_tx,
                    ));
                    ("emi2", queued)
                }
            };

            let (inbound_tx, inbound_rx) = channel(1024);
            self.connectors.lock().await.insert(
                name.clone(),
                ConnectorState {
                    kind,
                    status: ConnectorStatus::Connecting,
                    command_tx: command_tx.clone(),
                    inbound_rx,
                    queued,
                    received: 0,
                    sent: 0,
                    failed: 0,
                },
            );
            spawn(track(
                name.clone(),
                self.connectors.clone(),
                ev_rx,
                inbound_tx,
            ));
            command_tx.send(ConnectorCommand::Connect).await?;
        }

        Ok(handles)
    }

    /// Asks every connector to shut down, after its queue is sent if
    /// `finish` is set.
    pub async fn shutdown(&self, finish: bool) {
        for (name, connector) in self.connectors.lock().await.iter() {
            if let Err(e) = connector
                .command_tx
                .send(ConnectorCommand::Shutdown { finish })
                .await
            {
                debug!("{name}: already gone: {e}");
            }
        }
    }

    /// Creates a new reference to the [`ConnectorState`] [`HashMap`]
    #[must_use]
    pub fn connectors(&self) -> Arc<Mutex<HashMap<String, ConnectorState>>> {
        self.connectors.clone()
    }
}

/// Drives a connector, marking it dead if the driver fails.
///
/// The status goes through the connector's own notifications so it lands
/// after everything the driver reported.
async fn supervise(
    name: String,
    driver: impl Future<Output = anyhow::Result<()>>,
    ev_tx: Sender<GatewayEvent>,
) -> anyhow::Result<()> {
    let result = driver.await;
    if let Err(e) = &result {
        error!("{name}: connector failed: {e:#}");
        if let Err(e) = ev_tx.send(GatewayEvent::Status(ConnectorStatus::Dead)).await {
            debug!("{name}: no one tracks the connector: {e}");
        }
    }
    result
}

/// Applies a connector's notifications to its state until the connector is
/// gone.
async fn track(
    name: String,
    connectors: Arc<Mutex<HashMap<String, ConnectorState>>>,
    mut ev_rx: Receiver<GatewayEvent>,
    inbound_tx: Sender<Sms>,
) {
    while let Some(ev) = ev_rx.recv().await {
        let mut connectors = connectors.lock().await;
        let Some(state) = connectors.get_mut(&name) else {
            error!("{name}: no connector found for {ev:?}");
            return;
        };
        match ev {
            GatewayEvent::Status(status) => {
                debug!("{name}: status changed to {status}");
                state.status = status;
            }
            GatewayEvent::Connected => info!("{name}: connected"),
            GatewayEvent::Killed => info!("{name}: shut down"),
            GatewayEvent::Sent { sms, extra } => {
                state.sent += 1;
                info!(
                    "{name}: sent {} to {} ({})",
                    sms.id,
                    sms.receiver,
                    extra.as_deref().unwrap_or("")
                );
            }
            GatewayEvent::SendFailed { sms, reason, text } => {
                state.failed += 1;
                warn!("{name}: sending {} failed: {reason:?} {text}", sms.id);
            }
            GatewayEvent::Receive(sms) => {
                state.received += 1;
                info!("{name}: received {sms}");
                if let Err(TrySendError::Full(sms)) = inbound_tx.try_send(sms) {
                    warn!("{name}: inbound queue full, dropping {}", sms.id);
                }
            }
        }
    }
    debug!("{name}: connector closed");
    if let Some(state) = connectors.lock().await.get(&name) {
        debug!(
            "{name}: {} sent, {} failed, {} received, {} left",
            state.sent,
            state.failed,
            state.received,
            state.queued.load(Ordering::Relaxed)
        );
    }
}
