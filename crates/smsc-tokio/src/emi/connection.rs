use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context as _, anyhow};
use smsc_core::{
    ConnectorCommand, ConnectorConfig, Dlr, EmiConfig, GatewayEvent,
    emi::{EmiAction, EmiContext, EmiEvent, EmiSession, State, take_packet},
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpSocket, TcpStream, lookup_host},
    select,
    sync::{
        mpsc::{Receiver, Sender},
        watch,
    },
    time::{Instant, timeout},
};
use tracing::{debug, error, info};

use crate::sleep_until_deadline;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens a TCP connection to `host:port`, from `our_host` if given.
///
/// # Errors
///
/// Fails if the host does not resolve or the connection is refused or times
/// out.
pub async fn connect(host: &str, port: u16, our_host: Option<&str>) -> anyhow::Result<TcpStream> {
    let addr = lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| anyhow!("{host} does not resolve"))?;
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(our_host) = our_host {
        let local = lookup_host((our_host, 0))
            .await?
            .find(|a| a.is_ipv4() == addr.is_ipv4())
            .ok_or_else(|| anyhow!("{our_host} does not resolve"))?;
        socket
            .bind(local)
            .with_context(|| format!("cannot bind to {local}"))?;
    }
    let stream = timeout(CONNECT_TIMEOUT, socket.connect(addr))
        .await
        .with_context(|| format!("connecting to {addr} timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn read_some(socket: &mut Option<TcpStream>, buf: &mut [u8]) -> std::io::Result<usize> {
    match socket {
        Some(socket) => socket.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Drives the main connection of one EMI connector.
pub struct EmiConnection {
    session: EmiSession,
    ctx: EmiContext,
    socket: Option<TcpStream>,
    inbuf: Vec<u8>,
    tx: Sender<GatewayEvent>,
    rx: Receiver<ConnectorCommand>,
    queued: Arc<AtomicUsize>,
    stopped: watch::Sender<bool>,
}

impl EmiConnection {
    #[must_use]
    pub fn new(
        name: &str,
        connector: &ConnectorConfig,
        config: EmiConfig,
        dlr: Dlr,
        tx: Sender<GatewayEvent>,
        rx: Receiver<ConnectorCommand>,
    ) -> Self {
        let mut ctx = EmiContext::default();
        Self {
            session: EmiSession::new(name, connector, config, dlr, &mut ctx),
            ctx,
            socket: None,
            inbuf: Vec::new(),
            tx,
            rx,
            queued: Arc::default(),
            stopped: watch::Sender::new(false),
        }
    }

    /// Number of messages waiting to be submitted.
    #[must_use]
    pub fn queued(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.queued)
    }

    /// Follows start and stop commands. Closed once the connection is gone.
    #[must_use]
    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stopped.subscribe()
    }

    fn handle(&mut self, event: EmiEvent) {
        self.session.handle_with_context(&event, &mut self.ctx);
    }

    async fn execute(&mut self, action: EmiAction) {
        match action {
            EmiAction::Connect { host, port } => {
                self.close().await;
                let our_host = self.session.config.our_host.clone();
                match connect(&host, port, our_host.as_deref()).await {
                    Ok(socket) => {
                        info!("EMI2[{}]: connected to {host}:{port}", self.session.name);
                        self.socket = Some(socket);
                        self.handle(EmiEvent::RConnected {
                            now: Instant::now().into(),
                        });
                    }
                    Err(e) => {
                        error!("EMI2[{}]: {e:#}", self.session.name);
                        self.handle(EmiEvent::RConnectFailed {
                            now: Instant::now().into(),
                        });
                    }
                }
            }
            EmiAction::Send(msg) => {
                let Some(socket) = self.socket.as_mut() else {
                    // the slot stays taken and is requeued on reconnect
                    debug!(
                        "EMI2[{}]: no connection, dropping <{msg}>",
                        self.session.name
                    );
                    return;
                };
                if let Err(e) = socket.write_all(&msg.to_bytes()).await {
                    error!("EMI2[{}]: write failed: {e}", self.session.name);
                    self.socket = None;
                    self.handle(EmiEvent::RClosed {
                        now: Instant::now().into(),
                    });
                }
            }
            EmiAction::Close => self.close().await,
        }
    }

    async fn close(&mut self) {
        self.inbuf.clear();
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.shutdown().await {
                debug!("EMI2[{}]: closing: {e}", self.session.name);
            }
        }
    }

    fn received(&mut self, data: &[u8]) {
        self.inbuf.extend_from_slice(data);
        while let Some(packet) = take_packet(&mut self.inbuf) {
            self.handle(EmiEvent::RPacket {
                now: Instant::now().into(),
                packet,
            });
            if !matches!(
                self.session.state(),
                State::LoggingIn { .. } | State::Active {}
            ) {
                // the rest belongs to a connection the session gave up
                self.inbuf.clear();
                break;
            }
        }
    }

    /// Runs until the connector is shut down.
    ///
    /// # Errors
    ///
    /// Fails if the session reached its error state or the gateway stopped
    /// listening.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut buffer = [0; 4096];
        'connection: loop {
            let deadline = self.session.next_deadline(Instant::now().into());
            select! {
                // packets out first, then commands from the gateway, then
                // notifications to it, then timers, then the socket
                biased;

                action = self.ctx.action_future() => {
                    self.execute(action).await;
                }

                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        error!("EMI2[{}]: command channel closed", self.session.name);
                        break 'connection;
                    };
                    debug!("EMI2[{}]: handling command {cmd:?}", self.session.name);
                    self.handle(EmiEvent::Command(cmd));
                }

                event = self.ctx.event_future() => {
                    if let Err(e) = self.tx.send(event).await {
                        error!("EMI2[{}]: gateway channel closed: {e}", self.session.name);
                        break 'connection;
                    }
                }

                () = sleep_until_deadline(deadline) => {
                    self.handle(EmiEvent::Tick { now: Instant::now().into() });
                }

                received = read_some(&mut self.socket, &mut buffer) => {
                    match received {
                        Ok(0) => {
                            self.socket = None;
                            self.handle(EmiEvent::RClosed { now: Instant::now().into() });
                        }
                        Ok(n) => self.received(&buffer[..n]),
                        Err(e) => {
                            debug!("EMI2[{}]: read failed: {e}", self.session.name);
                            self.socket = None;
                            self.handle(EmiEvent::RClosed { now: Instant::now().into() });
                        }
                    }
                }
            }

            self.queued.store(self.session.queued(), Ordering::Relaxed);
            let stopped = self.session.stopped;
            self.stopped.send_if_modified(|s| std::mem::replace(s, stopped) != stopped);
            match self.session.state() {
                State::Dead {} => break 'connection,
                State::Error {} => {
                    return Err(anyhow!(
                        "EMI2[{}]: reached state ERROR, terminating",
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
        self.close().await;
        debug!("EMI2[{}]: connection has been shut down", self.session.name);
        Ok(())
    }
}
