use smsc_core::{
    GatewayEvent,
    emi::{EmiReceiver, take_packet},
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
    select,
    sync::{mpsc::Sender, watch},
};
use tracing::{debug, error, info};

/// Accepts the connections an SMSC opens to deliver messages, one at a time.
pub struct EmiListener {
    receiver: EmiReceiver,
    stopped: watch::Receiver<bool>,
    tx: Sender<GatewayEvent>,
}

impl EmiListener {
    /// `stopped` follows the main connection and closing it ends the
    /// listener.
    #[must_use]
    pub fn new(
        receiver: EmiReceiver,
        stopped: watch::Receiver<bool>,
        tx: Sender<GatewayEvent>,
    ) -> Self {
        Self {
            receiver,
            stopped,
            tx,
        }
    }

    /// Serves `listener` until the main connection is gone.
    ///
    /// # Errors
    ///
    /// Fails if accepting fails.
    pub async fn run(&mut self, listener: TcpListener) -> anyhow::Result<()> {
        let name = self.receiver.name.clone();
        loop {
            let (socket, peer) = select! {
                accepted = listener.accept() => accepted?,
                changed = self.stopped.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let ip = peer.ip().to_string();
            if !self.receiver.accepts(&ip) {
                continue;
            }
            info!("EMI2[{name}]: smsc connected from {ip}");
            if !self.serve(socket).await {
                break;
            }
            info!("EMI2[{name}]: receive connection closed by SMSC");
        }
        debug!("EMI2[{name}]: receive listener has been shut down");
        Ok(())
    }

    /// Answers operations until the peer goes away. Returns `false` once
    /// the listener must end.
    async fn serve(&mut self, mut socket: TcpStream) -> bool {
        let name = self.receiver.name.clone();
        let mut inbuf = Vec::new();
        let mut buffer = [0; 4096];
        loop {
            let n = select! {
                read = socket.read(&mut buffer) => match read {
                    Ok(0) => return true,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("EMI2[{name}]: receive connection failed: {e}");
                        return true;
                    }
                },
                changed = self.stopped.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    continue;
                }
            };
            inbuf.extend_from_slice(&buffer[..n]);
            while let Some(packet) = take_packet(&mut inbuf) {
                if *self.stopped.borrow() {
                    info!(
                        "EMI2[{name}]: Ignoring operation from receive socket because the connection is stopped."
                    );
                    continue;
                }
                let Some(answer) = self.receiver.handle(&packet) else {
                    continue;
                };
                if let Err(e) = socket.write_all(&answer.reply.to_bytes()).await {
                    error!("EMI2[{name}]: cannot answer on receive connection: {e}");
                    return true;
                }
                if let Some(sms) = answer.received {
                    if self.tx.send(GatewayEvent::Receive(sms)).await.is_err() {
                        error!("EMI2[{name}]: gateway channel closed");
                        return false;
                    }
                }
            }
        }
    }
}
