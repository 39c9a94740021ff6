//! Byte streams to a modem: serial line, raw TCP or telnet.

use std::future::Future;

use anyhow::Context as _;
use smsc_core::AtDevice;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt as _, StopBits};
use tracing::debug;

/// Anything a modem can be driven over.
pub trait ModemIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ModemIo for T {}

pub type Transport = Box<dyn ModemIo>;

/// Opens the stream to a modem.
pub trait Opener: Send {
    /// Opens `device`; `speed` and `hardware_flow_control` only apply to a
    /// serial line.
    fn open(
        &mut self,
        device: &AtDevice,
        speed: u32,
        hardware_flow_control: bool,
    ) -> impl Future<Output = anyhow::Result<Transport>> + Send;
}

/// Opens the configured device itself.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceOpener;

impl Opener for DeviceOpener {
    async fn open(
        &mut self,
        device: &AtDevice,
        speed: u32,
        hardware_flow_control: bool,
    ) -> anyhow::Result<Transport> {
        open(device, speed, hardware_flow_control).await
    }
}

/// Opens `device` with 8N1 framing at `speed` if it is a serial line.
///
/// # Errors
///
/// Fails if the device cannot be opened or the host cannot be reached.
pub async fn open(
    device: &AtDevice,
    speed: u32,
    hardware_flow_control: bool,
) -> anyhow::Result<Transport> {
    match device {
        AtDevice::Serial(path) => {
            debug!("opening serial device {path} at {speed} bps");
            let port = tokio_serial::new(path, speed)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(if hardware_flow_control {
                    FlowControl::Hardware
                } else {
                    FlowControl::None
                })
                .open_native_async()
                .with_context(|| format!("failed to open serial device {path}"))?;
            Ok(Box::new(port))
        }
        AtDevice::RawTcp { host, port } | AtDevice::Telnet { host, port } => {
            debug!("connecting to {host}:{port}");
            let socket = TcpStream::connect((host.as_str(), *port))
                .await
                .with_context(|| format!("failed to connect to {host}:{port}"))?;
            socket.set_nodelay(true)?;
            Ok(Box::new(socket))
        }
    }
}
