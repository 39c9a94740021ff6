use std::{collections::HashMap, time::Duration};

use anyhow::bail;
use tracing::warn;

use crate::DlrStorage;

/// Highest TRN plus one; also the largest usable EMI window.
pub const EMI_MAX_TRN: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub connectors: HashMap<String, ConnectorConfig>,
    pub dlr_storage: DlrStorage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Identifier used for delivery report correlation, defaults to the
    /// connector name.
    pub smsc_id: Option<String>,
    pub reconnect_delay: Duration,
    /// Maximum messages per second, unlimited if `None`.
    pub throughput: Option<u32>,
    /// Prefer the `0xFX` data coding group for 7-bit and 8-bit messages.
    pub alt_dcs: bool,
    pub kind: ConnectorKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectorKind {
    At(AtConfig),
    Emi(EmiConfig),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AtDevice {
    Serial(String),
    RawTcp { host: String, port: u16 },
    Telnet { host: String, port: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtConfig {
    pub device: AtDevice,
    /// Line speed, `0` detects the modem's speed.
    pub speed: u32,
    /// Builtin modem id, `None` detects the modem from its `ATI` banner.
    pub modem_type: Option<String>,
    pub pin: Option<String>,
    pub sms_center: Option<String>,
    pub my_number: Option<String>,
    /// Relative TP-VP octet used when a message carries no validity.
    pub validity_period: Option<u8>,
    pub keepalive: Option<Duration>,
    /// Poll the SIM message store for messages the modem buffered there.
    pub sim_buffering: bool,
    pub sms_memory_poll_interval: Duration,
    /// Send the modem's reset string after this many failed initialisations.
    pub max_error_count: Option<u32>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub login_prompt: Option<String>,
    pub password_prompt: Option<String>,
}

impl AtConfig {
    #[must_use]
    pub fn serial(device: impl Into<String>) -> Self {
        Self {
            device: AtDevice::Serial(device.into()),
            speed: 0,
            modem_type: None,
            pin: None,
            sms_center: None,
            my_number: None,
            validity_period: None,
            keepalive: None,
            sim_buffering: false,
            sms_memory_poll_interval: Duration::from_secs(60),
            max_error_count: None,
            username: None,
            password: None,
            login_prompt: None,
            password_prompt: None,
        }
    }

    /// Interval between SIM storage polls: the keepalive interval if one is
    /// set, `None` without SIM buffering.
    #[must_use]
    pub fn memory_poll_interval(&self) -> Option<Duration> {
        self.sim_buffering
            .then(|| self.keepalive.unwrap_or(self.sms_memory_poll_interval))
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FlowControl {
    #[default]
    Windowed,
    StopAndWait,
}

/// What to do with a submit whose acknowledgement did not arrive in time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WaitAckExpire {
    /// Drop the connection and requeue every outstanding message.
    #[default]
    Disconnect,
    Resend,
    /// Keep waiting, only log.
    Wait,
}

impl TryFrom<u8> for WaitAckExpire {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Disconnect,
            0x01 => Self::Resend,
            0x02 => Self::Wait,
            _ => bail!("'wait-ack-expire' {value} invalid"),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmiConfig {
    pub host: String,
    pub port: u16,
    pub alt_host: Option<String>,
    pub alt_port: Option<u16>,
    /// Port to accept SMSC initiated connections on.
    pub receive_port: Option<u16>,
    pub our_host: Option<String>,
    /// `;` separated address patterns, `*` matches one octet.
    pub allowed_ips: Option<String>,
    pub denied_ips: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub my_number: Option<String>,
    pub flow_control: FlowControl,
    pub window: usize,
    pub keepalive: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub waitack: Duration,
    pub waitack_expire: WaitAckExpire,
    pub notification_pid: Option<String>,
    pub notification_addr: Option<String>,
    /// Use the German NRC (ISO 21) variant of the GSM alphabet.
    pub alt_charset: bool,
}

impl EmiConfig {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            alt_host: None,
            alt_port: None,
            receive_port: None,
            our_host: None,
            allowed_ips: None,
            denied_ips: None,
            username: None,
            password: None,
            my_number: None,
            flow_control: FlowControl::Windowed,
            window: EMI_MAX_TRN,
            keepalive: None,
            idle_timeout: None,
            waitack: Duration::from_secs(60),
            waitack_expire: WaitAckExpire::Disconnect,
            notification_pid: None,
            notification_addr: None,
            alt_charset: false,
        }
    }

    /// Everything not explicitly allowed is denied once an allow list exists.
    #[must_use]
    pub fn effective_denied_ips(&self) -> Option<&str> {
        if self.allowed_ips.is_some() {
            Some("*.*.*.*")
        } else {
            self.denied_ips.as_deref()
        }
    }

    /// Wait between main loop passes: the keepalive and idle deadlines,
    /// 30 seconds if neither is set.
    #[must_use]
    pub fn wait_timeout(&self, connected: bool) -> Duration {
        let keepalive = self.keepalive.map(|k| k + Duration::from_secs(1));
        let idle = self.idle_timeout.filter(|_| connected);
        match (keepalive, idle) {
            (Some(k), Some(i)) => k.min(i),
            (Some(t), None) | (None, Some(t)) => t,
            (None, None) => Duration::from_secs(30),
        }
    }
}

impl ConnectorConfig {
    #[must_use]
    pub fn new(kind: ConnectorKind) -> Self {
        Self {
            smsc_id: None,
            reconnect_delay: Duration::from_secs(10),
            throughput: None,
            alt_dcs: false,
            kind,
        }
    }

    /// Checks and normalises the configuration of connector `name`.
    ///
    /// Errors are fatal for the connector: it must not be started.
    pub fn validate(&mut self, name: &str) -> anyhow::Result<()> {
        match &mut self.kind {
            ConnectorKind::At(at) => {
                match &at.device {
                    AtDevice::Serial(path) if path.is_empty() => {
                        bail!("AT2[{name}]: 'device' missing in at2 configuration.")
                    }
                    AtDevice::RawTcp { host, port } | AtDevice::Telnet { host, port }
                        if host.is_empty() || *port == 0 =>
                    {
                        bail!("AT2[{name}]: 'host' or 'port' missing in at2 configuration.")
                    }
                    _ => (),
                }
                if at.password.is_some() && at.username.is_none() {
                    bail!("AT2[{name}]: 'smsc-password' given without 'smsc-username'");
                }
            }
            ConnectorKind::Emi(emi) => {
                if emi.host.is_empty() {
                    bail!("EMI2[{name}]: 'host' missing in emi2 configuration.");
                }
                if emi.port == 0 {
                    bail!("EMI2[{name}]: 'port' missing/invalid in emi2 configuration.");
                }
                if emi.password.is_some() && emi.username.is_none() {
                    bail!("EMI2[{name}]: 'smsc-password' given without 'smsc-username'");
                }
                if emi.window == 0 {
                    warn!("EMI2[{name}]: Value of 'window' should be at least 1.");
                    emi.window = 1;
                }
                if emi.window > EMI_MAX_TRN {
                    warn!(
                        "EMI2[{name}]: Value of 'window' should be lesser or equal to {EMI_MAX_TRN}.."
                    );
                    emi.window = EMI_MAX_TRN;
                }
                if emi.waitack < Duration::from_secs(30) {
                    bail!("EMI2[{name}]: 'wait-ack' invalid in emi2 configuration.");
                }
                if emi.keepalive.is_some() && emi.username.is_none() && emi.my_number.is_none() {
                    warn!("EMI2[{name}]: 'keepalive' needs 'smsc-username' or 'my-number', disabled");
                    emi.keepalive = None;
                }
            }
        }
        Ok(())
    }
}

impl Config {
    /// Validates every connector, failing on the first invalid one.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        for (name, connector) in &mut self.connectors {
            connector.validate(name)?;
        }
        Ok(())
    }
}
