use tracing::{debug, error, info};

use crate::{
    Dlr, EmiConfig, Sms,
    emi::{EmiMessage, convert},
};

/// What answering an inbound operation produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Answer {
    /// Positive reply to send back on the same connection
    pub reply: EmiMessage,
    /// Message or delivery report for the gateway core
    pub received: Option<Sms>,
}

/// Answers an operation the SMSC sent us.
///
/// Returns `None` for operation types we do not handle.
#[must_use]
pub fn answer(
    name: &str,
    config: &EmiConfig,
    smsc_id: &str,
    dlr: &Dlr,
    op: &EmiMessage,
) -> Option<Answer> {
    let received = match op.ot {
        1 => Some(convert::call_input(name, config, smsc_id, op)),
        52 => Some(convert::deliver(name, config, smsc_id, op)),
        53 => convert::notification(name, config, smsc_id, dlr, op),
        31 => None,
        ot => {
            error!("EMI2[{name}]: I don't know how to handle operation type {ot}");
            return None;
        }
    };
    let reply = EmiMessage::reply(op.ot, op.trn, true).ok()?;
    Some(Answer { reply, received })
}

fn pattern_matches_ip(pattern: &str, ip: &str) -> bool {
    let (pattern, ip) = (pattern.as_bytes(), ip.as_bytes());
    let (mut i, mut j) = (0, 0);
    while i < pattern.len() && j < ip.len() {
        if pattern[i] == ip[j] {
            i += 1;
            j += 1;
        } else if pattern[i] == b'*' {
            // a wildcard swallows the rest of the octet
            i += 1;
            while j < ip.len() && ip[j] != b'.' {
                j += 1;
            }
        } else {
            return false;
        }
    }
    i >= pattern.len() && j >= ip.len()
}

fn pattern_list_matches_ip(list: &str, ip: &str) -> bool {
    list.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .any(|p| pattern_matches_ip(p, ip))
}

/// Whether a peer at `ip` may connect.
///
/// Anything is allowed without a deny list. The allow list wins over the
/// deny list.
#[must_use]
pub fn is_allowed_ip(allow: Option<&str>, deny: Option<&str>, ip: &str) -> bool {
    let Some(deny) = deny.filter(|d| !d.is_empty()) else {
        return true;
    };
    if allow.is_some_and(|allow| pattern_list_matches_ip(allow, ip)) {
        return true;
    }
    !pattern_list_matches_ip(deny, ip)
}

/// Handles operations arriving on connections the SMSC opened to our
/// receive port. These connections never carry replies to our operations.
#[derive(Clone, Debug)]
pub struct EmiReceiver {
    pub name: String,
    pub smsc_id: String,
    pub config: EmiConfig,
    dlr: Dlr,
}

impl EmiReceiver {
    #[must_use]
    pub fn new(name: &str, smsc_id: &str, config: EmiConfig, dlr: Dlr) -> Self {
        Self {
            name: name.to_owned(),
            smsc_id: smsc_id.to_owned(),
            config,
            dlr,
        }
    }

    /// Whether a connection from `ip` is accepted.
    #[must_use]
    pub fn accepts(&self, ip: &str) -> bool {
        let allowed = is_allowed_ip(
            self.config.allowed_ips.as_deref(),
            self.config.effective_denied_ips(),
            ip,
        );
        if !allowed {
            info!(
                "EMI2[{}]: smsc connection tried from denied host <{ip}>, disconnected",
                self.name
            );
        }
        allowed
    }

    /// Parses and answers one packet.
    #[must_use]
    pub fn handle(&self, packet: &[u8]) -> Option<Answer> {
        debug!(
            "EMI2[{}]: Got packet from the receive connection.",
            self.name
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
        if !msg.is_operation() {
            error!(
                "EMI2[{}]: No ACKs expected on receive connection!",
                self.name
            );
            return None;
        }
        answer(&self.name, &self.config, &self.smsc_id, &self.dlr, &msg)
    }
}
