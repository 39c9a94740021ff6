use tracing::{debug, trace};
use zerocopy::{Immutable, IntoBytes, KnownLayout, TryFromBytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, KnownLayout, Immutable, TryFromBytes)]
#[repr(u8)]
enum TelnetIac {
    Iac = 0xFF,
}

/// Option negotiation verbs, RFC 854.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, KnownLayout, Immutable, TryFromBytes)]
pub enum TelnetVerb {
    Sb = 0xFA,
    Will = 0xFB,
    Wont = 0xFC,
    Do = 0xFD,
    Dont = 0xFE,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, KnownLayout, Immutable, TryFromBytes)]
#[repr(C, packed)]
struct TelnetCommand {
    iac: TelnetIac,
    verb: TelnetVerb,
    option: u8,
}

/// What besides a carriage return ends a line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Prompt<'a> {
    None,
    /// The `>` of `AT+CMGS`.
    Gt,
    /// Login prompt, the configured text or `Login:`/`Username:`.
    Login(Option<&'a str>),
    /// Password prompt, the configured text or `Password:`.
    Password(Option<&'a str>),
}

impl Prompt<'_> {
    fn find(self, buf: &[u8]) -> Option<(usize, usize)> {
        let candidates: Vec<&str> = match self {
            Self::None => return None,
            Self::Gt => vec![">"],
            Self::Login(custom) => custom.into_iter().chain(["Login:", "Username:"]).collect(),
            Self::Password(custom) => custom.into_iter().chain(["Password:"]).collect(),
        };
        candidates.into_iter().filter(|p| !p.is_empty()).find_map(|p| {
            buf.windows(p.len())
                .position(|w| w == p.as_bytes())
                .map(|pos| (pos, p.len()))
        })
    }
}

/// Input buffer of a modem connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineBuffer {
    buf: Vec<u8>,
    telnet: bool,
}

impl LineBuffer {
    #[must_use]
    pub fn new(telnet: bool) -> Self {
        Self {
            buf: Vec::new(),
            telnet,
        }
    }

    /// Appends received bytes. On a telnet transport negotiation commands are
    /// removed and the returned bytes must be written back to the peer.
    pub fn push(&mut self, data: &[u8]) -> Vec<u8> {
        self.buf.extend_from_slice(data);
        if self.telnet {
            self.strip_telnet()
        } else {
            Vec::new()
        }
    }

    fn strip_telnet(&mut self) -> Vec<u8> {
        let mut replies = Vec::new();
        let mut pos = 0;
        while let Some(offset) = self.buf[pos..].iter().position(|&b| b == TelnetIac::Iac as u8) {
            pos += offset;
            if self.buf.len() - pos < 3 {
                // wait for the rest of the command
                break;
            }
            let Ok((command, _)) = TelnetCommand::try_read_from_prefix(&self.buf[pos..]) else {
                trace!("unknown telnet verb {:#04x}, skipping", self.buf[pos + 1]);
                pos += 1;
                continue;
            };
            let option = command.option;
            if command.verb == TelnetVerb::Do {
                debug!("telnet DO {option}, refusing");
                let reply = TelnetCommand {
                    iac: TelnetIac::Iac,
                    verb: TelnetVerb::Wont,
                    option,
                };
                replies.extend_from_slice(reply.as_bytes());
            } else {
                trace!("telnet {:?} {option} ignored", command.verb);
            }
            self.buf.drain(pos..pos + 3);
        }
        replies
    }

    /// Removes the next complete line from the buffer.
    ///
    /// A line ends at a carriage return or at `prompt`, whichever comes first.
    /// Control characters become blanks and the line is trimmed. A line ended
    /// by a prompt gets `>` appended so it can be recognised as such.
    pub fn extract_line(&mut self, prompt: Prompt<'_>) -> Option<String> {
        let cr = self.buf.iter().position(|&b| b == b'\r');
        let (end, consumed, at_prompt) = match (cr, prompt.find(&self.buf)) {
            (Some(cr), Some((pos, len))) if pos < cr => (pos, pos + len, true),
            (None, Some((pos, len))) => (pos, pos + len, true),
            (Some(cr), _) => (cr, cr + 1, false),
            (None, None) => return None,
        };
        let raw: Vec<u8> = self
            .buf
            .drain(..consumed)
            .take(end)
            .map(|b| if b < 32 { b' ' } else { b })
            .collect();
        let mut line = String::from_utf8_lossy(&raw).trim().to_owned();
        if at_prompt {
            line.push('>');
        }
        if !line.is_empty() {
            debug!("<-- {line}");
        }
        Some(line)
    }

    /// Drops everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
