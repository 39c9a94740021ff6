//! Classification of lines received from a modem.

/// What a single modem line means to a command waiting for its result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModemLine {
    SimPin,
    Ok,
    /// `>` prompt of `AT+CMGS`, only recognised while a prompt is expected.
    Prompt,
    Ring,
    PinReady,
    CmsError(Option<u16>),
    CmeError(Option<u16>),
    /// `+CMTI`/`+CDSI`: a message was stored, read it later.
    Indication,
    /// `+CMT`/`+CDS` (`stored == false`) or `+CMGR` header, the PDU follows on
    /// the next line.
    Message { stored: bool },
    Submitted(Option<u32>),
    Error(Option<u16>),
    Other,
}

/// Final outcome of a modem command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    Prompt,
    PinRequired,
    PinReady,
    /// `+CMS ERROR`/`+CME ERROR`
    Rejected(Option<u16>),
    Error(Option<u16>),
    Timeout,
}

impl CommandStatus {
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Anything but a plain `ERROR` or a timeout proves the modem answered.
    #[must_use]
    pub fn answered(self) -> bool {
        !matches!(self, Self::Error(_) | Self::Timeout)
    }
}

impl ModemLine {
    #[must_use]
    pub fn classify(line: &str, prompt: bool) -> Self {
        if line.contains("SIM PIN") {
            Self::SimPin
        } else if line.contains("OK") {
            Self::Ok
        } else if prompt && line.contains('>') {
            Self::Prompt
        } else if line.contains("RING") {
            Self::Ring
        } else if line.contains("+CPIN: READY") {
            Self::PinReady
        } else if line.contains("+CMS ERROR") {
            Self::CmsError(error_code(line, "+CMS ERROR:"))
        } else if line.contains("+CME ERROR") {
            Self::CmeError(error_code(line, "+CME ERROR:"))
        } else if line.contains("+CMTI:") || line.contains("+CDSI:") {
            Self::Indication
        } else if line.contains("+CMT:") || line.contains("+CDS:") {
            Self::Message { stored: false }
        } else if line.contains("+CMGR:") {
            Self::Message { stored: true }
        } else if let Some(pos) = line.find("+CMGS:") {
            Self::Submitted(leading_number(&line[pos + 6..]))
        } else if line.contains("ERROR") {
            Self::Error(error_code(line, "ERROR:"))
        } else {
            Self::Other
        }
    }

    /// The command outcome this line settles, if any.
    #[must_use]
    pub fn status(&self) -> Option<CommandStatus> {
        match self {
            Self::SimPin => Some(CommandStatus::PinRequired),
            Self::Ok => Some(CommandStatus::Ok),
            Self::Prompt => Some(CommandStatus::Prompt),
            Self::PinReady => Some(CommandStatus::PinReady),
            Self::CmsError(code) | Self::CmeError(code) => Some(CommandStatus::Rejected(*code)),
            Self::Error(code) => Some(CommandStatus::Error(*code)),
            Self::Ring
            | Self::Indication
            | Self::Message { .. }
            | Self::Submitted(_)
            | Self::Other => None,
        }
    }
}

fn leading_number<T: std::str::FromStr>(s: &str) -> Option<T> {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(s.len(), |(i, _)| i);
    s[..end].parse().ok()
}

fn error_code(line: &str, prefix: &str) -> Option<u16> {
    line.strip_prefix(prefix).and_then(leading_number)
}

/// Parses `+CPMS: "SM",used,total,...` into `(used, total)` of the first
/// storage.
#[must_use]
pub fn parse_cpms(lines: &str) -> Option<(u32, u32)> {
    let pos = lines.find("+CPMS:")?;
    let line = lines[pos + 6..].lines().next()?;
    let values: Vec<u32> = line
        .split(',')
        .filter_map(|v| v.trim().parse().ok())
        .take(4)
        .collect();
    (values.len() == 4).then(|| (values[0], values[1]))
}

/// Whether `+CSMS: (0,1,...)` lists service 1 (phase 2+).
#[must_use]
pub fn parse_csms_phase2plus(lines: &str) -> bool {
    let start = lines.find('(').map_or(0, |i| i + 1);
    let rest = &lines[start..];
    let list = rest.find(')').map_or(rest, |i| &rest[..i]);
    list.split(',').any(|v| v.trim() == "1")
}

/// Parses `+CMTI: "SM",3` into the storage name and the location.
#[must_use]
pub fn parse_cmti(line: &str) -> Option<(Option<String>, u32)> {
    let (storage, rest) = match line.find('"') {
        Some(open) => {
            let after = &line[open + 1..];
            let close = after.find('"')?;
            (Some(after[..close].to_owned()), &after[close + 1..])
        }
        None => (None, line),
    };
    let comma = rest.find(',')?;
    let location = leading_number(&rest[comma + 1..])?;
    Some((storage, location))
}

/// Human readable text for `+CMS ERROR`, `+CME ERROR` and `ERROR` codes.
#[must_use]
pub fn error_string(code: u16) -> &'static str {
    match code {
        0 => "Modem returned ERROR but no error code - possibly unsupported or invalid command?",
        1 => "Unassigned (unallocated) number (+CMS) or No connection to phone (+CME)",
        2 => "Phone-adaptor link reserved",
        3 => "Operation not allowed at this time (connection may be required)",
        4 => "Operation / Parameter(s) not supported",
        5 => "PH-SIM PIN required",
        8 => "Operator determined barring",
        10 => "Call barred (+CMS) or SIM not inserted or Card inserted is not a SIM (+CME)",
        11 => "SIM PIN required",
        12 => "SIM PUK required",
        13 => "SIM failure",
        14 => "SIM busy",
        15 => "SIM wrong",
        16 => "Incorrect password",
        17 => "Network failure (+CMS) or SIM PIN2 required (+CME)",
        18 => "SIM PUK2 required",
        20 => "Memory full",
        21 => "Short message transfer rejected (+CMS) or Invalid Index (+CME)",
        22 => "Congestion (+CMS) or Memory capacity exceeded (+CME)",
        23 => "Memory failure",
        24 => "Text string too long",
        25 => "Invalid characters in text string",
        26 => "Dial string too long",
        27 => "Destination out of service",
        28 => "Unidentified subscriber",
        29 => "Facility rejected",
        30 => "Unknown subscriber (+CMS) or No network service (+CME)",
        31 => "Network timeout",
        32 => "Network not allowed - emergency calls only",
        38 => "Network out of order",
        40 => "Network personal PIN required (Network lock)",
        41 => "Temporary failure (+CMS) or Network personalization PUK required (+CME)",
        42 => "Congestion (+CMS) or Network subset personalization PIN required (+CME)",
        43 => "Network subset personalization PUK required",
        44 => "Service provider personalization PIN required",
        45 => "Service provider personalization PUK required",
        46 => "Corporate personalization PIN required",
        47 => "Resources unavailable, unspecified (+CMS) or Corporate personalization PUK required (+CME)",
        50 => "Requested facility not subscribed",
        69 => "Requested facility not implemented",
        81 => "Invalid short message transfer reference value",
        95 => "Invalid message, unspecified",
        96 => "Invalid mandatory information",
        97 => "Message type non-existent or not implemented",
        98 => "Message not compatible with short message protocol state",
        99 => "Information element non-existent or not implemented",
        100 => "Unknown",
        103 => "Illegal MS (#3)",
        106 => "Illegal ME (#6)",
        107 => "GPRS services not allowed (#7)",
        111 => "Protocol error, unspecified (+CMS) or PLMN not allowed (#11) (+CME)",
        112 => "Location area not allowed (#12)",
        113 => "Roaming not allowed in this area (#13)",
        127 => "Interworking, unspecified",
        128 => "Telematic interworking not supported",
        129 => "Short message Type 0 not supported",
        130 => "Cannot replace short message",
        132 => "Service option not supported (#32)",
        133 => "Requested service option not subscribed (#33)",
        134 => "Service option temporarily out of order (#34)",
        143 => "Unspecified TP-PID error",
        144 => "Data coding scheme (alphabet) not supported",
        145 => "Message class not supported",
        148 => "Unspecified GPRS error",
        149 => "PDP authentication failure",
        150 => "Invalid mobile class",
        159 => "Unspecified TP-DCS error",
        160 => "Command cannot be actioned",
        161 => "Unsupported command",
        175 => "Unspecified TP-Command error",
        176 => "TPDU not supported",
        192 => "SC busy",
        193 => "No SC subscription",
        194 => "SC system failure",
        195 => "Invalid SME address",
        196 => "Destination SME barred",
        197 => "SM Rejected-Duplicate SM",
        198 => "TP-VPF not supported",
        199 => "TP-VP not supported",
        208 => "DO SIM SMS storage full",
        209 => "No SMS storage capability in SIM",
        210 => "Error in MS",
        211 => "SIM Memory Capacity Exceeded",
        212 => "SIM Application Toolkit Busy",
        213 => "SIM data download error",
        255 => "Unspecified error cause",
        300 => "Mobile equipment (ME) failure",
        301 => "SMS service of mobile equipment (ME) is reserved",
        302 => "The operation to be done by the AT command is not allowed",
        303 => "The operation to be done by the AT command is not supported",
        304 | 305 => "One or more parameter values assigned to the AT command are invalid",
        310 => "There is no SIM card",
        311 => "The SIM card requires a PIN to operate",
        312 => "The SIM card requires a PH-SIM PIN to operate",
        313 => "SIM card failure",
        314 => "The SIM card is busy",
        315 => "The SIM card is wrong",
        316 => "The SIM card requires a PUK to operate",
        317 => "The SIM card requires a PIN2 to operate",
        318 => "The SIM card requires a PUK2 to operate",
        320 => "Memory/message storage failure",
        321 => "The memory/message storage index assigned to the AT command is invalid",
        322 => "The memory/message storage is out of space",
        330 => "The SMS center (SMSC) address is unknown",
        331 => "No network service is available",
        332 => "Network timeout occurred",
        340 => "There is no need to send message ack by the AT command +CNMA",
        500 => "An unknown error occurred",
        512 => "User abort or MM establishment failure (SMS)",
        513 => "Lower layer failure (SMS)",
        514 => "CP error (SMS)",
        515 => "Please wait, service not available, init or command in progress",
        517 => "SIM ToolKit facility not supported",
        518 => "SIM ToolKit indication not received",
        519 => "Reset the product to activate or change a new echo cancellation algorithm",
        520 => "Automatic abort about get plmn list for an incoming call",
        526 => "PIN deactivation forbidden with this SIM card",
        527 => "Please wait, RR or MM is busy. Retry your selection later",
        528 => "Location update failure. Emergency calls only",
        529 => "PLMN selection failure. Emergency calls only",
        531 => "SMS not sent: the <da> is not in FDN phonebook, and FDN lock is enabled",
        532 => "The embedded application is activated so the objects flash are not erased",
        533 => "Missing or unknown APN",
        _ => "Error number unknown",
    }
}
