use std::time::Duration;

use tracing::debug;

/// Capabilities and quirks of a modem type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModemDefinition {
    pub id: String,
    pub name: String,
    /// Text in the `ATI` answer identifying this modem.
    pub detect_string: Option<String>,
    /// Second text that must also be present, if set.
    pub detect_string2: Option<String>,
    pub init_string: String,
    /// Sent after too many failed initialisations.
    pub reset_string: Option<String>,
    pub speed: u32,
    pub enable_hwhs: String,
    pub need_sleep: bool,
    pub no_pin: bool,
    /// PDUs are exchanged without the SMSC address prefix.
    pub no_smsc: bool,
    pub sendline_sleep: Duration,
    pub keepalive_cmd: String,
    pub message_storage: Option<String>,
    pub message_start: u32,
    /// Supports `AT+CMMS=2` to keep the link open between messages.
    pub enable_mms: bool,
    pub hardware_flow_control: bool,
    /// Emits `+CMT` without the comma and sometimes short PDUs.
    pub broken: bool,
}

impl Default for ModemDefinition {
    fn default() -> Self {
        Self {
            id: "generic".to_owned(),
            name: "Generic Modem".to_owned(),
            detect_string: None,
            detect_string2: None,
            init_string: "AT+CNMI=1,2,0,1,0".to_owned(),
            reset_string: None,
            speed: 9600,
            enable_hwhs: "AT+IFC=2,2".to_owned(),
            need_sleep: false,
            no_pin: false,
            no_smsc: false,
            sendline_sleep: Duration::from_millis(100),
            keepalive_cmd: "AT".to_owned(),
            message_storage: None,
            message_start: 1,
            enable_mms: false,
            hardware_flow_control: true,
            broken: false,
        }
    }
}

impl ModemDefinition {
    fn builtin(id: &str, name: &str, detect: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            detect_string: Some(detect.to_owned()),
            ..Self::default()
        }
    }

    /// Known modem types, `generic` first.
    #[must_use]
    pub fn table() -> Vec<Self> {
        vec![
            Self::default(),
            Self {
                keepalive_cmd: "AT+CSQ".to_owned(),
                message_storage: Some("SM".to_owned()),
                ..Self::builtin("wavecom", "Wavecom", "WAVECOM")
            },
            Self {
                detect_string2: Some("TC35".to_owned()),
                init_string: "AT+CNMI=1,2,0,1,1".to_owned(),
                speed: 19200,
                enable_hwhs: "AT\\Q3".to_owned(),
                keepalive_cmd: "AT+CBC;+CSQ".to_owned(),
                message_storage: Some("SM".to_owned()),
                ..Self::builtin("siemens_tc35", "Siemens TC35", "SIEMENS")
            },
            Self {
                need_sleep: true,
                keepalive_cmd: "AT+CBC;+CSQ".to_owned(),
                enable_mms: true,
                ..Self::builtin("nokiaphone", "Nokia Phone", "Nokia Mobile Phone")
            },
            Self {
                init_string: "AT+CNMI=1,2,0,1,1".to_owned(),
                reset_string: Some("AT+CFUN=1".to_owned()),
                ..Self::builtin("falcom", "Falcom", "Falcom")
            },
            Self {
                detect_string2: Some("T68".to_owned()),
                init_string: "AT+CNMI=3,2,0,0".to_owned(),
                keepalive_cmd: "AT+CBC;+CSQ".to_owned(),
                enable_mms: true,
                broken: true,
                ..Self::builtin("ericsson_t68", "Ericsson T68", "ERICSSON")
            },
            Self {
                init_string: "AT+CNMI=2,2,0,1,0".to_owned(),
                speed: 115_200,
                message_storage: Some("SM".to_owned()),
                reset_string: Some("AT+CFUN=1,1".to_owned()),
                ..Self::builtin("huawei", "Huawei", "huawei")
            },
        ]
    }

    /// Looks a modem type up by id.
    #[must_use]
    pub fn find(id: &str) -> Option<Self> {
        Self::table().into_iter().find(|m| m.id == id)
    }

    /// Picks the modem type from an `ATI` answer, `generic` if none matches.
    #[must_use]
    pub fn detect(answer: &str) -> Self {
        Self::table()
            .into_iter()
            .find(|modem| {
                let Some(detect) = &modem.detect_string else {
                    return false;
                };
                answer.contains(detect.as_str())
                    && modem
                        .detect_string2
                        .as_ref()
                        .is_none_or(|d| answer.contains(d.as_str()))
            })
            .inspect(|modem| debug!("found <{}>, using modem definition", modem.name))
            .unwrap_or_else(|| {
                debug!("Cannot detect modem, using generic");
                Self::default()
            })
    }

    /// Whether PDUs are written in small chunks.
    #[must_use]
    pub fn chunked_writes(&self) -> bool {
        self.id == "nokiaphone"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_needs_both_strings() {
        assert_eq!(
            ModemDefinition::detect("SIEMENS\nTC35\nREVISION 02.06").id,
            "siemens_tc35"
        );
        assert_eq!(ModemDefinition::detect("SIEMENS MC35i").id, "generic");
        assert_eq!(ModemDefinition::detect("WAVECOM MODEM").id, "wavecom");
        assert_eq!(ModemDefinition::detect("").id, "generic");
    }

    #[test]
    fn defaults() {
        let generic = ModemDefinition::find("generic").unwrap();
        assert_eq!(generic.init_string, "AT+CNMI=1,2,0,1,0");
        assert_eq!(generic.enable_hwhs, "AT+IFC=2,2");
        assert_eq!(generic.keepalive_cmd, "AT");
        assert_eq!(generic.message_start, 1);
        assert_eq!(generic.sendline_sleep, Duration::from_millis(100));
        assert!(ModemDefinition::find("nokiaphone").unwrap().chunked_writes());
        assert!(ModemDefinition::find("nope").is_none());
    }
}
