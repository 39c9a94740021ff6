use std::time::Duration;

use anyhow::{anyhow, bail};
use smsc_core::{
    AtConfig,
    at::{
        CommandStatus, LineBuffer, ModemDefinition, ModemEvent, ModemLine, Prompt, StorageStep,
        pdu::pdu_extract, reply,
    },
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    time::{Instant, sleep, timeout_at},
};
use tracing::{debug, error, info};

use crate::transport::Transport;

/// Wait for a plain command's final result.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
const CTRL_Z: u8 = 0x1A;
/// PDU chunk size for modems that choke on long writes.
const CHUNK: usize = 18;

/// Command level access to an open modem.
///
/// Unsolicited `+CMTI`/`+CDSI` indications and `+CMT`/`+CDS`/`+CMGR`
/// messages seen while waiting for a command are collected in
/// [`Modem::take_events`].
pub struct Modem {
    name: String,
    io: Transport,
    lines: LineBuffer,
    pub definition: ModemDefinition,
    /// Acknowledge `+CMT`/`+CDS` deliveries with `AT+CNMA`.
    pub ack_deliveries: bool,
    /// Lines received for the last command.
    output: String,
    events: Vec<ModemEvent>,
    pin_ready: bool,
    message_ref: Option<u32>,
    messages_read: usize,
    /// Telnet negotiation answers not written yet.
    replies: Vec<u8>,
    /// Input arrived while reading replies.
    buffered: bool,
}

impl Modem {
    #[must_use]
    pub fn new(name: &str, io: Transport, definition: ModemDefinition, telnet: bool) -> Self {
        Self {
            name: name.to_owned(),
            io,
            lines: LineBuffer::new(telnet),
            definition,
            ack_deliveries: false,
            output: String::new(),
            events: Vec::new(),
            pin_ready: false,
            message_ref: None,
            messages_read: 0,
            replies: Vec::new(),
            buffered: false,
        }
    }

    /// Events produced by the modem on its own since the last call.
    pub fn take_events(&mut self) -> Vec<ModemEvent> {
        std::mem::take(&mut self.events)
    }

    /// Lines received for the last command, newline separated.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    async fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.io.write_all(data).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        debug!("AT2[{}]: --> {line}", self.name);
        self.write(format!("{line}\r").as_bytes()).await?;
        sleep(self.definition.sendline_sleep).await;
        Ok(())
    }

    /// Next non-empty line, `None` once `deadline` passed.
    ///
    /// # Errors
    ///
    /// Fails if the device closed or reading failed.
    async fn read_line(
        &mut self,
        deadline: Instant,
        prompt: Prompt<'_>,
    ) -> anyhow::Result<Option<String>> {
        let mut buf = [0; 1024];
        if !self.replies.is_empty() {
            let replies = std::mem::take(&mut self.replies);
            self.write(&replies).await?;
        }
        loop {
            while let Some(line) = self.lines.extract_line(prompt) {
                if !line.is_empty() {
                    return Ok(Some(line));
                }
            }
            let Ok(read) = timeout_at(deadline, self.io.read(&mut buf)).await else {
                return Ok(None);
            };
            let n = read?;
            if n == 0 {
                bail!("AT2[{}]: device closed", self.name);
            }
            self.buffered = true;
            let replies = self.lines.push(&buf[..n]);
            if !replies.is_empty() {
                self.write(&replies).await?;
            }
        }
    }

    /// Waits until the modem sends something on its own and buffers it.
    ///
    /// Cancel safe: nothing is lost if the future is dropped.
    ///
    /// # Errors
    ///
    /// Fails if the device closed or reading failed.
    pub async fn readable(&mut self) -> anyhow::Result<()> {
        // lines that trailed the last reply are already here
        if std::mem::take(&mut self.buffered) && !self.lines.is_empty() {
            return Ok(());
        }
        let mut buf = [0; 1024];
        let n = self.io.read(&mut buf).await?;
        if n == 0 {
            bail!("AT2[{}]: device closed", self.name);
        }
        let replies = self.lines.push(&buf[..n]);
        self.replies.extend_from_slice(&replies);
        Ok(())
    }

    /// Drops buffered input.
    pub fn flush(&mut self) {
        self.lines.clear();
    }

    pub async fn command(
        &mut self,
        cmd: &str,
        timeout: Duration,
        prompt: Prompt<'_>,
    ) -> anyhow::Result<CommandStatus> {
        self.write_line(cmd).await?;
        self.wait(timeout, prompt).await
    }

    /// Reads lines until one settles the pending command.
    ///
    /// # Errors
    ///
    /// Fails if reading from or writing to the device failed.
    pub async fn wait(
        &mut self,
        timeout: Duration,
        prompt: Prompt<'_>,
    ) -> anyhow::Result<CommandStatus> {
        let deadline = Instant::now() + timeout;
        self.output.clear();
        self.message_ref = None;
        self.messages_read = 0;
        loop {
            let Some(line) = self.read_line(deadline, prompt).await? else {
                return Ok(CommandStatus::Timeout);
            };
            self.output.push_str(&line);
            self.output.push('\n');

            let classified = ModemLine::classify(&line, prompt != Prompt::None);
            match classified {
                ModemLine::Ring => {
                    self.write_line("ATH0").await?;
                    continue;
                }
                ModemLine::Indication => {
                    debug!("AT2[{}]: incoming SMS indication: {line}", self.name);
                    self.events.push(ModemEvent::indication(line));
                    continue;
                }
                ModemLine::Message { stored } => {
                    self.message(&line, stored).await?;
                    continue;
                }
                ModemLine::Submitted(id) => {
                    if id.is_none() {
                        error!(
                            "AT2[{}]: Got +CMGS but failed to read message id",
                            self.name
                        );
                    }
                    self.message_ref = id;
                }
                ModemLine::CmsError(code) | ModemLine::CmeError(code) => {
                    error!("AT2[{}]: {line}", self.name);
                    if let Some(code) = code {
                        error!(
                            "AT2[{}]: {} ({code})",
                            self.name,
                            reply::error_string(code)
                        );
                    }
                }
                ModemLine::Error(code) => {
                    error!("AT2[{}]: Generic error: {line}", self.name);
                    if let Some(code) = code {
                        error!(
                            "AT2[{}]: Generic error: {} ({code})",
                            self.name,
                            reply::error_string(code)
                        );
                    }
                }
                ModemLine::PinReady => self.pin_ready = true,
                ModemLine::SimPin | ModemLine::Ok | ModemLine::Prompt | ModemLine::Other => (),
            }
            if let Some(status) = classified.status() {
                return Ok(status);
            }
        }
    }

    /// Reads the PDU line following a message header.
    async fn message(&mut self, header: &str, stored: bool) -> anyhow::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(1);
        let Some(pdu_line) = self.read_line(deadline, Prompt::None).await? else {
            error!(
                "AT2[{}]: got +CMT but waiting for next line timed out",
                self.name
            );
            return Ok(());
        };
        let buffer = format!("{header}\n{pdu_line}");
        let Some(pdu) = pdu_extract(&buffer, self.definition.no_smsc, self.definition.broken)
        else {
            error!("AT2[{}]: got +CMT but pdu_extract failed", self.name);
            return Ok(());
        };
        self.messages_read += 1;
        self.events.push(ModemEvent::RMessage { pdu, stored });
        if !stored && self.ack_deliveries {
            // the acknowledgement must not clobber the pending command's result
            let saved = (
                std::mem::take(&mut self.output),
                self.message_ref,
                self.messages_read,
            );
            Box::pin(self.command("AT+CNMA", COMMAND_TIMEOUT, Prompt::None)).await?;
            (self.output, self.message_ref, self.messages_read) = saved;
        }
        Ok(())
    }

    /// Checks whether the modem answers at the current line speed.
    pub async fn answers(&mut self) -> anyhow::Result<bool> {
        // a bare return lets the modem detect the speed
        self.command("", Duration::from_secs(1), Prompt::None)
            .await?;
        for _ in 0..3 {
            if self.command("AT", COMMAND_TIMEOUT, Prompt::None).await?.is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resets the modem and asks it to identify itself.
    pub async fn identify(&mut self) -> anyhow::Result<ModemDefinition> {
        debug!("AT2[{}]: detecting modem type", self.name);
        self.reset().await?;
        if self.command("ATI", COMMAND_TIMEOUT, Prompt::None).await? != CommandStatus::Ok {
            bail!("AT2[{}]: no answer to ATI", self.name);
        }
        Ok(ModemDefinition::detect(&self.output))
    }

    /// `ATZ`, `AT`, `AT&F` and `ATE0`, the last three tried twice.
    async fn reset(&mut self) -> anyhow::Result<()> {
        if matches!(
            self.command("ATZ", COMMAND_TIMEOUT, Prompt::None).await?,
            CommandStatus::Error(_)
        ) {
            bail!("AT2[{}]: Wrong or no answer to ATZ", self.name);
        }
        for (cmd, timeout) in [
            ("AT", COMMAND_TIMEOUT),
            ("AT&F", Duration::from_secs(7)),
            ("ATE0", COMMAND_TIMEOUT),
        ] {
            if !self.retry(cmd, timeout).await? {
                bail!("AT2[{}]: Wrong or no answer to {cmd}", self.name);
            }
            self.flush();
        }
        Ok(())
    }

    /// Sends `cmd` a second time if it failed. Returns whether the modem
    /// answered.
    async fn retry(&mut self, cmd: &str, timeout: Duration) -> anyhow::Result<bool> {
        for attempt in 0..2 {
            if self.command(cmd, timeout, Prompt::None).await?.answered() {
                return Ok(true);
            }
            if attempt == 0 {
                error!("AT2[{}]: Wrong or no answer to {cmd}. Trying again", self.name);
            }
        }
        Ok(false)
    }

    /// Answers the login and password prompts of a terminal server.
    pub async fn login(&mut self, config: &AtConfig) -> anyhow::Result<()> {
        info!("AT2[{}]: Logging in", self.name);
        let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        let password_prompt = Prompt::Password(config.password_prompt.as_deref());
        match config.username.as_deref().filter(|u| !u.is_empty()) {
            Some(username) => {
                self.wait(
                    Duration::from_secs(10),
                    Prompt::Login(config.login_prompt.as_deref()),
                )
                .await?;
                self.command(username, Duration::from_secs(10), password_prompt)
                    .await?;
            }
            None => {
                self.wait(Duration::from_secs(10), password_prompt).await?;
            }
        }
        self.command(password, Duration::from_secs(2), Prompt::None)
            .await?;
        if !self
            .command("AT", Duration::from_secs(2), Prompt::None)
            .await?
            .is_ok()
        {
            bail!("AT2[{}]: no answer after login", self.name);
        }
        Ok(())
    }

    /// Runs the initialisation sequence. Returns whether the modem supports
    /// phase 2+ message acknowledgement.
    ///
    /// # Errors
    ///
    /// Fails if any mandatory step is not acknowledged.
    pub async fn initialize(&mut self, config: &AtConfig, reset: bool) -> anyhow::Result<bool> {
        info!("AT2[{}]: init device", self.name);
        if reset {
            if let Some(reset_string) = self.definition.reset_string.clone() {
                self.command(&reset_string, COMMAND_TIMEOUT, Prompt::None)
                    .await?;
            }
        }
        sleep(Duration::from_millis(100)).await;
        self.reset().await?;

        if !self.definition.enable_hwhs.is_empty() {
            let hwhs = self.definition.enable_hwhs.clone();
            if !self
                .command(&hwhs, COMMAND_TIMEOUT, Prompt::None)
                .await?
                .answered()
            {
                info!("AT2[{}]: cannot enable hardware handshake", self.name);
            }
        }

        if !self.definition.no_pin {
            self.enter_pin(config).await?;
        }

        if let Some(center) = config.sms_center.as_deref().filter(|c| !c.is_empty()) {
            match self
                .command(&format!("AT+CSCA=\"{center}\""), COMMAND_TIMEOUT, Prompt::None)
                .await?
            {
                CommandStatus::Ok => (),
                CommandStatus::Error(_) | CommandStatus::Timeout => {
                    bail!("AT2[{}]: cannot set SMS message center", self.name)
                }
                _ => info!(
                    "AT2[{}]: Cannot set SMS message center, continuing",
                    self.name
                ),
            }
        }

        self.expect_ok("AT+CMGF=0").await?;

        let phase2plus = self
            .command("AT+CSMS=?", COMMAND_TIMEOUT, Prompt::None)
            .await?
            .is_ok()
            && reply::parse_csms_phase2plus(&self.output);
        if phase2plus {
            info!("AT2[{}]: Phase 2+ is supported", self.name);
            self.expect_ok("AT+CSMS=1").await?;
        }

        let init = self.definition.init_string.clone();
        self.expect_ok(&init).await?;

        if config.memory_poll_interval().is_some() {
            if let Some(storage) = self.definition.message_storage.clone() {
                self.select_storage(&storage).await?;
            }
        }
        Ok(phase2plus)
    }

    async fn expect_ok(&mut self, cmd: &str) -> anyhow::Result<()> {
        let status = self.command(cmd, COMMAND_TIMEOUT, Prompt::None).await?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(anyhow!("AT2[{}]: {cmd} failed: {status:?}", self.name))
        }
    }

    /// Enters the PIN if the SIM asks for one, then waits for `+CPIN: READY`.
    async fn enter_pin(&mut self, config: &AtConfig) -> anyhow::Result<()> {
        self.pin_ready = false;
        let status = self
            .command("AT+CPIN?", Duration::from_secs(10), Prompt::None)
            .await?;
        if status == CommandStatus::PinReady {
            // swallow the OK trailing the status line
            self.wait(Duration::from_millis(500), Prompt::None).await?;
        }
        if !self.pin_ready {
            match status {
                CommandStatus::PinRequired => {
                    let Some(pin) = config.pin.as_deref() else {
                        bail!("AT2[{}]: SIM asks for a PIN, none configured", self.name);
                    };
                    self.expect_ok(&format!("AT+CPIN=\"{pin}\"")).await?;
                }
                CommandStatus::Error(_) | CommandStatus::Timeout => {
                    bail!("AT2[{}]: no answer to AT+CPIN?", self.name)
                }
                _ => (),
            }
        }
        if !self.pin_ready {
            self.wait(Duration::from_secs(10), Prompt::None).await?;
        }
        if !self.pin_ready {
            self.command("AT+CPIN?", Duration::from_secs(10), Prompt::None)
                .await?;
        }
        if self.pin_ready {
            Ok(())
        } else {
            Err(anyhow!("AT2[{}]: SIM not ready", self.name))
        }
    }

    pub async fn keepalive(&mut self) -> anyhow::Result<CommandStatus> {
        let cmd = self.definition.keepalive_cmd.clone();
        self.command(&cmd, COMMAND_TIMEOUT, Prompt::None).await
    }

    pub async fn select_storage(&mut self, storage: &str) -> anyhow::Result<()> {
        self.expect_ok(&format!("AT+CPMS=\"{storage}\"")).await
    }

    /// Reads the message at `location`, deleting it if one was there.
    /// Returns the number of messages read.
    pub async fn read_delete(&mut self, location: u32) -> anyhow::Result<usize> {
        if !self
            .command(&format!("AT+CMGR={location}"), COMMAND_TIMEOUT, Prompt::None)
            .await?
            .is_ok()
        {
            debug!("AT2[{}]: failed to get message {location}.", self.name);
            return Ok(0);
        }
        // the delete below resets the count
        let read = self.messages_read;
        if read == 0 {
            debug!("AT2[{}]: not deleted.", self.name);
            return Ok(0);
        }
        if !self
            .command(
                &format!("AT+CMGD={location}"),
                Duration::from_secs(7),
                Prompt::None,
            )
            .await?
            .is_ok()
        {
            error!(
                "AT2[{}]: failed to delete message {location}.",
                self.name
            );
        }
        Ok(read)
    }

    pub async fn read_stored(&mut self, steps: &[StorageStep]) -> anyhow::Result<()> {
        for step in steps {
            match step {
                StorageStep::Select(storage) => self.select_storage(storage).await?,
                StorageStep::ReadDelete(location) => {
                    self.read_delete(*location).await?;
                }
            }
        }
        Ok(())
    }

    /// Reads and deletes every message in the selected storage.
    pub async fn poll_memory(&mut self) -> anyhow::Result<()> {
        if !self
            .command("AT+CPMS?", COMMAND_TIMEOUT, Prompt::None)
            .await?
            .is_ok()
        {
            debug!("AT2[{}]: failed to send mem select command", self.name);
            return Ok(());
        }
        let Some((used, capacity)) = reply::parse_cpms(&self.output) else {
            debug!(
                "AT2[{}]: no correct header for CPMS response.",
                self.name
            );
            return Ok(());
        };
        if used == 0 {
            return Ok(());
        }
        debug!(
            "AT2[{}]: {used} messages waiting in memory",
            self.name
        );
        let start = self.definition.message_start;
        let mut found = 0;
        for location in start..start + capacity {
            let read = self.read_delete(location).await?;
            found += u32::try_from(read).unwrap_or(u32::MAX);
            if found >= used {
                break;
            }
        }
        Ok(())
    }

    /// Submits one PDU. Returns the final status and the TP-MR the modem
    /// assigned.
    pub async fn submit(
        &mut self,
        pdu: &str,
        keep_link: bool,
    ) -> anyhow::Result<(CommandStatus, Option<u32>)> {
        if keep_link {
            self.command("AT+CMMS=2", COMMAND_TIMEOUT, Prompt::None)
                .await?;
        }
        let status = self
            .command(
                &format!("AT+CMGS={}", pdu.len() / 2),
                Duration::from_secs(5),
                Prompt::Gt,
            )
            .await?;
        debug!("AT2[{}]: send command status: {status:?}", self.name);
        if status != CommandStatus::Prompt {
            return Ok((status, None));
        }

        // the default SMSC prefix is not counted in the length
        let sc = if self.definition.no_smsc { "" } else { "00" };
        let mut data = format!("{sc}{pdu}").into_bytes();
        data.push(CTRL_Z);
        debug!("AT2[{}]: --> {sc}{pdu}^Z", self.name);
        if self.definition.chunked_writes() {
            for chunk in data.chunks(CHUNK) {
                self.write(chunk).await?;
                sleep(Duration::from_millis(10)).await;
            }
        } else {
            self.write(&data).await?;
        }

        let status = self.wait(Duration::from_secs(20), Prompt::None).await?;
        debug!("AT2[{}]: send command status: {status:?}", self.name);
        Ok((status, self.message_ref))
    }

    pub async fn close(mut self) {
        if let Err(e) = self.io.shutdown().await {
            debug!("AT2[{}]: closing device: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use smsc_core::at::ExtractedPdu;
    use tokio::io::{AsyncBufReadExt as _, BufReader, DuplexStream, duplex};

    use super::*;

    fn modem(io: DuplexStream) -> Modem {
        let definition = ModemDefinition {
            sendline_sleep: Duration::ZERO,
            ..ModemDefinition::default()
        };
        Modem::new("test", Box::new(io), definition, false)
    }

    #[tokio::test]
    async fn readable_wakes_for_trailing_and_new_input() {
        let (near, far) = duplex(4096);
        let mut modem = modem(near);
        let (read, mut write) = tokio::io::split(far);
        let mut lines = BufReader::new(read).split(b'\r');

        write.write_all(b"\r\nOK\r\n+CMTI: \"SM\",1\r\n").await.unwrap();
        let status = modem.command("AT", COMMAND_TIMEOUT, Prompt::None).await.unwrap();
        assert_eq!(status, CommandStatus::Ok);
        assert_eq!(lines.next_segment().await.unwrap().unwrap(), b"AT");

        // the indication came with the reply
        modem.readable().await.unwrap();
        modem.wait(Duration::from_millis(10), Prompt::None).await.unwrap();
        assert_eq!(modem.take_events().len(), 1);

        // nothing left over, so only new input wakes it
        let idle = tokio::time::timeout(Duration::from_millis(10), modem.readable()).await;
        assert!(idle.is_err());
        write.write_all(b"+CMTI: \"SM\",2\r\n").await.unwrap();
        modem.readable().await.unwrap();
        modem.wait(Duration::from_millis(10), Prompt::None).await.unwrap();
        assert!(matches!(
            modem.take_events().as_slice(),
            [ModemEvent::RIndication { line }] if line == "+CMTI: \"SM\",2"
        ));

        drop(write);
        drop(lines);
        assert!(modem.readable().await.is_err());
    }

    #[tokio::test]
    async fn collects_unsolicited_lines_while_waiting() {
        let (near, far) = duplex(4096);
        let mut modem = modem(near);
        modem.ack_deliveries = true;
        let peer = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(far);
            let mut lines = BufReader::new(read).split(b'\r');
            assert_eq!(lines.next_segment().await.unwrap().unwrap(), b"AT");
            write
                .write_all(b"\r\n+CMTI: \"SM\",3\r\n+CMT: ,4\r\n0001020304\r\nOK\r\n")
                .await
                .unwrap();
            // the delivery is acknowledged before the command completes
            assert_eq!(lines.next_segment().await.unwrap().unwrap(), b"AT+CNMA");
            write.write_all(b"OK\r\n").await.unwrap();
        });

        let status = modem.command("AT", COMMAND_TIMEOUT, Prompt::None).await.unwrap();
        assert_eq!(status, CommandStatus::Ok);
        peer.await.unwrap();
        let events = modem.take_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ModemEvent::RIndication { line } if line == "+CMTI: \"SM\",3"));
        assert!(matches!(
            &events[1],
            ModemEvent::RMessage { pdu: ExtractedPdu { pdu, .. }, stored: false } if pdu == "01020304"
        ));
    }

    #[tokio::test]
    async fn submit_waits_for_prompt_and_reference() {
        let (near, far) = duplex(4096);
        let mut modem = modem(near);
        let peer = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(far);
            let mut reader = BufReader::new(read);
            let mut line = Vec::new();
            reader.read_until(b'\r', &mut line).await.unwrap();
            assert_eq!(line, b"AT+CMGS=3\r");
            write.write_all(b"\r\n> ").await.unwrap();
            line.clear();
            reader.read_until(CTRL_Z, &mut line).await.unwrap();
            assert_eq!(line, b"00010203\x1A");
            write.write_all(b"\r\n+CMGS: 42\r\n\r\nOK\r\n").await.unwrap();
        });

        let (status, reference) = modem.submit("010203", false).await.unwrap();
        peer.await.unwrap();
        assert_eq!(status, CommandStatus::Ok);
        assert_eq!(reference, Some(42));
    }

    #[tokio::test]
    async fn memory_poll_stops_once_used_messages_are_read() {
        let (near, far) = duplex(4096);
        let mut modem = modem(near);
        let peer = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(far);
            let mut lines = BufReader::new(read).split(b'\r');
            assert_eq!(lines.next_segment().await.unwrap().unwrap(), b"AT+CPMS?");
            write
                .write_all(b"\r\n+CPMS: 1,5,1,5,1,5\r\nOK\r\n")
                .await
                .unwrap();
            assert_eq!(lines.next_segment().await.unwrap().unwrap(), b"AT+CMGR=1");
            write
                .write_all(b"\r\n+CMGR: 0,,4\r\n0001020304\r\nOK\r\n")
                .await
                .unwrap();
            assert_eq!(lines.next_segment().await.unwrap().unwrap(), b"AT+CMGD=1");
            write.write_all(b"\r\nOK\r\n").await.unwrap();
            // nothing is read from location 2 onwards
            lines.next_segment().await.unwrap()
        });

        modem.poll_memory().await.unwrap();
        let events = modem.take_events();
        modem.close().await;
        assert_eq!(peer.await.unwrap(), None);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ModemEvent::RMessage { stored: true, .. }));
    }

    #[tokio::test]
    async fn silence_times_out_and_eof_fails() {
        let (near, far) = duplex(64);
        let mut modem = modem(near);
        let status = modem
            .wait(Duration::from_millis(50), Prompt::None)
            .await
            .unwrap();
        assert_eq!(status, CommandStatus::Timeout);
        drop(far);
        assert!(modem.wait(Duration::from_millis(50), Prompt::None).await.is_err());
    }

    #[tokio::test]
    async fn ring_is_hung_up() {
        let (near, far) = duplex(256);
        let mut modem = modem(near);
        let peer = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(far);
            let mut lines = BufReader::new(read).split(b'\r');
            write.write_all(b"RING\r\n").await.unwrap();
            assert_eq!(lines.next_segment().await.unwrap().unwrap(), b"ATH0");
            write.write_all(b"OK\r\n").await.unwrap();
        });
        assert_eq!(
            modem.wait(COMMAND_TIMEOUT, Prompt::None).await.unwrap(),
            CommandStatus::Ok
        );
        peer.await.unwrap();
    }
}
