//! Delivery report correlation.
//!
//! A connector registers an expectation with [`Dlr::add`] after the SMSC (or
//! the modem) returned a reference for a submitted message, and resolves it
//! with [`Dlr::find`] once a notification for that reference arrives.

use std::{
    fmt::Debug,
    ops::{BitAnd, BitOr},
    sync::{Arc, PoisonError, RwLock},
};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{Sms, SmsType};

/// Only this many trailing destination digits are compared when a lookup asks
/// for destination matching.
const MIN_DST_LEN: usize = 7;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DlrMask(pub u8);

impl DlrMask {
    pub const NONE: Self = Self(0x00);
    pub const SUCCESS: Self = Self(0x01);
    pub const FAIL: Self = Self(0x02);
    pub const BUFFERED: Self = Self(0x04);
    pub const SMSC_SUCCESS: Self = Self(0x08);
    pub const SMSC_FAIL: Self = Self(0x10);
    pub const INTERMEDIATE: Self = Self(0x20);

    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Any report, handset or SMSC side, was requested.
    #[must_use]
    pub fn is_enabled(self) -> bool {
        self.0 & 0x1F != 0
    }

    /// A handset report was requested, which the SMSC or modem must generate.
    #[must_use]
    pub fn is_enabled_device(self) -> bool {
        self.0 & 0x07 != 0
    }
}

impl BitOr for DlrMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for DlrMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// A stored delivery report expectation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DlrEntry {
    pub smsc: String,
    pub timestamp: String,
    pub source: String,
    pub destination: String,
    pub service: Option<String>,
    pub url: Option<String>,
    pub boxc_id: Option<String>,
    pub mask: DlrMask,
    /// Last intermediate status seen.
    pub status: DlrMask,
    pub use_dst: bool,
}

impl DlrEntry {
    fn matches(&self, smsc: &str, ts: &str, dst: Option<&str>) -> bool {
        self.smsc == smsc
            && self.timestamp == ts
            && dst.is_none_or(|dst| self.destination.ends_with(dst))
    }
}

/// Storage for pending delivery report expectations.
///
/// `dst`, when given, is already shortened to its trailing digits and matches
/// entries whose destination ends with it.
pub trait DlrBackend: Debug + Send + Sync {
    fn name(&self) -> &'static str;
    fn add(&self, entry: DlrEntry);
    fn get(&self, smsc: &str, ts: &str, dst: Option<&str>) -> Option<DlrEntry>;
    fn update(&self, smsc: &str, ts: &str, dst: Option<&str>, status: DlrMask);
    fn remove(&self, smsc: &str, ts: &str, dst: Option<&str>);
    fn messages(&self) -> usize;
    fn flush(&self);
}

/// Available storage backends.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DlrStorage {
    #[default]
    Internal,
}

impl DlrStorage {
    #[must_use]
    pub fn create(self) -> Arc<dyn DlrBackend> {
        match self {
            Self::Internal => Arc::new(MemoryDlrStore::default()),
        }
    }
}

/// In-process store; entries are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryDlrStore {
    entries: RwLock<Vec<DlrEntry>>,
}

impl DlrBackend for MemoryDlrStore {
    fn name(&self) -> &'static str {
        "internal"
    }

    fn add(&self, entry: DlrEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    fn get(&self, smsc: &str, ts: &str, dst: Option<&str>) -> Option<DlrEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.matches(smsc, ts, dst))
            .cloned()
    }

    fn update(&self, smsc: &str, ts: &str, dst: Option<&str>, status: DlrMask) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.iter_mut().find(|e| e.matches(smsc, ts, dst)) {
            entry.status = status;
        }
    }

    fn remove(&self, smsc: &str, ts: &str, dst: Option<&str>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = entries.iter().position(|e| e.matches(smsc, ts, dst)) {
            entries.remove(pos);
        }
    }

    fn messages(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn flush(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Delivery report correlator shared by all connectors.
#[derive(Clone, Debug)]
pub struct Dlr {
    backend: Arc<dyn DlrBackend>,
}

impl Default for Dlr {
    fn default() -> Self {
        Self::new(DlrStorage::default())
    }
}

impl Dlr {
    #[must_use]
    pub fn new(storage: DlrStorage) -> Self {
        Self {
            backend: storage.create(),
        }
    }

    #[must_use]
    pub fn with_backend(backend: Arc<dyn DlrBackend>) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn messages(&self) -> usize {
        self.backend.messages()
    }

    pub fn flush(&self) {
        self.backend.flush();
    }

    /// Registers a report expectation for `sms` under `(smsc, ts)`.
    ///
    /// Always records `ts` as the message's foreign id; stores nothing unless
    /// the message asked for a report.
    pub fn add(&self, smsc: &str, ts: &str, sms: &mut Sms, use_dst: bool) {
        sms.foreign_id = Some(ts.to_owned());

        if smsc.is_empty() {
            warn!("DLR[{}]: Can't add a dlr without smsc-id", self.backend.name());
            return;
        }
        if !sms.dlr_mask.is_enabled() {
            return;
        }

        let entry = DlrEntry {
            smsc: smsc.to_owned(),
            timestamp: ts.to_owned(),
            source: sms.sender.clone(),
            destination: sms.receiver.clone(),
            service: sms.service.clone(),
            url: sms.dlr_url.clone(),
            boxc_id: sms.boxc_id.clone(),
            mask: sms.dlr_mask,
            status: DlrMask::NONE,
            use_dst,
        };
        debug!(
            "DLR[{}]: Adding DLR smsc={smsc}, ts={ts}, src={}, dst={}, mask={}",
            self.backend.name(),
            entry.source,
            entry.destination,
            entry.mask.0
        );
        self.backend.add(entry);
    }

    /// Resolves a report of kind `typ` for `(smsc, ts)`.
    ///
    /// Returns a report message when `typ` was requested. The stored entry is
    /// kept for an intermediate `BUFFERED` report if a final one is still
    /// expected, and removed otherwise.
    #[must_use]
    pub fn find(
        &self,
        smsc: &str,
        ts: &str,
        dst: Option<&str>,
        typ: DlrMask,
        use_dst: bool,
    ) -> Option<Sms> {
        if smsc.is_empty() {
            warn!("DLR[{}]: Can't find a dlr without smsc-id", self.backend.name());
            return None;
        }

        let dst_min = dst.filter(|_| use_dst).map(|dst| {
            let skip = dst.len().saturating_sub(MIN_DST_LEN);
            dst.get(skip..).unwrap_or(dst)
        });
        debug!(
            "DLR[{}]: Looking for DLR smsc={smsc}, ts={ts}, dst={}, type={}",
            self.backend.name(),
            dst.unwrap_or_default(),
            typ.0
        );

        let Some(entry) = self.backend.get(smsc, ts, dst_min) else {
            warn!(
                "DLR[{}]: DLR from SMSC<{smsc}> for DST<{}> not found.",
                self.backend.name(),
                dst.unwrap_or_default()
            );
            return None;
        };

        let report = if typ.intersects(entry.mask) {
            let mut sms = Sms::new(
                SmsType::ReportMo,
                entry.source.clone(),
                entry.destination.clone(),
                Vec::new(),
            );
            sms.dlr_mask = typ;
            sms.service = entry.service.clone();
            sms.smsc_id = Some(entry.smsc.clone());
            sms.dlr_url = entry.url.clone();
            sms.boxc_id = entry.boxc_id.clone();
            sms.foreign_id = Some(ts.to_owned());
            sms.time = Utc::now();
            Some(sms)
        } else {
            debug!(
                "DLR[{}]: Ignoring DLR message because of mask type={} dlr->mask={}",
                self.backend.name(),
                typ.0,
                entry.mask.0
            );
            None
        };

        if typ.intersects(DlrMask::BUFFERED)
            && entry.mask.intersects(DlrMask::SUCCESS | DlrMask::FAIL)
        {
            debug!(
                "DLR[{}]: DLR not destroyed, still waiting for other delivery report",
                self.backend.name()
            );
            self.backend.update(smsc, ts, dst_min, typ);
        } else {
            self.backend.remove(smsc, ts, dst_min);
        }

        report
    }
}
