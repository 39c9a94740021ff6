use std::time::{Duration, Instant};

use crate::{Sms, config::EMI_MAX_TRN};

/// An operation waiting for its reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    pub ot: u8,
    pub sent: Instant,
    /// The submitted message, `None` for alerts.
    pub sms: Option<Sms>,
}

/// Outstanding operations indexed by transaction reference.
///
/// A TRN is never handed out while its slot is busy.
#[derive(Clone, Debug)]
pub struct SlotTable {
    slots: Vec<Option<Slot>>,
    next: usize,
    unacked: usize,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self {
            slots: vec![None; EMI_MAX_TRN],
            next: 0,
            unacked: 0,
        }
    }
}

impl SlotTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn unacked(&self) -> usize {
        self.unacked
    }

    #[must_use]
    pub fn is_busy(&self, trn: u8) -> bool {
        self.slots
            .get(usize::from(trn))
            .is_some_and(Option::is_some)
    }

    #[must_use]
    pub fn get(&self, trn: u8) -> Option<&Slot> {
        self.slots.get(usize::from(trn)).and_then(Option::as_ref)
    }

    /// Next free TRN after the last one handed out, `None` if every slot is
    /// busy.
    pub fn next_trn(&mut self) -> Option<u8> {
        for _ in 0..EMI_MAX_TRN {
            let trn = self.next;
            self.next = (self.next + 1) % EMI_MAX_TRN;
            if self.slots[trn].is_none() {
                return u8::try_from(trn).ok();
            }
        }
        None
    }

    /// Marks `trn` as waiting for the reply to operation `ot`.
    pub fn occupy(&mut self, trn: u8, ot: u8, now: Instant, sms: Option<Sms>) {
        let Some(slot) = self.slots.get_mut(usize::from(trn)) else {
            return;
        };
        if slot.is_none() {
            self.unacked += 1;
        }
        *slot = Some(Slot { ot, sent: now, sms });
    }

    /// Frees the slot answered by a reply to `ot`. Returns `None` if no
    /// such operation is outstanding under `trn`.
    pub fn ack(&mut self, trn: u8, ot: u8) -> Option<Slot> {
        let slot = self.slots.get_mut(usize::from(trn))?;
        if slot.as_ref().is_none_or(|s| s.ot != ot) {
            return None;
        }
        self.unacked -= 1;
        slot.take()
    }

    /// TRNs of operations sent before `now - waitack`.
    #[must_use]
    pub fn expired(&self, now: Instant, waitack: Duration) -> Vec<u8> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(trn, slot)| {
                let slot = slot.as_ref()?;
                (now.saturating_duration_since(slot.sent) > waitack)
                    .then(|| u8::try_from(trn).ok())
                    .flatten()
            })
            .collect()
    }

    /// Empties the table, returning the submitted messages that were still
    /// waiting for a reply.
    pub fn clear_sent(&mut self) -> Vec<Sms> {
        self.unacked = 0;
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.take().filter(|s| s.ot == 51).and_then(|s| s.sms))
            .collect()
    }
}
