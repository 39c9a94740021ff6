use std::{cmp::Ordering, collections::BinaryHeap};

use crate::Sms;

#[derive(Clone, Debug)]
struct Queued {
    seq: u64,
    sms: Sms,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Queued {}
impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
// greatest is popped first: higher priority, then older message time, then
// lower enqueue sequence
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sms
            .priority
            .cmp(&other.sms.priority)
            .then_with(|| other.sms.time.cmp(&self.sms.time))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Outbound message queue ordered by priority, then message time.
#[derive(Clone, Debug, Default)]
pub struct SmsQueue {
    heap: BinaryHeap<Queued>,
    seq: u64,
}

impl SmsQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sms: Sms) {
        self.seq += 1;
        self.heap.push(Queued { seq: self.seq, sms });
    }

    pub fn pop(&mut self) -> Option<Sms> {
        self.heap.pop().map(|q| q.sms)
    }

    #[must_use]
    pub fn peek(&self) -> Option<&Sms> {
        self.heap.peek().map(|q| &q.sms)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Removes every queued message in send order.
    pub fn drain(&mut self) -> Vec<Sms> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(sms) = self.pop() {
            out.push(sms);
        }
        out
    }
}
