//! Pending-operation log for optimistic local edits.
//!
//! Every local mutation is applied to the replica immediately and logged
//! here under a client-generated op id until the server confirms it:
//!
//! ```text
//!   mutate ──► PendingLog.push(op) ──► outbox ──► server
//!                    ▲                               │
//!                    ├──── Ack { op_id } ◄───────────┤
//!                    └──── SyncStep1 { state vector } ┘  (reconcile)
//! ```
//!
//! Entries still in the log when the connection comes back are re-sent.
//! Applying an update twice is harmless, so a resend never double-applies.
//! Once the log has evicted an entry, replaying it no longer covers every
//! local edit; [`PendingLog::take_gap`] tells the replica to send a full
//! diff against the server's state vector instead.

use std::collections::VecDeque;

use uuid::Uuid;

/// Default bound on unconfirmed operations.
pub const DEFAULT_PENDING_CAPACITY: usize = 10_000;

/// One local edit awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOp {
    /// Client-generated operation id, echoed back in `Ack`.
    pub op_id: Uuid,
    /// Local document clock after the edit.
    pub clock: u64,
    /// Whether the edit created content (advanced the local clock).
    /// Delete-only edits leave the clock unchanged and can only be
    /// confirmed by an explicit ack.
    pub advances_clock: bool,
    /// Encoded v1 update.
    pub update: Vec<u8>,
}

/// Bounded FIFO of unconfirmed operations.
#[derive(Debug)]
pub struct PendingLog {
    entries: VecDeque<PendingOp>,
    max_size: usize,
    dropped: u64,
    gap: bool,
}

impl PendingLog {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
            dropped: 0,
            gap: false,
        }
    }

    /// Record an operation. A full log drops its oldest entry.
    pub fn push(&mut self, op: PendingOp) {
        if self.entries.len() >= self.max_size {
            if let Some(oldest) = self.entries.pop_front() {
                self.dropped += 1;
                self.gap = true;
                log::warn!(
                    "Pending log full ({} ops), dropping unconfirmed op {}",
                    self.max_size,
                    oldest.op_id
                );
            }
        }
        self.entries.push_back(op);
    }

    /// Remove the operation the server acknowledged.
    pub fn acknowledge(&mut self, op_id: Uuid) -> bool {
        match self.entries.iter().position(|op| op.op_id == op_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop every clock-advancing op covered by an authoritative clock.
    ///
    /// Returns the number of entries removed.
    pub fn reconcile(&mut self, confirmed_clock: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|op| !(op.advances_clock && op.clock <= confirmed_clock));
        before - self.entries.len()
    }

    /// Snapshot of the unconfirmed operations, oldest first.
    pub fn unconfirmed(&self) -> Vec<PendingOp> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Operations evicted because the log was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Whether an entry was evicted since the last call. Clears the flag.
    pub fn take_gap(&mut self) -> bool {
        std::mem::take(&mut self.gap)
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|op| op.update.len()).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for PendingLog {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CAPACITY)
    }
}
