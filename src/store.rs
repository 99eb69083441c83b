//! Bounded, deduplicated collection of received notifications.
//!
//! Ordered most-recently-changed first and keyed by `notification_id`.
//! The merge policy never regresses a verified entry to unverified, and an
//! unverified entry is only ever replaced by a verified one (upgrade).
//! Reconciliation is a read-modify-write: callers must serialize it. The
//! intended shape is one consumer loop draining the advertisement channel.
use heapless::Vec;

use crate::protocol::NotificationRecord;

/// Maximum number of notifications kept. Inserting beyond this drops the
/// oldest (tail) entry.
pub const MAX_NOTIFICATIONS: usize = 100;

/// What `reconcile` did with an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// New identity, inserted at the front. `evicted` is true when the
    /// oldest entry was dropped to make room.
    Inserted { evicted: bool },
    /// Existing unverified entry replaced in place by a verified record.
    Upgraded,
    /// Existing entry is verified; the incoming record was discarded.
    KeptVerified,
    /// Both existing and incoming are unverified; the first one wins.
    KeptUnverified,
}

/// The live notification collection. Single-writer: all mutation goes
/// through `reconcile` and `clear` from one reconciliation loop.
#[derive(Default)]
pub struct NotificationStore {
    entries: Vec<NotificationRecord, MAX_NOTIFICATIONS>,
}

impl NotificationStore {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Merge a freshly decoded record into the collection.
    pub fn reconcile(&mut self, record: NotificationRecord) -> ReconcileOutcome {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.notification_id == record.notification_id)
        {
            if existing.client_verified {
                // Stability over freshness: a verified entry is never
                // overwritten, not even by a newer verified record.
                return ReconcileOutcome::KeptVerified;
            }
            if record.client_verified {
                *existing = record;
                return ReconcileOutcome::Upgraded;
            }
            // First-unverified-wins. Deliberate per the protocol design;
            // see DESIGN.md before changing.
            return ReconcileOutcome::KeptUnverified;
        }

        let evicted = if self.entries.is_full() {
            self.entries.pop();
            true
        } else {
            false
        };
        // Capacity was just ensured, insert cannot fail.
        let _ = self.entries.insert(0, record);
        ReconcileOutcome::Inserted { evicted }
    }

    /// Drop every entry unconditionally.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Read-only view, most-recently-changed first.
    pub fn entries(&self) -> &[NotificationRecord] {
        &self.entries
    }

    pub fn get(&self, notification_id: &[u8; 4]) -> Option<&NotificationRecord> {
        self.entries
            .iter()
            .find(|e| e.notification_id == *notification_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Derived counts are recomputed on demand; n is capped at 100, so the
    // O(n) walk is cheaper than keeping counters consistent.

    pub fn verified_count(&self) -> usize {
        self.entries.iter().filter(|e| e.client_verified).count()
    }

    pub fn unverified_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.client_verified).count()
    }
}
