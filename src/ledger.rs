//! Escalation Ledger
//!
//! Authoritative state of every tracked message, keyed by the original
//! message id. Each mutation is written through to the snapshot file before
//! the call returns; a failed write is logged and memory stays authoritative.
//!
//! Lifecycle of an entry:
//!
//! ```text
//! insert ──► Pending ──(record_reminder)*──► mark_answered ──► Answered
//! ```
//!
//! `Answered` is terminal.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::JsonSnapshot;

/// Ledger shared between the resolution handler and the scheduler.
/// Every read-modify-write sequence runs under this one lock.
pub type SharedLedger = Arc<Mutex<Ledger>>;

/// Ledger errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Entry not found: {0}")]
    NotFound(i32),
    #[error("Entry already answered: {0}")]
    AlreadyAnswered(i32),
}

/// Entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Answered,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Answered => "answered",
        }
    }
}

/// A user message waiting for a staff response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub message_id: i32,
    pub origin_channel_id: i64,
    pub origin_channel_title: String,
    pub author_id: i64,
    pub author_display_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// `None` until the first reminder is sent
    pub last_reminder_at: Option<DateTime<Utc>>,
    pub reminder_count: u32,
    pub status: EntryStatus,
    pub resolved_by: Option<i64>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Destination chat id -> id of the live reminder message there
    #[serde(default)]
    pub notification_refs: HashMap<i64, i32>,
}

impl PendingEntry {
    /// New, never-reminded entry
    pub fn new(
        message_id: i32,
        origin_channel_id: i64,
        origin_channel_title: &str,
        author_id: i64,
        author_display_name: &str,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            origin_channel_id,
            origin_channel_title: origin_channel_title.to_string(),
            author_id,
            author_display_name: author_display_name.to_string(),
            body: body.to_string(),
            created_at,
            last_reminder_at: None,
            reminder_count: 0,
            status: EntryStatus::Pending,
            resolved_by: None,
            resolved_at: None,
            notification_refs: HashMap::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }

    /// Whether a reminder should go out at `now`
    pub fn is_due(&self, now: DateTime<Utc>, delay: Duration) -> bool {
        if !self.is_pending() {
            return false;
        }
        match self.last_reminder_at {
            Some(last) if self.reminder_count > 0 => now - last >= delay,
            _ => now - self.created_at >= delay,
        }
    }

    /// Time since the original message
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Whether `message_id` in `channel_id` is one of this entry's reminders
    pub fn has_notification_ref(&self, channel_id: i64, message_id: i32) -> bool {
        self.notification_refs.get(&channel_id) == Some(&message_id)
    }
}

/// Aggregate counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub pending: usize,
    pub answered: usize,
    pub total: usize,
}

/// On-disk document: `{"messages": {"<message id>": entry}}`
#[derive(Debug, Default, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    messages: HashMap<i32, PendingEntry>,
}

/// In-memory ledger with write-through persistence
#[derive(Debug, Default)]
pub struct Ledger {
    entries: HashMap<i32, PendingEntry>,
    snapshot: Option<JsonSnapshot>,
}

impl Ledger {
    /// Ledger without persistence
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the ledger backed by `path`, loading whatever is there
    pub fn open(path: &Path) -> Self {
        let snapshot = JsonSnapshot::new(path);
        let document: LedgerDocument = snapshot.load_or_default();
        info!("Ledger: {} entries loaded from {:?}", document.messages.len(), path);
        Self {
            entries: document.messages,
            snapshot: Some(snapshot),
        }
    }

    /// Wrap in the shared lock
    pub fn shared(self) -> SharedLedger {
        Arc::new(Mutex::new(self))
    }

    /// Add or overwrite an entry
    pub fn insert(&mut self, entry: PendingEntry) {
        debug!("Ledger insert: message {}", entry.message_id);
        self.entries.insert(entry.message_id, entry);
        self.flush();
    }

    pub fn find(&self, message_id: i32) -> Option<&PendingEntry> {
        self.entries.get(&message_id)
    }

    /// Entry whose live reminder in `channel_id` has id `reference`
    pub fn find_by_notification_ref(&self, channel_id: i64, reference: i32) -> Option<&PendingEntry> {
        self.entries
            .values()
            .find(|e| e.has_notification_ref(channel_id, reference))
    }

    /// Entry for the original message `message_id` posted in `channel_id`
    pub fn find_by_origin(&self, channel_id: i64, message_id: i32) -> Option<&PendingEntry> {
        self.entries
            .get(&message_id)
            .filter(|e| e.origin_channel_id == channel_id)
    }

    /// Snapshot of all entries, oldest first
    pub fn all(&self) -> Vec<PendingEntry> {
        let mut entries: Vec<PendingEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| (e.created_at, e.message_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a successful reminder send. Returns the reminder it supersedes
    /// at the same destination, if any.
    pub fn record_reminder(
        &mut self,
        message_id: i32,
        destination_channel_id: i64,
        reference: i32,
        at: DateTime<Utc>,
    ) -> Result<Option<i32>, LedgerError> {
        let entry = self
            .entries
            .get_mut(&message_id)
            .ok_or(LedgerError::NotFound(message_id))?;
        if !entry.is_pending() {
            return Err(LedgerError::AlreadyAnswered(message_id));
        }

        entry.reminder_count += 1;
        entry.last_reminder_at = Some(at);
        let superseded = entry
            .notification_refs
            .insert(destination_channel_id, reference)
            .filter(|previous| *previous != reference);

        self.flush();
        Ok(superseded)
    }

    /// Transition to answered. Reminders must already have been retracted.
    pub fn mark_answered(
        &mut self,
        message_id: i32,
        resolver_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let entry = self
            .entries
            .get_mut(&message_id)
            .ok_or(LedgerError::NotFound(message_id))?;
        if !entry.is_pending() {
            return Err(LedgerError::AlreadyAnswered(message_id));
        }

        entry.status = EntryStatus::Answered;
        entry.resolved_by = Some(resolver_id);
        entry.resolved_at = Some(at);
        entry.notification_refs.clear();

        info!("Message {} answered by {}", message_id, resolver_id);
        self.flush();
        Ok(())
    }

    /// Drop answered entries resolved before `cutoff`
    pub fn prune_answered(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            e.is_pending() || e.resolved_at.map(|at| at >= cutoff).unwrap_or(true)
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("Pruned {} answered entries", removed);
            self.flush();
        }
        removed
    }

    pub fn stats(&self) -> LedgerStats {
        let pending = self.entries.values().filter(|e| e.is_pending()).count();
        LedgerStats {
            pending,
            answered: self.entries.len() - pending,
            total: self.entries.len(),
        }
    }

    /// Write the full snapshot. Failures are logged only.
    pub fn flush(&self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let document = LedgerDocumentRef {
            messages: &self.entries,
        };
        if let Err(e) = snapshot.save(&document) {
            warn!("Failed to persist ledger to {:?}: {}", snapshot.path(), e);
        }
    }
}

#[derive(Serialize)]
struct LedgerDocumentRef<'a> {
    messages: &'a HashMap<i32, PendingEntry>,
}
