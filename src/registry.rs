//! Monitored-Destination Registry
//!
//! One record per group the bot operates in. Records are created on the
//! first membership event or message from an unseen group and are never
//! deleted; removal only flips `is_active`.
//!
//! Staff ids are refreshed by a detached task per chat that touches only
//! this registry, never the ledger lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::gateway::MessagingGateway;
use crate::store::JsonSnapshot;

pub type SharedRegistry = Arc<RwLock<DestinationRegistry>>;

/// Group flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Group,
    Supergroup,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Supergroup => "supergroup",
        }
    }
}

/// A chat the bot is (or was) a member of
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub channel_id: i64,
    pub title: String,
    pub kind: ChatKind,
    pub joined_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub staff_ids: BTreeSet<i64>,
}

/// What [`DestinationRegistry::observe`] changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First time this chat was seen
    Created,
    /// Known chat that had been marked inactive
    Reactivated,
    /// Known, active chat
    Updated,
}

impl Observation {
    /// Whether the staff list should be fetched again
    pub fn needs_staff_refresh(&self) -> bool {
        matches!(self, Self::Created | Self::Reactivated)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    destinations: HashMap<i64, DestinationRecord>,
}

/// Registry of monitored chats
#[derive(Debug, Default)]
pub struct DestinationRegistry {
    records: HashMap<i64, DestinationRecord>,
    snapshot: Option<JsonSnapshot>,
}

impl DestinationRegistry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn open(path: &Path) -> Self {
        let snapshot = JsonSnapshot::new(path);
        let document: RegistryDocument = snapshot.load_or_default();
        info!("Registry: {} groups loaded from {:?}", document.destinations.len(), path);
        Self {
            records: document.destinations,
            snapshot: Some(snapshot),
        }
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn get(&self, channel_id: i64) -> Option<&DestinationRecord> {
        self.records.get(&channel_id)
    }

    /// Title of a known chat
    pub fn title(&self, channel_id: i64) -> Option<&str> {
        self.records.get(&channel_id).map(|r| r.title.as_str())
    }

    /// Records sorted by join time
    pub fn list(&self) -> Vec<DestinationRecord> {
        let mut records: Vec<DestinationRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|r| (r.joined_at, r.channel_id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.records.values().filter(|r| r.is_active).count()
    }

    /// Record that the bot is present in `channel_id` (message or join event)
    pub fn observe(
        &mut self,
        channel_id: i64,
        title: &str,
        kind: ChatKind,
        now: DateTime<Utc>,
    ) -> Observation {
        let observation = match self.records.get_mut(&channel_id) {
            Some(record) => {
                let observation = if record.is_active {
                    Observation::Updated
                } else {
                    Observation::Reactivated
                };
                record.title = title.to_string();
                record.kind = kind;
                record.last_updated = now;
                record.is_active = true;
                observation
            }
            None => {
                info!("New group: {} (ID: {})", title, channel_id);
                self.records.insert(
                    channel_id,
                    DestinationRecord {
                        channel_id,
                        title: title.to_string(),
                        kind,
                        joined_at: now,
                        last_updated: now,
                        is_active: true,
                        staff_ids: BTreeSet::new(),
                    },
                );
                Observation::Created
            }
        };
        self.flush();
        observation
    }

    /// The bot left or was removed. Returns false for unknown chats.
    pub fn deactivate(&mut self, channel_id: i64, now: DateTime<Utc>) -> bool {
        let Some(record) = self.records.get_mut(&channel_id) else {
            return false;
        };
        record.is_active = false;
        record.last_updated = now;
        info!("Group deactivated: {} (ID: {})", record.title, channel_id);
        self.flush();
        true
    }

    /// Replace the staff list of a known chat
    pub fn set_staff(&mut self, channel_id: i64, staff_ids: BTreeSet<i64>, now: DateTime<Utc>) -> bool {
        let Some(record) = self.records.get_mut(&channel_id) else {
            return false;
        };
        record.staff_ids = staff_ids;
        record.last_updated = now;
        self.flush();
        true
    }

    pub fn flush(&self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let document = RegistryDocumentRef {
            destinations: &self.records,
        };
        if let Err(e) = snapshot.save(&document) {
            warn!("Failed to persist registry to {:?}: {}", snapshot.path(), e);
        }
    }
}

#[derive(Serialize)]
struct RegistryDocumentRef<'a> {
    destinations: &'a HashMap<i64, DestinationRecord>,
}

/// Fetch the chat's administrators and store them. Errors are logged.
pub async fn refresh_staff(
    gateway: Arc<dyn MessagingGateway>,
    registry: SharedRegistry,
    channel_id: i64,
) {
    let staff = match gateway.fetch_staff(channel_id).await {
        Ok(staff) => staff,
        Err(e) => {
            warn!("Failed to fetch administrators for {}: {}", channel_id, e);
            return;
        }
    };

    let count = staff.len();
    let updated = registry
        .write()
        .await
        .set_staff(channel_id, staff.into_iter().collect(), Utc::now());
    if updated {
        info!("Group {} has {} administrators", channel_id, count);
    }
}

/// Run [`refresh_staff`] as a detached task
pub fn spawn_staff_refresh(
    gateway: Arc<dyn MessagingGateway>,
    registry: SharedRegistry,
    channel_id: i64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(refresh_staff(gateway, registry, channel_id))
}
