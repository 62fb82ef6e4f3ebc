//! Topic Routing
//!
//! Maps a pending entry to the chat (and forum topic) where reminders for it
//! are posted. The table is a static keyword list loaded once at startup:
//!
//! 1. Message body: case-insensitive substring match against each keyword
//! 2. Origin chat title: `|`-separated segments, optional leading `#`,
//!    exact case-insensitive match
//! 3. Fallback: the origin chat itself, no topic
//!
//! Declared order decides ties at every stage.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::store::JsonSnapshot;

/// Literal rendered in reminders when no keyword matched
pub const UNRESOLVED_TOPIC: &str = "unresolved";

/// Separator between segments of a chat title ("Visa | #UK | Support")
const TITLE_SEPARATOR: char = '|';

/// Optional marker in front of a title segment
const TITLE_MARKER: char = '#';

/// One row of the routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    /// Chat that receives the reminder
    #[serde(alias = "chat_id")]
    pub channel_id: i64,
    /// Forum topic inside that chat (0 = none)
    #[serde(default, alias = "message_thread_id")]
    pub thread_id: i32,
    /// Topic keyword, usually a country name
    #[serde(alias = "text")]
    pub keyword: String,
}

impl RoutingEntry {
    pub fn new(channel_id: i64, thread_id: i32, keyword: &str) -> Self {
        Self {
            channel_id,
            thread_id,
            keyword: keyword.to_string(),
        }
    }

    fn thread(&self) -> Option<i32> {
        (self.thread_id != 0).then_some(self.thread_id)
    }
}

/// Where a reminder goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub channel_id: i64,
    pub thread_id: Option<i32>,
    /// Matched keyword, `None` when the fallback was used
    pub topic: Option<String>,
}

impl Destination {
    /// Topic label for display
    pub fn topic_label(&self) -> &str {
        self.topic.as_deref().unwrap_or(UNRESOLVED_TOPIC)
    }

    pub fn is_resolved(&self) -> bool {
        self.topic.is_some()
    }
}

/// How a destination was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStage {
    Body,
    Title,
    Fallback,
}

/// Static keyword -> destination table
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
}

impl RoutingTable {
    pub fn new(entries: Vec<RoutingEntry>) -> Self {
        Self { entries }
    }

    /// Load from a JSON list. Missing or malformed files yield an empty table.
    pub fn load(path: &Path) -> Self {
        let entries: Vec<RoutingEntry> = JsonSnapshot::new(path).load_or_default();
        info!("Routing table: {} entries from {:?}", entries.len(), path);
        for entry in &entries {
            debug!(
                "  {} -> chat {} topic {}",
                entry.keyword, entry.channel_id, entry.thread_id
            );
        }
        Self::new(entries)
    }

    pub fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the destination for a message body posted in `origin_channel_id`
    pub fn resolve(&self, body: &str, origin_title: &str, origin_channel_id: i64) -> Destination {
        self.resolve_with_stage(body, origin_title, origin_channel_id).0
    }

    /// Same as [`resolve`](Self::resolve) but also reports which stage matched
    pub fn resolve_with_stage(
        &self,
        body: &str,
        origin_title: &str,
        origin_channel_id: i64,
    ) -> (Destination, MatchStage) {
        if let Some(entry) = self.match_body(body) {
            return (Self::destination(entry), MatchStage::Body);
        }

        if let Some(entry) = self.match_title(origin_title) {
            return (Self::destination(entry), MatchStage::Title);
        }

        (
            Destination {
                channel_id: origin_channel_id,
                thread_id: None,
                topic: None,
            },
            MatchStage::Fallback,
        )
    }

    fn destination(entry: &RoutingEntry) -> Destination {
        Destination {
            channel_id: entry.channel_id,
            thread_id: entry.thread(),
            topic: Some(entry.keyword.clone()),
        }
    }

    fn keyed(&self) -> impl Iterator<Item = (&RoutingEntry, String)> {
        self.entries
            .iter()
            .filter(|e| !e.keyword.trim().is_empty())
            .map(|e| (e, e.keyword.trim().to_lowercase()))
    }

    fn match_body(&self, body: &str) -> Option<&RoutingEntry> {
        let body = body.to_lowercase();
        self.keyed()
            .find(|(_, keyword)| body.contains(keyword.as_str()))
            .map(|(entry, _)| entry)
    }

    fn match_title(&self, title: &str) -> Option<&RoutingEntry> {
        let candidates = title_candidates(title);
        if candidates.is_empty() {
            return None;
        }
        self.keyed()
            .find(|(_, keyword)| candidates.iter().any(|c| c == keyword))
            .map(|(entry, _)| entry)
    }
}

/// Lower-cased title segments, each with and without its leading marker
fn title_candidates(title: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    for segment in title.split(TITLE_SEPARATOR) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        candidates.push(segment.to_lowercase());
        if let Some(stripped) = segment.strip_prefix(TITLE_MARKER) {
            let stripped = stripped.trim();
            if !stripped.is_empty() {
                candidates.push(stripped.to_lowercase());
            }
        }
    }
    candidates
}
