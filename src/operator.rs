//! Operator commands
//!
//! Staff talk to the bot in a private chat:
//! - `/groups` lists monitored groups
//! - `/stats` shows ledger counts
//! - `/testreminder <text>` posts a reminder for a made-up message so the
//!   routing table can be checked without waiting for a real client
//!
//! Nothing here writes to the ledger.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::gateway::MessagingGateway;
use crate::ledger::{LedgerStats, PendingEntry, SharedLedger};
use crate::registry::{DestinationRecord, SharedRegistry};
use crate::routing::RoutingTable;
use crate::scheduler::{reminder_keyboard, render_reminder};

const HELP_TEXT: &str = "Escalation bot\n\n\
    Commands:\n\
    /groups - Monitored groups\n\
    /stats - Pending and answered messages\n\
    /testreminder <text> - Send a test reminder routed by <text>";

/// Parsed operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Groups,
    Stats,
    TestReminder(String),
}

impl Command {
    /// Parse a command line; `None` when it is not a known command
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (head, args) = match text.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (text, ""),
        };
        // "/stats@my_bot" in chats with several bots
        let cmd = head.split('@').next().unwrap_or(head);

        match cmd {
            "/start" | "/help" => Some(Self::Help),
            "/groups" => Some(Self::Groups),
            "/stats" => Some(Self::Stats),
            "/testreminder" => Some(Self::TestReminder(args.to_string())),
            _ => None,
        }
    }
}

/// Answers operator commands
pub struct Operator {
    ledger: SharedLedger,
    registry: SharedRegistry,
    routing: Arc<RoutingTable>,
    gateway: Arc<dyn MessagingGateway>,
}

impl Operator {
    pub fn new(
        ledger: SharedLedger,
        registry: SharedRegistry,
        routing: Arc<RoutingTable>,
        gateway: Arc<dyn MessagingGateway>,
    ) -> Self {
        Self {
            ledger,
            registry,
            routing,
            gateway,
        }
    }

    /// Run `text` as a command in `chat_id`. Returns false when it is not one.
    pub async fn handle_command(&self, chat_id: i64, text: &str) -> bool {
        let Some(command) = Command::parse(text) else {
            return false;
        };

        let reply = match command {
            Command::Help => HELP_TEXT.to_string(),
            Command::Groups => format_groups(&self.registry.read().await.list()),
            Command::Stats => {
                let groups = self.registry.read().await.len();
                let stats = self.ledger.lock().await.stats();
                format_stats(groups, &stats)
            }
            Command::TestReminder(body) => self.test_reminder(chat_id, &body, Utc::now()).await,
        };

        if let Err(e) = self.gateway.send(chat_id, &reply, None, None).await {
            warn!("Failed to answer command in {}: {}", chat_id, e);
        }
        true
    }

    /// Route and send a reminder for a synthetic message. Returns the
    /// confirmation shown to the operator.
    async fn test_reminder(&self, chat_id: i64, body: &str, now: DateTime<Utc>) -> String {
        if body.is_empty() {
            return "Usage: /testreminder <message text>".to_string();
        }

        let entry = PendingEntry::new(0, chat_id, "Test group", chat_id, "test_user", body, now);
        let destination = self.routing.resolve(&entry.body, &entry.origin_channel_title, chat_id);
        let text = render_reminder(&entry, &destination, now);

        match self
            .gateway
            .send(destination.channel_id, &text, destination.thread_id, Some(reminder_keyboard(&entry)))
            .await
        {
            Ok(reference) => {
                info!(
                    "Test reminder {} sent to {} (topic {})",
                    reference,
                    destination.channel_id,
                    destination.topic_label()
                );
                format!(
                    "✅ Test reminder sent\n\nChat: {}\nThread: {}\nTopic: {}",
                    destination.channel_id,
                    destination
                        .thread_id
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    destination.topic_label()
                )
            }
            Err(e) => format!("❌ Test reminder failed: {}", e),
        }
    }
}

/// `/groups` reply
pub fn format_groups(records: &[DestinationRecord]) -> String {
    if records.is_empty() {
        return "📋 No groups are monitored yet.".to_string();
    }

    let mut text = String::from("📋 MONITORED GROUPS:\n\n");
    for record in records {
        text.push_str(&format!(
            "🏢 {}\n📊 ID: {}\n{}\n👥 Admins: {}\n⏰ Joined: {}\n\n",
            record.title,
            record.channel_id,
            if record.is_active { "🟢 Active" } else { "🔴 Inactive" },
            record.staff_ids.len(),
            record.joined_at.format("%d.%m.%Y %H:%M"),
        ));
    }
    text
}

/// `/stats` reply
pub fn format_stats(groups: usize, stats: &LedgerStats) -> String {
    format!(
        "📊 BOT STATISTICS\n\n\
        🏢 Monitored groups: {}\n\
        🔔 Unanswered messages: {}\n\
        ✅ Answered: {}\n\
        📝 Total messages: {}",
        groups, stats.pending, stats.answered, stats.total
    )
}
