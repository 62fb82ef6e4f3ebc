//! Reminder Scheduler
//!
//! Periodically scans the ledger and reminds staff about messages nobody
//! answered:
//! - First reminder once `reminder_delay` has passed since the message
//! - Further reminders every `reminder_delay` after the previous one
//! - Failed sends change nothing, so the entry is retried on the next scan
//!
//! The scan interval is independent of the delay and must not exceed it,
//! otherwise reminders go out late by up to one interval.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gateway::{message_link, ButtonAction, GatewayError, Keyboard, KeyboardButton, MessagingGateway};
use crate::ledger::{Ledger, PendingEntry, SharedLedger};
use crate::routing::{Destination, RoutingTable};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to scan the ledger
    pub scan_interval: Duration,
    /// Silence before each reminder
    pub reminder_delay: chrono::Duration,
    /// Answered entries older than this are dropped (None = keep)
    pub answered_retention: Option<chrono::Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            scan_interval: config.scan_interval,
            reminder_delay: config.reminder_delay_chrono(),
            answered_retention: config.answered_retention(),
        }
    }
}

/// Outcome of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// Scans the ledger and sends reminders
pub struct ReminderScheduler {
    config: SchedulerConfig,
    ledger: SharedLedger,
    routing: Arc<RoutingTable>,
    gateway: Arc<dyn MessagingGateway>,
}

impl ReminderScheduler {
    pub fn new(
        config: SchedulerConfig,
        ledger: SharedLedger,
        routing: Arc<RoutingTable>,
        gateway: Arc<dyn MessagingGateway>,
    ) -> Self {
        Self {
            config,
            ledger,
            routing,
            gateway,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one scan at `now`. The ledger lock is held for the whole scan so
    /// a resolution cannot interleave with a send for the same entry.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut ledger = self.ledger.lock().await;

        let due: Vec<PendingEntry> = ledger
            .all()
            .into_iter()
            .filter(|e| e.is_due(now, self.config.reminder_delay))
            .collect();
        report.due = due.len();

        for entry in &due {
            match self.remind(&mut ledger, entry, now).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!(
                        "Reminder for message {} (group {}) failed: {}",
                        entry.message_id, entry.origin_channel_id, e
                    );
                    report.failed += 1;
                }
            }
        }

        if let Some(retention) = self.config.answered_retention {
            report.pruned = ledger.prune_answered(now - retention);
        }

        if report.due > 0 {
            info!(
                "Reminder scan: {} due, {} sent, {} failed",
                report.due, report.sent, report.failed
            );
        }
        report
    }

    async fn remind(
        &self,
        ledger: &mut Ledger,
        entry: &PendingEntry,
        now: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let destination = self.routing.resolve(
            &entry.body,
            &entry.origin_channel_title,
            entry.origin_channel_id,
        );
        let text = render_reminder(entry, &destination, now);
        let keyboard = reminder_keyboard(entry);

        let reference = self
            .gateway
            .send(destination.channel_id, &text, destination.thread_id, Some(keyboard))
            .await?;

        info!(
            "Reminder #{} for message {} sent to {} (topic {:?})",
            entry.reminder_count + 1,
            entry.message_id,
            destination.channel_id,
            destination.thread_id
        );

        match ledger.record_reminder(entry.message_id, destination.channel_id, reference, now) {
            Ok(Some(superseded)) => {
                if let Err(e) = self.gateway.delete(destination.channel_id, superseded).await {
                    debug!("Could not delete superseded reminder {}: {}", superseded, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Reminder sent but not recorded: {}", e),
        }
        Ok(())
    }

    /// Start the scan loop in the background
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let interval = self.config.scan_interval;

        let task = tokio::spawn(async move {
            info!("Reminder scheduler started (every {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick(Utc::now()).await;
                    }
                    _ = rx.recv() => {
                        info!("Reminder scheduler shutting down");
                        break;
                    }
                }
            }
        });

        SchedulerHandle {
            shutdown_tx: tx,
            task,
        }
    }
}

/// Running scheduler loop
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for the current scan to finish
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!("Reminder scheduler task ended abnormally: {}", e);
        }
    }
}

/// Reminder text posted to staff
pub fn render_reminder(entry: &PendingEntry, destination: &Destination, now: DateTime<Utc>) -> String {
    let author = if entry.author_display_name.is_empty() {
        "(no username)".to_string()
    } else {
        format!("@{}", entry.author_display_name)
    };

    format!(
        "⚠️ UNANSWERED MESSAGE (reminder #{})\n\n\
        🏢 Group: {}\n\
        🆔 Group ID: {}\n\
        🌍 Topic: {}\n\
        👤 User: {} (ID: {})\n\
        ⏰ Sent at: {}\n\
        📝 Message: \"{}\"\n\n\
        🔔 Waiting for a reply for {}\n\
        ⏱️ Reminders so far: {}\n\n\
        Please reply as soon as possible!",
        entry.reminder_count + 1,
        entry.origin_channel_title,
        entry.origin_channel_id,
        destination.topic_label(),
        author,
        entry.author_id,
        entry.created_at.format("%d.%m.%Y %H:%M:%S"),
        entry.body,
        format_elapsed(entry.elapsed(now)),
        entry.reminder_count,
    )
}

/// "Answered" button, plus a link to the original message when one exists
pub fn reminder_keyboard(entry: &PendingEntry) -> Keyboard {
    let mut rows = Vec::new();
    if let Some(link) = message_link(entry.origin_channel_id, entry.message_id) {
        rows.push(vec![KeyboardButton::link("📝 Reply", &link)]);
    }
    rows.push(vec![KeyboardButton::callback(
        "✅ Answered",
        &ButtonAction::MarkAnswered(entry.message_id).encode(),
    )]);
    rows
}

/// Format elapsed time for human display
pub fn format_elapsed(d: chrono::Duration) -> String {
    let minutes = d.num_minutes().max(0);
    if minutes < 60 {
        format!("{} min", minutes)
    } else if minutes < 24 * 60 {
        format!("{} h {} min", minutes / 60, minutes % 60)
    } else {
        let days = minutes / (24 * 60);
        let hours = (minutes % (24 * 60)) / 60;
        format!("{} d {} h", days, hours)
    }
}
