//! Resolution Handler
//!
//! Consumes inbound events one at a time:
//! - Group messages from clients become pending entries
//! - Staff replies (to a reminder or to the original) resolve an entry
//! - "Answered" button presses resolve an entry
//! - Membership changes keep the destination registry current
//!
//! Resolution retracts every live reminder, then marks the entry answered,
//! all under the ledger lock.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::gateway::{
    ButtonAction, ButtonPress, InboundEvent, MembershipChanged, MembershipStatus, MessagingGateway,
    NewMessage,
};
use crate::ledger::{Ledger, LedgerError, PendingEntry, SharedLedger};
use crate::operator::Operator;
use crate::registry::{spawn_staff_refresh, SharedRegistry};
use crate::staff::StaffPredicate;

/// Title used when a group's title is unknown
const UNKNOWN_GROUP_TITLE: &str = "Unknown group";

/// Sender handle Telegram uses for admins posting anonymously
const ANONYMOUS_ADMIN_HANDLE: &str = "GroupAnonymousBot";

/// What handling an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A new pending entry was recorded
    Tracked(i32),
    /// An entry was resolved; `retracted` reminder deletes were issued
    Resolved { message_id: i32, retracted: usize },
    /// An operator command was answered
    Command,
    /// Registry bookkeeping only
    Registry,
    /// Nothing to do
    Ignored,
}

/// Handles inbound events against the ledger and registry
pub struct ResolutionHandler {
    ledger: SharedLedger,
    registry: SharedRegistry,
    gateway: Arc<dyn MessagingGateway>,
    staff: Arc<dyn StaffPredicate>,
    operator: Option<Arc<Operator>>,
    /// Chat whose messages are never tracked
    excluded_channel: Option<i64>,
}

impl ResolutionHandler {
    pub fn new(
        ledger: SharedLedger,
        registry: SharedRegistry,
        gateway: Arc<dyn MessagingGateway>,
        staff: Arc<dyn StaffPredicate>,
    ) -> Self {
        Self {
            ledger,
            registry,
            gateway,
            staff,
            operator: None,
            excluded_channel: None,
        }
    }

    /// Never track messages posted in `channel_id`
    pub fn with_excluded_channel(mut self, channel_id: Option<i64>) -> Self {
        self.excluded_channel = channel_id;
        self
    }

    /// Answer operator commands in private chats
    pub fn with_operator(mut self, operator: Arc<Operator>) -> Self {
        self.operator = Some(operator);
        self
    }

    /// Handle one inbound event at `now`
    pub async fn handle(&self, event: InboundEvent, now: DateTime<Utc>) -> Outcome {
        match event {
            InboundEvent::NewMessage(msg) => self.handle_message(msg, now).await,
            InboundEvent::ButtonPress(press) => self.handle_button(press, now).await,
            InboundEvent::MembershipChanged(change) => self.handle_membership(change, now).await,
        }
    }

    async fn handle_message(&self, msg: NewMessage, now: DateTime<Utc>) -> Outcome {
        let Some(kind) = msg.channel_kind else {
            return self.handle_private(msg).await;
        };

        let title = msg
            .channel_title
            .clone()
            .unwrap_or_else(|| UNKNOWN_GROUP_TITLE.to_string());
        let observation = self
            .registry
            .write()
            .await
            .observe(msg.channel_id, &title, kind, now);
        if observation.needs_staff_refresh() {
            spawn_staff_refresh(Arc::clone(&self.gateway), Arc::clone(&self.registry), msg.channel_id);
        }

        if msg.from_self {
            return Outcome::Ignored;
        }

        // Anonymous admins post as GroupAnonymousBot, whose handle carries no
        // staff marker, so their messages are tracked like a client's.
        if msg.sender_handle.eq_ignore_ascii_case(ANONYMOUS_ADMIN_HANDLE) {
            debug!("Message {} from an anonymous admin in {}", msg.message_id, msg.channel_id);
        }

        if self.staff.is_privileged(&msg.sender_handle) {
            return match msg.reply_to_message_id {
                Some(target) => self.resolve_reply(&msg, target, now).await,
                None => Outcome::Ignored,
            };
        }

        if self.excluded_channel == Some(msg.channel_id) {
            debug!("Message {} in staff operations chat, not tracked", msg.message_id);
            return Outcome::Ignored;
        }

        let entry = PendingEntry::new(
            msg.message_id,
            msg.channel_id,
            &title,
            msg.sender_id,
            &msg.sender_handle,
            &msg.text,
            now,
        );
        self.ledger.lock().await.insert(entry);
        info!(
            "New client message {} from {} in {}",
            msg.message_id,
            if msg.sender_handle.is_empty() { "<no username>" } else { msg.sender_handle.as_str() },
            title
        );
        Outcome::Tracked(msg.message_id)
    }

    async fn handle_private(&self, msg: NewMessage) -> Outcome {
        let Some(operator) = &self.operator else {
            return Outcome::Ignored;
        };
        if !self.staff.is_privileged(&msg.sender_handle) {
            return Outcome::Ignored;
        }
        match operator.handle_command(msg.channel_id, &msg.text).await {
            true => Outcome::Command,
            false => Outcome::Ignored,
        }
    }

    /// Staff replied to `target` in the message's chat
    async fn resolve_reply(&self, msg: &NewMessage, target: i32, now: DateTime<Utc>) -> Outcome {
        let mut ledger = self.ledger.lock().await;

        let message_id = ledger
            .find_by_notification_ref(msg.channel_id, target)
            .or_else(|| ledger.find_by_origin(msg.channel_id, target))
            .filter(|e| e.is_pending())
            .map(|e| e.message_id);

        let Some(message_id) = message_id else {
            debug!("Staff reply to {} in {} matches no pending entry", target, msg.channel_id);
            return Outcome::Ignored;
        };

        match self.resolve_locked(&mut ledger, message_id, msg.sender_id, now).await {
            Ok(retracted) => {
                info!(
                    "Staff @{} answered message {} in group {}",
                    msg.sender_handle, message_id, msg.channel_id
                );
                Outcome::Resolved { message_id, retracted }
            }
            Err(e) => {
                warn!("Could not resolve message {}: {}", message_id, e);
                Outcome::Ignored
            }
        }
    }

    async fn handle_button(&self, press: ButtonPress, now: DateTime<Utc>) -> Outcome {
        let Some(ButtonAction::MarkAnswered(message_id)) = ButtonAction::decode(&press.payload) else {
            debug!("Unknown button payload {:?}", press.payload);
            self.acknowledge(&press.callback_id, "").await;
            return Outcome::Ignored;
        };

        let result = {
            let mut ledger = self.ledger.lock().await;
            self.resolve_locked(&mut ledger, message_id, press.presser_id, now).await
        };

        match result {
            Ok(retracted) => {
                info!("Message {} marked answered by {} via button", message_id, press.presser_id);
                self.acknowledge(&press.callback_id, "✅ Marked as answered!").await;
                Outcome::Resolved { message_id, retracted }
            }
            Err(LedgerError::AlreadyAnswered(_)) => {
                self.acknowledge(&press.callback_id, "This message was already answered.").await;
                Outcome::Ignored
            }
            Err(LedgerError::NotFound(_)) => {
                self.acknowledge(&press.callback_id, "Message not found.").await;
                Outcome::Ignored
            }
        }
    }

    async fn handle_membership(&self, change: MembershipChanged, now: DateTime<Utc>) -> Outcome {
        match change.new_status {
            MembershipStatus::Present => {
                info!("Bot added to group: {} (ID: {})", change.channel_title, change.channel_id);
                self.registry.write().await.observe(
                    change.channel_id,
                    &change.channel_title,
                    change.channel_kind,
                    now,
                );
                spawn_staff_refresh(Arc::clone(&self.gateway), Arc::clone(&self.registry), change.channel_id);
            }
            MembershipStatus::Removed => {
                info!("Bot removed from group: {} (ID: {})", change.channel_title, change.channel_id);
                self.registry.write().await.deactivate(change.channel_id, now);
            }
        }
        Outcome::Registry
    }

    /// Retract all live reminders of `message_id`, then mark it answered.
    /// Delete failures are logged and do not stop the resolution.
    async fn resolve_locked(
        &self,
        ledger: &mut Ledger,
        message_id: i32,
        resolver_id: i64,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let entry = ledger.find(message_id).ok_or(LedgerError::NotFound(message_id))?;
        if !entry.is_pending() {
            return Err(LedgerError::AlreadyAnswered(message_id));
        }

        let refs: Vec<(i64, i32)> = entry
            .notification_refs
            .iter()
            .map(|(channel, reference)| (*channel, *reference))
            .collect();

        let deletes = refs.iter().map(|(channel, reference)| {
            let gateway = Arc::clone(&self.gateway);
            let (channel, reference) = (*channel, *reference);
            async move {
                if let Err(e) = gateway.delete(channel, reference).await {
                    warn!("Failed to retract reminder {} in {}: {}", reference, channel, e);
                }
            }
        });
        join_all(deletes).await;

        ledger.mark_answered(message_id, resolver_id, now)?;
        Ok(refs.len())
    }

    async fn acknowledge(&self, callback_id: &str, text: &str) {
        if let Err(e) = self.gateway.acknowledge(callback_id, text).await {
            warn!("Failed to answer button press: {}", e);
        }
    }
}
