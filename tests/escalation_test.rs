//! Escalation flow integration tests
//!
//! Drives the resolution handler and the reminder scheduler against an
//! in-memory gateway, without a Telegram connection.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use escalation_bot::{
    ButtonAction, ButtonPress, ChatKind, DestinationRegistry, EntryStatus, GatewayError,
    InboundEvent, Keyboard, Ledger, MembershipChanged, MembershipStatus, MessagingGateway,
    NewMessage, Operator, OrgMarker, Outcome, ResolutionHandler, ReminderScheduler, RoutingEntry,
    RoutingTable, SchedulerConfig, SharedLedger, SharedRegistry,
};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const CLIENT_GROUP: i64 = -1001111111111;
const TOPIC_CHAT: i64 = -1002222222222;
const OPS_CHAT: i64 = -1002816907697;

#[derive(Debug, Clone)]
struct SentMessage {
    channel_id: i64,
    text: String,
    thread_id: Option<i32>,
    keyboard: Option<Keyboard>,
    reference: i32,
}

/// Gateway that records every call
#[derive(Default)]
struct RecordingGateway {
    sent: Mutex<Vec<SentMessage>>,
    deleted: Mutex<Vec<(i64, i32)>>,
    acks: Mutex<Vec<(String, String)>>,
    fail_sends: AtomicBool,
    fail_deletes: AtomicBool,
    next_id: AtomicI32,
}

impl RecordingGateway {
    fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn deleted(&self) -> Vec<(i64, i32)> {
        self.deleted.lock().unwrap().clone()
    }

    fn acks(&self) -> Vec<(String, String)> {
        self.acks.lock().unwrap().clone()
    }

    fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    fn set_deletes_failing(&self, failing: bool) {
        self.fail_deletes.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessagingGateway for RecordingGateway {
    async fn send(
        &self,
        channel_id: i64,
        text: &str,
        thread_id: Option<i32>,
        keyboard: Option<Keyboard>,
    ) -> Result<i32, GatewayError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(GatewayError::SendFailed("network down".to_string()));
        }
        let reference = 9000 + self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(SentMessage {
            channel_id,
            text: text.to_string(),
            thread_id,
            keyboard,
            reference,
        });
        Ok(reference)
    }

    async fn delete(&self, channel_id: i64, message_id: i32) -> Result<(), GatewayError> {
        self.deleted.lock().unwrap().push((channel_id, message_id));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(GatewayError::DeleteFailed("message can't be deleted".to_string()));
        }
        Ok(())
    }

    async fn acknowledge(&self, callback_id: &str, text: &str) -> Result<(), GatewayError> {
        self.acks
            .lock()
            .unwrap()
            .push((callback_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn fetch_staff(&self, _channel_id: i64) -> Result<Vec<i64>, GatewayError> {
        Ok(vec![7, 8])
    }
}

/// Handler, scheduler and their shared state
struct TestEnvironment {
    gateway: Arc<RecordingGateway>,
    ledger: SharedLedger,
    registry: SharedRegistry,
    handler: ResolutionHandler,
    scheduler: ReminderScheduler,
}

impl TestEnvironment {
    fn new(ledger: Ledger) -> Self {
        Self::with_routing(ledger, RoutingTable::new(vec![RoutingEntry::new(TOPIC_CHAT, 2, "UK")]))
    }

    fn with_routing(ledger: Ledger, routing: RoutingTable) -> Self {
        let gateway = Arc::new(RecordingGateway::default());
        let dyn_gateway: Arc<dyn MessagingGateway> = gateway.clone();
        let ledger = ledger.shared();
        let registry = DestinationRegistry::in_memory().shared();
        let routing = Arc::new(routing);

        let operator = Arc::new(Operator::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&routing),
            Arc::clone(&dyn_gateway),
        ));
        let handler = ResolutionHandler::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&dyn_gateway),
            Arc::new(OrgMarker::new("globuz")),
        )
        .with_excluded_channel(Some(OPS_CHAT))
        .with_operator(operator);

        let scheduler = ReminderScheduler::new(
            SchedulerConfig {
                scan_interval: std::time::Duration::from_secs(30),
                reminder_delay: Duration::minutes(5),
                answered_retention: None,
            },
            Arc::clone(&ledger),
            routing,
            dyn_gateway,
        );

        Self {
            gateway,
            ledger,
            registry,
            handler,
            scheduler,
        }
    }

    async fn client_message(&self, id: i32, text: &str, at: DateTime<Utc>) -> Outcome {
        self.handler
            .handle(InboundEvent::NewMessage(group_message(id, "client42", text, None)), at)
            .await
    }

    async fn entry_status(&self, id: i32) -> Option<(EntryStatus, u32)> {
        self.ledger
            .lock()
            .await
            .find(id)
            .map(|e| (e.status, e.reminder_count))
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
}

fn group_message(id: i32, handle: &str, text: &str, reply_to: Option<i32>) -> NewMessage {
    NewMessage {
        channel_id: CLIENT_GROUP,
        channel_title: Some("Globuz Visa | #USA".to_string()),
        channel_kind: Some(ChatKind::Supergroup),
        message_id: id,
        sender_id: if handle.contains("globuz") { 7 } else { 42 },
        sender_handle: handle.to_string(),
        text: text.to_string(),
        reply_to_message_id: reply_to,
        from_self: false,
    }
}

#[tokio::test]
async fn test_first_reminder_after_delay() {
    let env = TestEnvironment::new(Ledger::in_memory());
    assert_eq!(env.client_message(100, "Need a UK visa", t0()).await, Outcome::Tracked(100));

    let report = env.scheduler.tick(t0() + Duration::minutes(4)).await;
    assert_eq!(report.sent, 0);
    assert!(env.gateway.sent().is_empty());

    let report = env.scheduler.tick(t0() + Duration::minutes(6)).await;
    assert_eq!(report.sent, 1);
    assert_eq!(env.entry_status(100).await, Some((EntryStatus::Pending, 1)));

    let sent = env.gateway.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.contains("reminder #1"));
    assert!(sent[0].keyboard.is_some());
}

#[tokio::test]
async fn test_body_keyword_routes_to_topic() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Need a UK visa", t0()).await;
    env.scheduler.tick(t0() + Duration::minutes(6)).await;

    let sent = env.gateway.sent();
    assert_eq!(sent[0].channel_id, TOPIC_CHAT);
    assert_eq!(sent[0].thread_id, Some(2));
    assert!(sent[0].text.contains("Topic: UK"));
}

#[tokio::test]
async fn test_unresolved_falls_back_to_origin() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Hello, anyone there?", t0()).await;
    env.scheduler.tick(t0() + Duration::minutes(6)).await;

    let sent = env.gateway.sent();
    assert_eq!(sent[0].channel_id, CLIENT_GROUP);
    assert_eq!(sent[0].thread_id, None);
    assert!(sent[0].text.contains("Topic: unresolved"));
}

#[tokio::test]
async fn test_title_keyword_routes_when_body_has_none() {
    let routing = RoutingTable::new(vec![
        RoutingEntry::new(TOPIC_CHAT, 2, "UK"),
        RoutingEntry::new(TOPIC_CHAT, 5, "USA"),
    ]);
    let env = TestEnvironment::with_routing(Ledger::in_memory(), routing);
    env.client_message(100, "Hello, anyone there?", t0()).await;
    env.scheduler.tick(t0() + Duration::minutes(6)).await;

    let sent = env.gateway.sent();
    assert_eq!(sent[0].thread_id, Some(5));
}

#[tokio::test]
async fn test_failed_send_is_retried_next_scan() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Need a UK visa", t0()).await;

    env.gateway.set_failing(true);
    let report = env.scheduler.tick(t0() + Duration::minutes(6)).await;
    assert_eq!(report.failed, 1);
    assert_eq!(env.entry_status(100).await, Some((EntryStatus::Pending, 0)));

    env.gateway.set_failing(false);
    let report = env.scheduler.tick(t0() + Duration::minutes(7)).await;
    assert_eq!(report.sent, 1);
    assert_eq!(env.entry_status(100).await, Some((EntryStatus::Pending, 1)));
}

#[tokio::test]
async fn test_repeat_reminder_replaces_previous() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Need a UK visa", t0()).await;

    env.scheduler.tick(t0() + Duration::minutes(6)).await;
    env.scheduler.tick(t0() + Duration::minutes(8)).await;
    assert_eq!(env.gateway.sent().len(), 1);

    env.scheduler.tick(t0() + Duration::minutes(11)).await;
    let sent = env.gateway.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].text.contains("reminder #2"));
    assert_eq!(env.gateway.deleted(), vec![(TOPIC_CHAT, sent[0].reference)]);
    assert_eq!(env.entry_status(100).await, Some((EntryStatus::Pending, 2)));
}

#[tokio::test]
async fn test_staff_reply_to_reminder_resolves() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Need a UK visa", t0()).await;
    env.scheduler.tick(t0() + Duration::minutes(6)).await;
    let reminder = env.gateway.sent()[0].reference;

    let mut reply = group_message(200, "globuz_anna", "On it", Some(reminder));
    reply.channel_id = TOPIC_CHAT;
    let outcome = env
        .handler
        .handle(InboundEvent::NewMessage(reply), t0() + Duration::minutes(7))
        .await;

    assert_eq!(outcome, Outcome::Resolved { message_id: 100, retracted: 1 });
    assert_eq!(env.gateway.deleted(), vec![(TOPIC_CHAT, reminder)]);
    {
        let ledger = env.ledger.lock().await;
        let entry = ledger.find(100).unwrap();
        assert_eq!(entry.status, EntryStatus::Answered);
        assert_eq!(entry.resolved_by, Some(7));
        assert!(entry.notification_refs.is_empty());
    }

    let report = env.scheduler.tick(t0() + Duration::hours(2)).await;
    assert_eq!(report.due, 0);
    assert_eq!(env.gateway.sent().len(), 1);
}

#[tokio::test]
async fn test_failed_retraction_still_resolves() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Need a UK visa", t0()).await;
    env.scheduler.tick(t0() + Duration::minutes(6)).await;
    let reminder = env.gateway.sent()[0].reference;

    env.gateway.set_deletes_failing(true);
    let mut reply = group_message(200, "globuz_anna", "On it", Some(reminder));
    reply.channel_id = TOPIC_CHAT;
    let outcome = env
        .handler
        .handle(InboundEvent::NewMessage(reply), t0() + Duration::minutes(7))
        .await;

    assert_eq!(outcome, Outcome::Resolved { message_id: 100, retracted: 1 });
    assert_eq!(env.gateway.deleted(), vec![(TOPIC_CHAT, reminder)]);
    let ledger = env.ledger.lock().await;
    let entry = ledger.find(100).unwrap();
    assert_eq!(entry.status, EntryStatus::Answered);
    assert!(entry.notification_refs.is_empty());
}

#[tokio::test]
async fn test_failed_superseded_delete_keeps_new_reminder() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Need a UK visa", t0()).await;
    env.scheduler.tick(t0() + Duration::minutes(6)).await;

    env.gateway.set_deletes_failing(true);
    let report = env.scheduler.tick(t0() + Duration::minutes(11)).await;
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 0);

    let sent = env.gateway.sent();
    assert_eq!(env.gateway.deleted(), vec![(TOPIC_CHAT, sent[0].reference)]);
    let ledger = env.ledger.lock().await;
    let entry = ledger.find(100).unwrap();
    assert_eq!(entry.reminder_count, 2);
    assert!(entry.has_notification_ref(TOPIC_CHAT, sent[1].reference));
}

#[tokio::test]
async fn test_staff_reply_to_original_resolves() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Need a UK visa", t0()).await;

    let reply = group_message(101, "GLOBUZ_support", "Sure", Some(100));
    let outcome = env
        .handler
        .handle(InboundEvent::NewMessage(reply), t0() + Duration::minutes(1))
        .await;

    assert_eq!(outcome, Outcome::Resolved { message_id: 100, retracted: 0 });
    assert_eq!(env.entry_status(100).await, Some((EntryStatus::Answered, 0)));
    // the staff reply itself is not tracked
    assert!(env.ledger.lock().await.find(101).is_none());
}

#[tokio::test]
async fn test_non_staff_reply_is_tracked() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Need a UK visa", t0()).await;

    let reply = group_message(101, "another_client", "Me too", Some(100));
    let outcome = env.handler.handle(InboundEvent::NewMessage(reply), t0()).await;

    assert_eq!(outcome, Outcome::Tracked(101));
    assert_eq!(env.entry_status(100).await, Some((EntryStatus::Pending, 0)));
}

#[tokio::test]
async fn test_staff_message_without_reply_is_ignored() {
    let env = TestEnvironment::new(Ledger::in_memory());
    let msg = group_message(100, "globuz_anna", "Good morning", None);
    let outcome = env.handler.handle(InboundEvent::NewMessage(msg), t0()).await;
    assert_eq!(outcome, Outcome::Ignored);
    assert!(env.ledger.lock().await.is_empty());
}

#[tokio::test]
async fn test_anonymous_admin_is_tracked_like_a_client() {
    let env = TestEnvironment::new(Ledger::in_memory());
    let msg = group_message(100, "GroupAnonymousBot", "Please send documents", Some(99));
    let outcome = env.handler.handle(InboundEvent::NewMessage(msg), t0()).await;
    assert_eq!(outcome, Outcome::Tracked(100));
    assert_eq!(env.entry_status(100).await, Some((EntryStatus::Pending, 0)));
}

#[tokio::test]
async fn test_excluded_channel_is_not_tracked() {
    let env = TestEnvironment::new(Ledger::in_memory());
    let mut msg = group_message(100, "client42", "Need a UK visa", None);
    msg.channel_id = OPS_CHAT;
    let outcome = env.handler.handle(InboundEvent::NewMessage(msg), t0()).await;
    assert_eq!(outcome, Outcome::Ignored);
    assert!(env.ledger.lock().await.is_empty());
}

#[tokio::test]
async fn test_own_messages_are_not_tracked() {
    let env = TestEnvironment::new(Ledger::in_memory());
    let mut msg = group_message(100, "escalation_bot", "⚠️ UNANSWERED MESSAGE", None);
    msg.from_self = true;
    let outcome = env.handler.handle(InboundEvent::NewMessage(msg), t0()).await;
    assert_eq!(outcome, Outcome::Ignored);
}

#[tokio::test]
async fn test_button_press_resolves_once() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Need a UK visa", t0()).await;
    env.scheduler.tick(t0() + Duration::minutes(6)).await;
    let reminder = env.gateway.sent()[0].reference;

    let press = |id: &str| {
        InboundEvent::ButtonPress(ButtonPress {
            callback_id: id.to_string(),
            presser_id: 8,
            presser_handle: "globuz_bob".to_string(),
            payload: ButtonAction::MarkAnswered(100).encode(),
        })
    };

    let outcome = env.handler.handle(press("cb-1"), t0() + Duration::minutes(7)).await;
    assert_eq!(outcome, Outcome::Resolved { message_id: 100, retracted: 1 });
    assert_eq!(env.gateway.deleted(), vec![(TOPIC_CHAT, reminder)]);

    let outcome = env.handler.handle(press("cb-2"), t0() + Duration::minutes(8)).await;
    assert_eq!(outcome, Outcome::Ignored);
    assert_eq!(env.gateway.deleted().len(), 1);

    let acks = env.gateway.acks();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0], ("cb-1".to_string(), "✅ Marked as answered!".to_string()));
    assert_eq!(acks[1].1, "This message was already answered.");

    let ledger = env.ledger.lock().await;
    assert_eq!(ledger.find(100).unwrap().resolved_by, Some(8));
}

#[tokio::test]
async fn test_button_press_for_unknown_message() {
    let env = TestEnvironment::new(Ledger::in_memory());
    let press = ButtonPress {
        callback_id: "cb-1".to_string(),
        presser_id: 8,
        presser_handle: "globuz_bob".to_string(),
        payload: "answered:404".to_string(),
    };
    let outcome = env.handler.handle(InboundEvent::ButtonPress(press), t0()).await;
    assert_eq!(outcome, Outcome::Ignored);
    assert_eq!(env.gateway.acks()[0].1, "Message not found.");
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("pending_messages.json");

    let before = {
        let env = TestEnvironment::new(Ledger::open(&path));
        env.client_message(100, "Need a UK visa", t0()).await;
        env.client_message(101, "Never reminded", t0() + Duration::minutes(3)).await;
        env.scheduler.tick(t0() + Duration::minutes(6)).await;
        let ledger = env.ledger.lock().await;
        ledger.all()
    };
    assert_eq!(before.len(), 2);
    assert!(before.iter().any(|e| e.last_reminder_at.is_none()));

    let reopened = Ledger::open(&path);
    assert_eq!(reopened.all(), before);
}

#[tokio::test]
async fn test_membership_changes_update_registry() {
    let env = TestEnvironment::new(Ledger::in_memory());
    let change = |status| {
        InboundEvent::MembershipChanged(MembershipChanged {
            channel_id: CLIENT_GROUP,
            channel_title: "Globuz Visa | #USA".to_string(),
            channel_kind: ChatKind::Supergroup,
            new_status: status,
        })
    };

    let outcome = env.handler.handle(change(MembershipStatus::Present), t0()).await;
    assert_eq!(outcome, Outcome::Registry);
    assert!(env.registry.read().await.get(CLIENT_GROUP).unwrap().is_active);

    // let the spawned administrator lookup finish
    for _ in 0..50 {
        if !env.registry.read().await.get(CLIENT_GROUP).unwrap().staff_ids.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(env.registry.read().await.get(CLIENT_GROUP).unwrap().staff_ids.len(), 2);

    env.handler.handle(change(MembershipStatus::Removed), t0()).await;
    let registry = env.registry.read().await;
    let record = registry.get(CLIENT_GROUP).unwrap();
    assert!(!record.is_active);
    assert_eq!(record.title, "Globuz Visa | #USA");
}

#[tokio::test]
async fn test_operator_commands_for_staff_only() {
    let env = TestEnvironment::new(Ledger::in_memory());
    env.client_message(100, "Need a UK visa", t0()).await;

    let private = |handle: &str, text: &str| {
        InboundEvent::NewMessage(NewMessage {
            channel_id: 7,
            channel_title: None,
            channel_kind: None,
            message_id: 1,
            sender_id: 7,
            sender_handle: handle.to_string(),
            text: text.to_string(),
            reply_to_message_id: None,
            from_self: false,
        })
    };

    let outcome = env.handler.handle(private("client42", "/stats"), t0()).await;
    assert_eq!(outcome, Outcome::Ignored);
    assert!(env.gateway.sent().is_empty());

    let outcome = env.handler.handle(private("globuz_anna", "/stats"), t0()).await;
    assert_eq!(outcome, Outcome::Command);
    let sent = env.gateway.sent();
    assert_eq!(sent[0].channel_id, 7);
    assert!(sent[0].text.contains("Unanswered messages: 1"));

    let outcome = env
        .handler
        .handle(private("globuz_anna", "/testreminder Need a UK visa"), t0())
        .await;
    assert_eq!(outcome, Outcome::Command);
    let sent = env.gateway.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[1].channel_id, TOPIC_CHAT);
    assert_eq!(sent[1].thread_id, Some(2));
    assert!(sent[2].text.contains("Test reminder sent"));
    // test reminders never touch the ledger
    assert_eq!(env.ledger.lock().await.len(), 1);
}
