//! Telegram integration
//!
//! `TelegramGateway` implements [`MessagingGateway`] on top of teloxide, and
//! `run_telegram_bot` wires everything together:
//! - Loads the ledger, registry and routing table from the data directory
//! - Starts the reminder scheduler
//! - Runs a long-polling dispatcher that turns updates into inbound events
//!
//! Uses explicit Dispatcher pattern for reliable message polling.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    dptree,
    error_handlers::LoggingErrorHandler,
    prelude::*,
    types::{
        Chat, ChatMemberUpdated, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ThreadId,
        Update,
    },
};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gateway::{
    ButtonPress, GatewayError, InboundEvent, Keyboard, MembershipChanged, MembershipStatus,
    MessagingGateway, NewMessage,
};
use crate::ledger::Ledger;
use crate::operator::Operator;
use crate::registry::{ChatKind, DestinationRegistry};
use crate::resolution::ResolutionHandler;
use crate::routing::RoutingTable;
use crate::scheduler::{ReminderScheduler, SchedulerConfig};
use crate::staff::OrgMarker;

/// Body recorded for messages without text or caption
const NON_TEXT_BODY: &str = "[non-text message]";

/// Gateway backed by the Telegram Bot API
#[derive(Clone)]
pub struct TelegramGateway {
    bot: Bot,
}

impl TelegramGateway {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn send(
        &self,
        channel_id: i64,
        text: &str,
        thread_id: Option<i32>,
        keyboard: Option<Keyboard>,
    ) -> Result<i32, GatewayError> {
        let mut request = self.bot.send_message(ChatId(channel_id), text);
        if let Some(thread) = thread_id {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        if let Some(rows) = keyboard {
            request = request.reply_markup(to_inline_keyboard(&rows));
        }

        let sent = request
            .await
            .map_err(|e| GatewayError::SendFailed(e.to_string()))?;
        Ok(sent.id.0)
    }

    async fn delete(&self, channel_id: i64, message_id: i32) -> Result<(), GatewayError> {
        self.bot
            .delete_message(ChatId(channel_id), MessageId(message_id))
            .await
            .map_err(|e| GatewayError::DeleteFailed(e.to_string()))?;
        Ok(())
    }

    async fn acknowledge(&self, callback_id: &str, text: &str) -> Result<(), GatewayError> {
        let mut request = self.bot.answer_callback_query(callback_id);
        if !text.is_empty() {
            request = request.text(text).show_alert(false);
        }
        request
            .await
            .map_err(|e| GatewayError::RequestFailed(e.to_string()))?;
        Ok(())
    }

    async fn fetch_staff(&self, channel_id: i64) -> Result<Vec<i64>, GatewayError> {
        let admins = self
            .bot
            .get_chat_administrators(ChatId(channel_id))
            .await
            .map_err(|e| GatewayError::RequestFailed(e.to_string()))?;
        Ok(admins
            .iter()
            .filter(|member| !member.user.is_bot)
            .map(|member| member.user.id.0 as i64)
            .collect())
    }
}

/// Convert keyboard rows to Telegram inline markup. Link buttons with an
/// unparsable URL are dropped.
pub fn to_inline_keyboard(rows: &Keyboard) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .filter_map(|button| match (&button.callback_data, &button.url) {
                    (Some(data), _) => Some(InlineKeyboardButton::callback(&button.text, data)),
                    (None, Some(url)) => match reqwest::Url::parse(url) {
                        Ok(url) => Some(InlineKeyboardButton::url(&button.text, url)),
                        Err(e) => {
                            warn!("Dropping button {:?} with bad URL {}: {}", button.text, url, e);
                            None
                        }
                    },
                    (None, None) => None,
                })
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect();
    InlineKeyboardMarkup::new(rows)
}

/// Kind of a chat the bot monitors; `None` for private chats and channels
fn chat_kind(chat: &Chat) -> Option<ChatKind> {
    if chat.is_supergroup() {
        Some(ChatKind::Supergroup)
    } else if chat.is_group() {
        Some(ChatKind::Group)
    } else {
        None
    }
}

/// Convert a Telegram message. `None` for messages without a sender and
/// for chats that are neither groups nor private.
pub fn new_message_event(msg: &Message, bot_id: UserId) -> Option<NewMessage> {
    let sender = msg.from.as_ref()?;
    let channel_kind = chat_kind(&msg.chat);
    if channel_kind.is_none() && !msg.chat.is_private() {
        return None;
    }

    Some(NewMessage {
        channel_id: msg.chat.id.0,
        channel_title: msg.chat.title().map(str::to_string),
        channel_kind,
        message_id: msg.id.0,
        sender_id: sender.id.0 as i64,
        sender_handle: sender.username.clone().unwrap_or_default(),
        text: msg
            .text()
            .or_else(|| msg.caption())
            .unwrap_or(NON_TEXT_BODY)
            .to_string(),
        reply_to_message_id: msg.reply_to_message().map(|reply| reply.id.0),
        from_self: sender.id == bot_id,
    })
}

/// Convert a button press; `None` when it carries no payload
pub fn button_press_event(query: &CallbackQuery) -> Option<ButtonPress> {
    let payload = query.data.clone()?;
    Some(ButtonPress {
        callback_id: query.id.clone(),
        presser_id: query.from.id.0 as i64,
        presser_handle: query.from.username.clone().unwrap_or_default(),
        payload,
    })
}

/// Convert a change of the bot's own membership in a group
pub fn membership_event(update: &ChatMemberUpdated) -> Option<MembershipChanged> {
    let channel_kind = chat_kind(&update.chat)?;
    let new_status = if update.new_chat_member.is_present() {
        MembershipStatus::Present
    } else {
        MembershipStatus::Removed
    };
    Some(MembershipChanged {
        channel_id: update.chat.id.0,
        channel_title: update.chat.title().unwrap_or("Unknown group").to_string(),
        channel_kind,
        new_status,
    })
}

/// Distribution key shared by every update, so the dispatcher handles them
/// one at a time in arrival order whatever chat they come from
pub fn sequential_key(_update: &Update) -> Option<()> {
    Some(())
}

/// Shared state for dispatcher endpoints
struct BotData {
    handler: ResolutionHandler,
    bot_id: UserId,
}

/// Run the escalation bot until Ctrl-C
pub async fn run_telegram_bot(config: Config) -> Result<()> {
    let token = config
        .bot_token
        .clone()
        .context("TELEGRAM_BOT_TOKEN must be set")?;

    tracing::info!("===========================================");
    tracing::info!("  Escalation Bot - Starting...");
    tracing::info!("===========================================");
    tracing::info!("Data directory: {:?}", config.data_dir);
    tracing::info!(
        "Reminder delay: {:?}, scan interval: {:?}",
        config.reminder_delay,
        config.scan_interval
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    let bot = Bot::new(token);

    // Verify bot token by calling getMe
    tracing::info!("Verifying bot token...");
    let me = match bot.get_me().await {
        Ok(me) => {
            tracing::info!(
                "Bot authenticated: @{} (ID: {})",
                me.username.as_deref().unwrap_or("unknown"),
                me.id
            );
            me
        }
        Err(e) => {
            tracing::error!("Failed to authenticate bot: {}", e);
            anyhow::bail!("Bot authentication failed: {}", e);
        }
    };

    // Delete any existing webhook to ensure polling works
    if let Err(e) = bot.delete_webhook().await {
        tracing::warn!("Failed to delete webhook: {} (continuing anyway)", e);
    }

    let ledger = Ledger::open(&config.pending_path()).shared();
    let registry = DestinationRegistry::open(&config.registry_path()).shared();
    let routing = Arc::new(RoutingTable::load(&config.routing_path()));
    tracing::info!("Routing table: {} entries", routing.len());

    let gateway: Arc<dyn MessagingGateway> = Arc::new(TelegramGateway::new(bot.clone()));

    let scheduler = Arc::new(ReminderScheduler::new(
        SchedulerConfig::from(&config),
        Arc::clone(&ledger),
        Arc::clone(&routing),
        Arc::clone(&gateway),
    ));
    let scheduler_handle = scheduler.start();

    let operator = Arc::new(Operator::new(
        Arc::clone(&ledger),
        Arc::clone(&registry),
        Arc::clone(&routing),
        Arc::clone(&gateway),
    ));
    let handler = ResolutionHandler::new(
        Arc::clone(&ledger),
        Arc::clone(&registry),
        Arc::clone(&gateway),
        Arc::new(OrgMarker::new(&config.staff_marker)),
    )
    .with_excluded_channel(config.staff_ops_chat_id)
    .with_operator(operator);

    let data = Arc::new(BotData {
        handler,
        bot_id: me.id,
    });

    let tree = dptree::entry()
        .branch(Update::filter_message().endpoint(message_handler))
        .branch(Update::filter_callback_query().endpoint(callback_handler))
        .branch(Update::filter_my_chat_member().endpoint(membership_handler));

    tracing::info!("Starting dispatcher with long polling...");

    Dispatcher::builder(bot, tree)
        .distribution_function(sequential_key)
        .dependencies(dptree::deps![data])
        .default_handler(|upd| async move {
            tracing::debug!("Unhandled update: {:?}", upd);
        })
        .error_handler(LoggingErrorHandler::with_custom_text(
            "Error in update handler",
        ))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::warn!("Dispatcher stopped");
    scheduler_handle.stop().await;
    ledger.lock().await.flush();
    registry.read().await.flush();
    Ok(())
}

async fn message_handler(msg: Message, data: Arc<BotData>) -> ResponseResult<()> {
    let Some(event) = new_message_event(&msg, data.bot_id) else {
        debug!("Skipping message {} in {}", msg.id.0, msg.chat.id.0);
        return Ok(());
    };
    let outcome = data
        .handler
        .handle(InboundEvent::NewMessage(event), Utc::now())
        .await;
    debug!("Message {} in {}: {:?}", msg.id.0, msg.chat.id.0, outcome);
    Ok(())
}

async fn callback_handler(bot: Bot, query: CallbackQuery, data: Arc<BotData>) -> ResponseResult<()> {
    let Some(event) = button_press_event(&query) else {
        bot.answer_callback_query(&query.id).await?;
        return Ok(());
    };
    info!("Callback query: user={}, data={}", event.presser_id, event.payload);
    data.handler
        .handle(InboundEvent::ButtonPress(event), Utc::now())
        .await;
    Ok(())
}

async fn membership_handler(update: ChatMemberUpdated, data: Arc<BotData>) -> ResponseResult<()> {
    if let Some(event) = membership_event(&update) {
        data.handler
            .handle(InboundEvent::MembershipChanged(event), Utc::now())
            .await;
    }
    Ok(())
}
