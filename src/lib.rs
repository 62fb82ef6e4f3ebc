//! Escalation Bot
//!
//! Watches Telegram support groups for client messages nobody has answered
//! and keeps reminding staff until someone does.
//!
//! # Features
//!
//! - **Ledger**: every client message is tracked until staff answer it
//! - **Reminders**: periodic scan, one reminder per delay, routed by keyword
//! - **Resolution**: staff reply or "Answered" button retracts all reminders
//! - **Registry**: monitored groups and their administrators
//! - **Snapshots**: plain JSON files, rewritten whole on every change
//!
//! # Architecture
//!
//! ```text
//! Telegram ──► Dispatcher ──► ResolutionHandler ──► Ledger ──► JSON
//!                                   │                  ▲
//!                                   ├── Registry       │
//!                                   └── Operator       │
//!                                                      │
//! ReminderScheduler (interval) ──► RoutingTable ──► Gateway ──► Telegram
//! ```

pub mod config;
pub mod gateway;
pub mod ledger;
pub mod operator;
pub mod registry;
pub mod resolution;
pub mod routing;
pub mod scheduler;
pub mod staff;
pub mod store;
pub mod telegram;

pub use config::Config;
pub use gateway::{
    ButtonAction, ButtonPress, GatewayError, InboundEvent, Keyboard, KeyboardButton,
    MembershipChanged, MembershipStatus, MessagingGateway, NewMessage,
};
pub use ledger::{EntryStatus, Ledger, LedgerError, LedgerStats, PendingEntry, SharedLedger};
pub use operator::Operator;
pub use registry::{ChatKind, DestinationRecord, DestinationRegistry, SharedRegistry};
pub use resolution::{Outcome, ResolutionHandler};
pub use routing::{Destination, RoutingEntry, RoutingTable};
pub use scheduler::{ReminderScheduler, SchedulerConfig, SchedulerHandle, TickReport};
pub use staff::{OrgMarker, StaffPredicate};
pub use store::{JsonSnapshot, StoreError};
