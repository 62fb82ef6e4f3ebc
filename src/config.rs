//! Configuration management

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Bot configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token (required to run the bot)
    pub bot_token: Option<String>,

    /// Directory holding the JSON snapshots
    pub data_dir: PathBuf,

    /// Silence before the first reminder, and between reminders
    pub reminder_delay: Duration,

    /// How often the scheduler scans the ledger (never above `reminder_delay`)
    pub scan_interval: Duration,

    /// Handle marker that identifies staff
    pub staff_marker: String,

    /// Staff operations chat; messages there are never tracked
    pub staff_ops_chat_id: Option<i64>,

    /// Days to keep answered entries (0 = forever)
    pub answered_retention_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_token: None,
            data_dir: PathBuf::from("."),
            reminder_delay: Duration::from_secs(600),
            scan_interval: Duration::from_secs(30),
            staff_marker: "globuz".to_string(),
            staff_ops_chat_id: None,
            answered_retention_days: 30,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bot_token = lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.trim().is_empty());

        let data_dir = lookup("ESCALATION_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let reminder_delay = match lookup("REMINDER_DELAY_SECS") {
            Some(v) => Duration::from_secs(parse_number("REMINDER_DELAY_SECS", &v)?),
            None => defaults.reminder_delay,
        };
        if reminder_delay.is_zero() {
            bail!("REMINDER_DELAY_SECS must be greater than zero");
        }

        let mut scan_interval = match lookup("SCAN_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(parse_number("SCAN_INTERVAL_SECS", &v)?),
            None => defaults.scan_interval,
        };
        if scan_interval.is_zero() {
            bail!("SCAN_INTERVAL_SECS must be greater than zero");
        }
        if scan_interval > reminder_delay {
            warn!(
                "Scan interval {:?} exceeds reminder delay {:?}, clamping",
                scan_interval, reminder_delay
            );
            scan_interval = reminder_delay;
        }

        let staff_marker = lookup("STAFF_MARKER")
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(defaults.staff_marker);

        let staff_ops_chat_id = match lookup("STAFF_OPS_CHAT_ID") {
            Some(v) if !v.trim().is_empty() => Some(parse_number("STAFF_OPS_CHAT_ID", &v)?),
            _ => None,
        };

        let answered_retention_days = match lookup("ANSWERED_RETENTION_DAYS") {
            Some(v) => parse_number("ANSWERED_RETENTION_DAYS", &v)?,
            None => defaults.answered_retention_days,
        };

        Ok(Self {
            bot_token,
            data_dir,
            reminder_delay,
            scan_interval,
            staff_marker,
            staff_ops_chat_id,
            answered_retention_days,
        })
    }

    pub fn pending_path(&self) -> PathBuf {
        self.data_dir.join("pending_messages.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("groups.json")
    }

    pub fn routing_path(&self) -> PathBuf {
        self.data_dir.join("chat_config.json")
    }

    /// Reminder delay as a chrono duration for timestamp arithmetic
    pub fn reminder_delay_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.reminder_delay).unwrap_or_else(|_| chrono::Duration::days(365))
    }

    /// Cutoff age for answered entries, `None` when pruning is disabled
    pub fn answered_retention(&self) -> Option<chrono::Duration> {
        (self.answered_retention_days > 0)
            .then(|| chrono::Duration::days(i64::from(self.answered_retention_days)))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    match value.trim().parse() {
        Ok(v) => Ok(v),
        Err(_) => bail!("{} has an invalid value: {:?}", key, value),
    }
}
