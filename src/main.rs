//! Escalation Bot - Entry Point
//!
//! Modes:
//! - Default: run the Telegram bot
//! - --check-config: print the resolved configuration and routing table
//! - --help / -h: usage

use escalation_bot::{Config, RoutingTable};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");
    let check_mode = args.iter().any(|a| a == "--check-config");

    if help_mode {
        println!("Escalation Bot v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: escalation-bot [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --check-config     Print configuration and routing table, then exit");
        println!("  --help, -h         Show this help");
        println!();
        println!("Environment variables:");
        println!("  TELEGRAM_BOT_TOKEN       Telegram bot token");
        println!("  ESCALATION_DATA_DIR      Directory for JSON files (default: .)");
        println!("  REMINDER_DELAY_SECS      Silence before a reminder (default: 600)");
        println!("  SCAN_INTERVAL_SECS       Ledger scan interval (default: 30)");
        println!("  STAFF_MARKER             Username marker for staff (default: globuz)");
        println!("  STAFF_OPS_CHAT_ID        Staff chat that is never tracked");
        println!("  ANSWERED_RETENTION_DAYS  Days to keep answered messages, 0 = forever (default: 30)");
        println!("  RUST_LOG                 trace|debug|info|warn|error (default: info)");
        println!("  LOG_FORMAT               json for JSON logs on stderr");
        return Ok(());
    }

    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let json_logs = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;

    if check_mode {
        print_config(&config);
        return Ok(());
    }

    info!("Escalation Bot v{}", env!("CARGO_PKG_VERSION"));
    escalation_bot::telegram::run_telegram_bot(config).await?;

    Ok(())
}

fn print_config(config: &Config) {
    println!("Escalation Bot v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Bot token:          {}", if config.bot_token.is_some() { "set" } else { "MISSING" });
    println!("Data directory:     {}", config.data_dir.display());
    println!("Reminder delay:     {}s", config.reminder_delay.as_secs());
    println!("Scan interval:      {}s", config.scan_interval.as_secs());
    println!("Staff marker:       {}", config.staff_marker);
    println!(
        "Staff ops chat:     {}",
        config
            .staff_ops_chat_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Answered retention: {} days", config.answered_retention_days);

    let routing = RoutingTable::load(&config.routing_path());
    println!();
    println!("Routing table ({}): {} entries", config.routing_path().display(), routing.len());
    for entry in routing.entries() {
        println!("  {:<20} -> chat {} thread {}", entry.keyword, entry.channel_id, entry.thread_id);
    }
}
