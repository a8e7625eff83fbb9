use anyhow::{Context, Result};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use flashsale::{CheckoutApp, Config};

// Macro for timestamped colored output during startup, before the
// subscriber takes over.
macro_rules! tprintln {
    ($($arg:tt)*) => {{
        println!("{} {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string().bright_black(),
            format!($($arg)*)
        );
    }};
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let once = std::env::args().any(|arg| arg == "--once");

    tprintln!(
        "{}",
        "═══════════════════════════════════════════════".bright_cyan().bold()
    );
    tprintln!(
        "{}",
        "  Flash-Sale Checkout - Expiry Reaper Worker".bright_cyan().bold()
    );
    tprintln!(
        "{}",
        "═══════════════════════════════════════════════".bright_cyan().bold()
    );

    let config = Config::load_default().context("failed to load config.json")?;
    tprintln!(
        "{} fast store: {}",
        "[CONFIG]".blue().bold(),
        config.fast_store_url.bright_white()
    );
    tprintln!(
        "{} hold TTL: {}",
        "[CONFIG]".blue().bold(),
        format!("{}s", config.hold_ttl_secs).bright_white()
    );
    tprintln!(
        "{} reaper: batch {}, budget {}s, cadence {}s",
        "[CONFIG]".blue().bold(),
        config.reaper_batch_size,
        config.reaper_max_runtime_secs,
        config.reaper_cadence_secs
    );

    let app = CheckoutApp::connect(config).await?;
    tprintln!("{} {}", "[INIT]".cyan().bold(), "stores connected".green());

    if once {
        let report = app.reaper.run_once().await?;
        tprintln!(
            "{} examined={} expired={} skipped={} failed={}",
            "[REAPER]".cyan().bold(),
            report.examined,
            report.expired,
            report.skipped,
            report.failed
        );
        // Per-hold failures never poison the exit code; only
        // framework-level errors (the `?` above) do.
        return Ok(());
    }

    app.reaper.run_forever().await;
    Ok(())
}
