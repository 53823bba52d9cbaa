#![cfg(not(tarpaulin_include))]

use salesboard::app;
use salesboard::config::AppConfig;

/// Main entry point for the dashboard web server
///
/// Reads `.env` when present, initialises logging from `RUST_LOG` (default
/// `info`) and serves until the process is stopped.
///
/// # Returns
/// * `Result<(), Box<dyn std::error::Error>>` - Success or error object
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;
    log::info!(
        "starting salesboard with data in {} (lockout after {} failures for {}s)",
        config.data_dir.display(),
        config.limiter.max_attempts,
        config.limiter.cooldown.as_secs()
    );

    app::run(config).await
}
