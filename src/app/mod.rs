pub mod config;
mod error;
pub mod history;
mod logging;
pub mod probe;
pub mod runtime;
pub mod services;

pub use error::AppError;

pub fn run() -> Result<(), AppError> {
    let env_file = dotenvy::dotenv().ok();
    logging::init()?;

    if let Some(path) = env_file {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }

    let config = config::AppConfig::from_env()?;

    tracing::info!(
        keba_ip = %config.keba_ip,
        keba_udp_port = config.keba_udp_port,
        db_path = %config.db_path,
        response_timeout_ms = config.response_timeout_ms,
        min_send_interval_ms = config.min_send_interval_ms,
        max_send_attempts = ?config.max_send_attempts,
        retry_backoff = ?config.retry_backoff,
        charging_poll_interval_s = config.charging_poll_interval_s,
        idle_poll_interval_s = config.idle_poll_interval_s,
        heartbeat_enabled = config.heartbeat_url.is_some(),
        debug_script = ?config.debug_script,
        "application bootstrap initialized"
    );

    runtime::run(config)
}
