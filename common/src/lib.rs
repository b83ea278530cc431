pub mod bandwidth;
pub mod error;
pub mod rate;

pub use bandwidth::TokenBucket;
pub use error::{CommonError, Result};
pub use rate::{PacketBuffer, PacketConn, RateLimitedPacketConn, RateLimitedStream};

use std::time::{SystemTime, UNIX_EPOCH};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const USER_KEY_SEPARATOR: char = '|';

pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Composite `(tag, uuid)` key used for every per-user record on a node.
pub fn user_key(tag: &str, uuid: &str) -> String {
    format!("{tag}{USER_KEY_SEPARATOR}{uuid}")
}

pub fn parse_user_key(key: &str) -> Result<(&str, &str)> {
    let mut parts = key.split(USER_KEY_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(tag), Some(uuid), None) => Ok((tag, uuid)),
        _ => Err(CommonError::InvalidUserKey(key.to_string())),
    }
}

pub fn init_tracing(log_dir: Option<&str>, log_file: &str, log_level: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if let Some(log_dir) = log_dir {
        let file_appender = tracing_appender::rolling::daily(log_dir, log_file);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_ansi(false),
            )
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_ansi(true),
            )
            .init();
        None
    }
}
