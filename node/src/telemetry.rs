use crate::config::AgentConfig;
use tracing_appender::non_blocking::WorkerGuard;

/// Install the global subscriber. With the `console` feature and a configured port, a
/// tokio-console layer is stacked under the regular stdout logger.
pub fn init_tracing(config: &AgentConfig) -> Option<WorkerGuard> {
    #[cfg(feature = "console")]
    if let Some(port) = config.console_port {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        use tracing_subscriber::{EnvFilter, Layer, fmt};

        let console_layer = console_subscriber::ConsoleLayer::builder()
            .server_addr((std::net::Ipv4Addr::LOCALHOST, port))
            .spawn();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
        tracing_subscriber::registry()
            .with(console_layer)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_filter(filter),
            )
            .init();
        tracing::info!(
            "tokio-console enabled on 127.0.0.1:{} (connect with: tokio-console http://localhost:{})",
            port,
            port
        );
        return None;
    }

    #[cfg(not(feature = "console"))]
    if config.console_port.is_some() {
        eprintln!(
            "console_port is configured but node-agent is not built with --features console; tokio-console is disabled"
        );
    }

    common::init_tracing(
        config.log_dir.as_deref(),
        &config.log_file,
        &config.log_level,
    )
}
