use anyhow::{Context, Result};
use clap::Parser;
use node::config::AgentConfig;
use node::engine::LocalEngine;
use node::limiter::AliveIpSnapshot;
use node::panel::HttpPanelClient;
use node::{Controller, LimiterRegistry};
use std::sync::Arc;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "node-agent")]
#[command(about = "Node agent - panel-managed quota and reporting control plane", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "node.toml", env = "NODE_CONFIG")]
    config: String,

    /// Log level override
    #[arg(long, env = "NODE_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = AgentConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    if let Some(log_level) = args.log_level {
        cfg.log_level = log_level;
    }

    let _guard = node::telemetry::init_tracing(&cfg);
    info!("Starting node agent with {} nodes", cfg.nodes.len());

    let registry = Arc::new(LimiterRegistry::new(Arc::new(AliveIpSnapshot::new())));
    let engine = Arc::new(LocalEngine::new());

    let mut controllers = Vec::with_capacity(cfg.nodes.len());
    for node_cfg in &cfg.nodes {
        let panel = HttpPanelClient::new(node_cfg)
            .with_context(|| format!("Invalid panel settings for node {}", node_cfg.node_id))?;
        let controller = Controller::new(
            node_cfg.clone(),
            Arc::new(panel),
            engine.clone(),
            registry.clone(),
            None,
        );
        controller
            .start()
            .await
            .with_context(|| format!("Failed to start node {}", node_cfg.node_id))?;
        controllers.push(controller);
    }
    info!("Node agent started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    for controller in &controllers {
        if let Err(e) = controller.close().await {
            error!("Failed to close {}: {}", controller.tag(), e);
        }
    }
    info!("Node agent stopped");
    Ok(())
}
