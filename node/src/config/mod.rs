mod agent_config;
mod node_config;

pub use agent_config::AgentConfig;
pub use node_config::{CertConfig, DynamicSpeedLimitConfig, LimitConfig, NodeConfig};
