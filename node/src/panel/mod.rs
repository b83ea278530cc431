mod http_client;
mod types;

pub use http_client::HttpPanelClient;
pub use types::{
    AliveIps, DEFAULT_INTERVAL, NodeInfo, OnlineUser, Security, UserInfo, UserTraffic,
    mbps_to_bps,
};

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// The remote panel as seen by one node.
///
/// Fetches return `Ok(None)` when the panel signals that nothing changed since the last
/// successful fetch.
#[async_trait]
pub trait PanelClient: Send + Sync {
    async fn fetch_node_info(&self) -> Result<Option<NodeInfo>>;

    async fn fetch_user_list(&self) -> Result<Option<Vec<UserInfo>>>;

    async fn fetch_alive_ips(&self) -> Result<Option<AliveIps>>;

    async fn push_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()>;

    async fn push_online_users(
        &self,
        ips: &HashMap<i64, Vec<String>>,
        counts: &HashMap<i64, usize>,
    ) -> Result<()>;
}
