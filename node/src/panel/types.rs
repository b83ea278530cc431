use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// uid -> addresses the panel currently believes are legitimately online
pub type AliveIps = HashMap<i64, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub uuid: String,
    /// Mbit/s, 0 = inherit the node default
    #[serde(default)]
    pub speed_limit: u64,
    /// 0 = inherit the node default
    #[serde(default)]
    pub device_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    None,
    Tls,
    Reality,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: i64,
    pub node_type: String,
    pub server_port: u16,
    pub security: Security,
    pub push_interval: Duration,
    pub pull_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTraffic {
    pub uid: i64,
    pub upload: u64,
    pub download: u64,
}

/// One (user, address) occurrence of the online-device report. An empty `ip` marks a user that
/// is present but moved too little traffic to vouch for a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineUser {
    pub uid: i64,
    pub ip: String,
}

pub fn mbps_to_bps(mbps: u64) -> u64 {
    mbps.saturating_mul(1_000_000)
}
