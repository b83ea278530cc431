use crate::cert::CertManager;
use crate::config::{CertConfig, LimitConfig, NodeConfig};
use crate::error::Result;
use crate::panel::{AliveIps, NodeInfo, PanelClient, Security, UserInfo, UserTraffic};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn node_config() -> NodeConfig {
    NodeConfig {
        api_host: "http://127.0.0.1:8080".to_string(),
        api_key: "secret".to_string(),
        node_id: 7,
        node_type: "vless".to_string(),
        timeout_secs: 5,
        name: None,
        limit: LimitConfig::default(),
        cert: CertConfig::default(),
    }
}

pub fn node_info(push_secs: u64, pull_secs: u64) -> NodeInfo {
    NodeInfo {
        id: 7,
        node_type: "vless".to_string(),
        server_port: 443,
        security: Security::None,
        push_interval: Duration::from_secs(push_secs),
        pull_interval: Duration::from_secs(pull_secs),
    }
}

pub fn user(id: i64, uuid: &str) -> UserInfo {
    UserInfo {
        id,
        uuid: uuid.to_string(),
        speed_limit: 0,
        device_limit: 0,
    }
}

/// Panel answering from queues; an empty queue means "not modified".
#[derive(Default)]
pub struct MockPanel {
    node_info: Mutex<VecDeque<NodeInfo>>,
    users: Mutex<VecDeque<Vec<UserInfo>>>,
    alive_ips: Mutex<VecDeque<AliveIps>>,
    pushed_traffic: Mutex<Vec<Vec<UserTraffic>>>,
    pushed_online: Mutex<Vec<(HashMap<i64, Vec<String>>, HashMap<i64, usize>)>>,
}

impl MockPanel {
    pub fn queue_node_info(&self, info: NodeInfo) {
        self.node_info.lock().push_back(info);
    }

    pub fn queue_users(&self, users: Vec<UserInfo>) {
        self.users.lock().push_back(users);
    }

    pub fn queue_alive_ips(&self, alive: AliveIps) {
        self.alive_ips.lock().push_back(alive);
    }

    pub fn next_node_info(&self) -> NodeInfo {
        self.node_info.lock().pop_front().unwrap()
    }

    pub fn next_users(&self) -> Vec<UserInfo> {
        self.users.lock().pop_front().unwrap_or_default()
    }

    pub fn pushed_traffic(&self) -> Vec<Vec<UserTraffic>> {
        self.pushed_traffic.lock().clone()
    }

    pub fn pushed_online(&self) -> Vec<(HashMap<i64, Vec<String>>, HashMap<i64, usize>)> {
        self.pushed_online.lock().clone()
    }
}

#[async_trait]
impl PanelClient for MockPanel {
    async fn fetch_node_info(&self) -> Result<Option<NodeInfo>> {
        Ok(self.node_info.lock().pop_front())
    }

    async fn fetch_user_list(&self) -> Result<Option<Vec<UserInfo>>> {
        Ok(self.users.lock().pop_front())
    }

    async fn fetch_alive_ips(&self) -> Result<Option<AliveIps>> {
        Ok(self.alive_ips.lock().pop_front())
    }

    async fn push_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()> {
        self.pushed_traffic.lock().push(traffic.to_vec());
        Ok(())
    }

    async fn push_online_users(
        &self,
        ips: &HashMap<i64, Vec<String>>,
        counts: &HashMap<i64, usize>,
    ) -> Result<()> {
        self.pushed_online.lock().push((ips.clone(), counts.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockCert {
    requests: AtomicUsize,
    renewals: AtomicUsize,
}

impl MockCert {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertManager for MockCert {
    async fn request_cert(&self, _tag: &str, _config: &CertConfig) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn renew_cert(&self, _tag: &str, _config: &CertConfig) -> Result<()> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
