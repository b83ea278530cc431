use crate::error::{NodeError, Result};
use crate::panel::{NodeInfo, UserInfo};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument};

pub struct AddUsersParams<'a> {
    pub tag: &'a str,
    pub users: &'a [UserInfo],
    pub node_info: &'a NodeInfo,
}

/// The proxy engine that owns packet forwarding for each node tag.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    async fn add_node(&self, tag: &str, info: &NodeInfo) -> Result<()>;

    async fn del_node(&self, tag: &str) -> Result<()>;

    /// Returns how many users were actually added
    async fn add_users(&self, params: AddUsersParams<'_>) -> Result<usize>;

    async fn del_users(&self, users: &[UserInfo], tag: &str) -> Result<()>;

    /// `(upload, download)` bytes. `reset` hands the counters over and zeroes them.
    fn get_user_traffic(&self, tag: &str, uuid: &str, reset: bool) -> (u64, u64);
}

#[derive(Default)]
struct TrafficCounter {
    upload: AtomicU64,
    download: AtomicU64,
}

struct NodeEntry {
    info: NodeInfo,
    users: DashMap<String, Arc<TrafficCounter>>,
}

/// In-process engine keeping node and user registrations plus per-user traffic counters that
/// the data path feeds through [`LocalEngine::record_traffic`].
#[derive(Default)]
pub struct LocalEngine {
    nodes: DashMap<String, Arc<NodeEntry>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, tag: &str) -> Result<Arc<NodeEntry>> {
        self.nodes
            .get(tag)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NodeError::Engine(format!("node {} is not running", tag)))
    }

    pub fn record_traffic(&self, tag: &str, uuid: &str, upload: u64, download: u64) {
        let Some(node) = self.nodes.get(tag).map(|e| e.value().clone()) else {
            return;
        };
        if let Some(counter) = node.users.get(uuid) {
            counter.upload.fetch_add(upload, Ordering::Relaxed);
            counter.download.fetch_add(download, Ordering::Relaxed);
        }
    }

    pub fn node_info(&self, tag: &str) -> Option<NodeInfo> {
        self.nodes.get(tag).map(|e| e.info.clone())
    }

    pub fn has_user(&self, tag: &str, uuid: &str) -> bool {
        self.nodes
            .get(tag)
            .is_some_and(|node| node.users.contains_key(uuid))
    }

    pub fn user_count(&self, tag: &str) -> usize {
        self.nodes.get(tag).map_or(0, |node| node.users.len())
    }
}

#[async_trait]
impl ProxyEngine for LocalEngine {
    #[instrument(skip(self, info))]
    async fn add_node(&self, tag: &str, info: &NodeInfo) -> Result<()> {
        if self.nodes.contains_key(tag) {
            return Err(NodeError::Engine(format!("node {} already exists", tag)));
        }
        self.nodes.insert(
            tag.to_string(),
            Arc::new(NodeEntry {
                info: info.clone(),
                users: DashMap::new(),
            }),
        );
        info!("Node {} added on port {}", tag, info.server_port);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn del_node(&self, tag: &str) -> Result<()> {
        if self.nodes.remove(tag).is_none() {
            debug!("Node {} was not running", tag);
        }
        Ok(())
    }

    async fn add_users(&self, params: AddUsersParams<'_>) -> Result<usize> {
        let node = self.node(params.tag)?;
        let mut added = 0;
        for user in params.users {
            if !node.users.contains_key(&user.uuid) {
                node.users
                    .insert(user.uuid.clone(), Arc::new(TrafficCounter::default()));
                added += 1;
            }
        }
        Ok(added)
    }

    async fn del_users(&self, users: &[UserInfo], tag: &str) -> Result<()> {
        let node = self.node(tag)?;
        for user in users {
            node.users.remove(&user.uuid);
        }
        Ok(())
    }

    fn get_user_traffic(&self, tag: &str, uuid: &str, reset: bool) -> (u64, u64) {
        let Some(node) = self.nodes.get(tag).map(|e| e.value().clone()) else {
            return (0, 0);
        };
        let Some(counter) = node.users.get(uuid).map(|c| c.value().clone()) else {
            return (0, 0);
        };
        if reset {
            (
                counter.upload.swap(0, Ordering::AcqRel),
                counter.download.swap(0, Ordering::AcqRel),
            )
        } else {
            (
                counter.upload.load(Ordering::Acquire),
                counter.download.load(Ordering::Acquire),
            )
        }
    }
}
