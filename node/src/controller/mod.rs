//! Drives one panel-managed node: keeps the engine and the limiter in sync with the panel and
//! runs the periodic reporting tasks.

mod report;
mod tasks;
mod user_diff;

#[cfg(test)]
mod mock;

pub use report::{OnlineReport, OnlineReportState};
pub use tasks::TaskIntervals;
pub use user_diff::{compare_user_list, membership_changes};

use crate::cert::CertManager;
use crate::config::NodeConfig;
use crate::engine::{AddUsersParams, ProxyEngine};
use crate::error::{NodeError, Result};
use crate::limiter::LimiterRegistry;
use crate::panel::{NodeInfo, PanelClient, Security, UserInfo};
use crate::task::{Clock, system_clock};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tasks::ControllerTasks;
use tracing::{debug, info, instrument};

/// State shared between the controller and its periodic tasks.
pub(crate) struct NodeState {
    config: NodeConfig,
    panel: Arc<dyn PanelClient>,
    engine: Arc<dyn ProxyEngine>,
    registry: Arc<LimiterRegistry>,
    cert: Option<Arc<dyn CertManager>>,
    tag: RwLock<String>,
    info: RwLock<Option<NodeInfo>>,
    users: RwLock<Vec<UserInfo>>,
    online_report: Mutex<OnlineReport>,
    /// uuid -> bytes moved since the dynamic speed limit last looked at the user
    traffic: Mutex<HashMap<String, u64>>,
}

impl NodeState {
    pub(crate) fn tag(&self) -> String {
        self.tag.read().clone()
    }

    fn users(&self) -> Vec<UserInfo> {
        self.users.read().clone()
    }

    fn build_node_tag(&self, info: &NodeInfo) -> String {
        match self.config.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("[{}]-{}:{}", self.config.api_host, info.node_type, info.id),
        }
    }

    fn wants_managed_cert(&self, info: &NodeInfo) -> bool {
        info.security == Security::Tls && self.config.cert.needs_renewal()
    }

    async fn ensure_cert(&self, tag: &str, info: &NodeInfo) -> Result<()> {
        if !self.wants_managed_cert(info) {
            return Ok(());
        }
        match &self.cert {
            Some(cert) => cert.request_cert(tag, &self.config.cert).await,
            None => {
                debug!("No certificate manager for {}, using the existing certificate", tag);
                Ok(())
            }
        }
    }

    /// Publish `info` and `users` as the node's current definition: fresh limiter, node and users
    /// registered with the engine.
    async fn install_node(&self, info: &NodeInfo, users: Vec<UserInfo>) -> Result<String> {
        let tag = self.build_node_tag(info);
        self.registry.add_limiter(&tag, &self.config.limit, &users);
        *self.tag.write() = tag.clone();
        *self.info.write() = Some(info.clone());
        *self.users.write() = users.clone();

        self.ensure_cert(&tag, info).await?;
        self.engine.add_node(&tag, info).await?;
        let added = self
            .engine
            .add_users(AddUsersParams {
                tag: &tag,
                users: &users,
                node_info: info,
            })
            .await?;
        info!("Node {} serving {} users", tag, added);
        Ok(tag)
    }
}

pub struct Controller {
    state: Arc<NodeState>,
    clock: Clock,
    tasks: Mutex<Option<Arc<ControllerTasks>>>,
}

impl Controller {
    pub fn new(
        config: NodeConfig,
        panel: Arc<dyn PanelClient>,
        engine: Arc<dyn ProxyEngine>,
        registry: Arc<LimiterRegistry>,
        cert: Option<Arc<dyn CertManager>>,
    ) -> Self {
        Self {
            state: Arc::new(NodeState {
                config,
                panel,
                engine,
                registry,
                cert,
                tag: RwLock::new(String::new()),
                info: RwLock::new(None),
                users: RwLock::new(Vec::new()),
                online_report: Mutex::new(OnlineReport::default()),
                traffic: Mutex::new(HashMap::new()),
            }),
            clock: system_clock(),
            tasks: Mutex::new(None),
        }
    }

    /// Replace the wall clock the periodic tasks align to
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn tag(&self) -> String {
        self.state.tag()
    }

    pub fn node_info(&self) -> Option<NodeInfo> {
        self.state.info.read().clone()
    }

    pub fn users(&self) -> Vec<UserInfo> {
        self.state.users()
    }

    /// Fetch the node definition, bring the node up and start the periodic tasks.
    #[instrument(skip(self), fields(node_id = self.state.config.node_id))]
    pub async fn start(&self) -> Result<()> {
        let info = self
            .state
            .panel
            .fetch_node_info()
            .await?
            .ok_or_else(|| NodeError::Panel("panel returned no node info".to_string()))?;
        let users = self.state.panel.fetch_user_list().await?.unwrap_or_default();
        info!(
            "Node {} ({}) has {} users",
            info.id,
            info.node_type,
            users.len()
        );

        let tag = self.state.install_node(&info, users).await?;
        let tasks = tasks::start_tasks(&self.state, &info, self.clock.clone());
        *self.tasks.lock() = Some(tasks);
        info!("Controller for {} started", tag);
        Ok(())
    }

    /// Stop every task, then take the node down.
    pub async fn close(&self) -> Result<()> {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.close().await;
        }
        let tag = self.state.tag();
        self.state.registry.delete_limiter(&tag);
        self.state.engine.del_node(&tag).await?;
        info!("Controller for {} closed", tag);
        Ok(())
    }

    #[cfg(test)]
    fn tasks(&self) -> Option<Arc<ControllerTasks>> {
        self.tasks.lock().clone()
    }
}
