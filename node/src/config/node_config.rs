use crate::error::{NodeError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One panel-managed node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub api_host: String,
    pub api_key: String,
    pub node_id: i64,
    pub node_type: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Fixed node tag. When absent the tag is derived from the node info.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub limit: LimitConfig,

    #[serde(default)]
    pub cert: CertConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Node wide speed cap in Mbit/s, 0 = unlimited
    #[serde(default)]
    pub speed_limit_mbps: u64,

    /// Node wide device cap, 0 = unlimited
    #[serde(default)]
    pub device_limit: usize,

    /// Bytes a user must move within one online-IP cycle to count as active from an address
    #[serde(default = "default_min_traffic_threshold")]
    pub min_traffic_threshold: u64,

    /// Online users are re-reported at least this often even when nothing changed
    #[serde(default = "default_min_report_interval_secs")]
    pub min_report_interval_secs: u64,

    #[serde(default)]
    pub dynamic_speed_limit: DynamicSpeedLimitConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicSpeedLimitConfig {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "default_dynamic_periodic_secs")]
    pub periodic_secs: u64,

    /// Traffic within one period that triggers the temporary cap, in MB
    #[serde(default)]
    pub traffic_mb: u64,

    #[serde(default)]
    pub speed_limit_mbps: u64,

    #[serde(default)]
    pub expire_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertConfig {
    #[serde(default = "default_cert_mode")]
    pub cert_mode: String,

    #[serde(default)]
    pub cert_domain: String,

    #[serde(default)]
    pub email: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_min_traffic_threshold() -> u64 {
    30_000
}

fn default_min_report_interval_secs() -> u64 {
    300
}

fn default_dynamic_periodic_secs() -> u64 {
    60
}

fn default_cert_mode() -> String {
    "none".to_string()
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            speed_limit_mbps: 0,
            device_limit: 0,
            min_traffic_threshold: default_min_traffic_threshold(),
            min_report_interval_secs: default_min_report_interval_secs(),
            dynamic_speed_limit: DynamicSpeedLimitConfig::default(),
        }
    }
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            cert_mode: default_cert_mode(),
            cert_domain: String::new(),
            email: String::new(),
        }
    }
}

impl NodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_host.is_empty() {
            return Err(NodeError::Configuration("api_host is empty".to_string()));
        }
        if !self.api_host.starts_with("http://") {
            return Err(NodeError::Configuration(format!(
                "api_host must be an http:// url: {}",
                self.api_host
            )));
        }
        if self.api_key.is_empty() {
            return Err(NodeError::Configuration("api_key is empty".to_string()));
        }
        let dynamic = &self.limit.dynamic_speed_limit;
        if dynamic.enable && dynamic.expiry_from(Utc::now()).is_none() {
            return Err(NodeError::Configuration(format!(
                "dynamic_speed_limit.expire_minutes out of range: {}",
                dynamic.expire_minutes
            )));
        }
        Ok(())
    }
}

impl LimitConfig {
    pub fn min_report_interval(&self) -> Duration {
        Duration::from_secs(self.min_report_interval_secs)
    }
}

impl DynamicSpeedLimitConfig {
    /// Expiry of an override installed at `now`, `None` when it is not representable
    pub fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let minutes = i64::try_from(self.expire_minutes).ok()?;
        now.checked_add_signed(TimeDelta::try_minutes(minutes)?)
    }
}

impl CertConfig {
    /// Modes that manage certificates outside this process never get a renewal task.
    pub fn needs_renewal(&self) -> bool {
        !matches!(self.cert_mode.as_str(), "none" | "" | "file" | "self")
    }
}
