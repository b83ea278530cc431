use super::{Admission, AliveIpSnapshot, Limiter};
use crate::config::LimitConfig;
use crate::error::{NodeError, Result};
use crate::panel::{OnlineUser, UserInfo};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Storage of the tag -> limiter map. Only whole limiters go in and out; nothing here ever
/// reaches into a limiter's own state.
pub trait LimiterStore: Send + Sync {
    /// Returns the limiter previously stored under `tag`
    fn insert(&self, tag: String, limiter: Arc<Limiter>) -> Option<Arc<Limiter>>;

    fn get(&self, tag: &str) -> Option<Arc<Limiter>>;

    fn remove(&self, tag: &str) -> Option<Arc<Limiter>>;
}

/// Single read-write lock over a plain map.
#[derive(Default)]
pub struct RwLockStore {
    limiters: RwLock<HashMap<String, Arc<Limiter>>>,
}

impl LimiterStore for RwLockStore {
    fn insert(&self, tag: String, limiter: Arc<Limiter>) -> Option<Arc<Limiter>> {
        self.limiters.write().insert(tag, limiter)
    }

    fn get(&self, tag: &str) -> Option<Arc<Limiter>> {
        self.limiters.read().get(tag).cloned()
    }

    fn remove(&self, tag: &str) -> Option<Arc<Limiter>> {
        self.limiters.write().remove(tag)
    }
}

/// Process-wide owner of every node's [`Limiter`].
pub struct LimiterRegistry<S: LimiterStore = RwLockStore> {
    store: S,
    alive_ips: Arc<AliveIpSnapshot>,
}

impl LimiterRegistry<RwLockStore> {
    pub fn new(alive_ips: Arc<AliveIpSnapshot>) -> Self {
        Self::with_store(RwLockStore::default(), alive_ips)
    }
}

impl<S: LimiterStore> LimiterRegistry<S> {
    pub fn with_store(store: S, alive_ips: Arc<AliveIpSnapshot>) -> Self {
        Self { store, alive_ips }
    }

    pub fn alive_ips(&self) -> &Arc<AliveIpSnapshot> {
        &self.alive_ips
    }

    /// Build a limiter for `tag` and publish it, replacing any previous one.
    pub fn add_limiter(&self, tag: &str, config: &LimitConfig, users: &[UserInfo]) -> Arc<Limiter> {
        let limiter = Arc::new(Limiter::new(tag, config, users, self.alive_ips.clone()));
        if self.store.insert(tag.to_string(), limiter.clone()).is_some() {
            info!("Replaced limiter for {}", tag);
        } else {
            info!("Added limiter for {} with {} users", tag, users.len());
        }
        limiter
    }

    pub fn get_limiter(&self, tag: &str) -> Result<Arc<Limiter>> {
        self.store
            .get(tag)
            .ok_or_else(|| NodeError::LimiterNotFound(tag.to_string()))
    }

    pub fn delete_limiter(&self, tag: &str) {
        if self.store.remove(tag).is_some() {
            info!("Deleted limiter for {}", tag);
        }
    }

    pub fn update_user(&self, tag: &str, added: &[UserInfo], deleted: &[UserInfo]) -> Result<()> {
        self.get_limiter(tag)?.update_user(added, deleted);
        Ok(())
    }

    pub fn update_dynamic_speed_limit(
        &self,
        tag: &str,
        uuid: &str,
        limit: u64,
        expire: DateTime<Utc>,
    ) -> Result<()> {
        self.get_limiter(tag)?
            .update_dynamic_speed_limit(uuid, limit, expire)
    }

    pub fn check_limit(&self, tag: &str, key: &str, ip: &str) -> Result<Admission> {
        Ok(self.get_limiter(tag)?.check_limit(key, ip))
    }

    pub fn get_online_device(
        &self,
        tag: &str,
        current_traffic: &HashMap<i64, u64>,
        min_traffic: u64,
    ) -> Result<(Vec<OnlineUser>, bool)> {
        Ok(self
            .get_limiter(tag)?
            .get_online_device(current_traffic, min_traffic))
    }
}
