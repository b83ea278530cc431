//! Per-node quota state and the connection admission decision.

mod alive_ips;
mod online;
mod registry;
mod user_limit;

pub use alive_ips::AliveIpSnapshot;
pub use registry::{LimiterRegistry, LimiterStore, RwLockStore};
pub use user_limit::{UserLimitInfo, determine_limit};

use crate::config::LimitConfig;
use crate::error::{NodeError, Result};
use crate::panel::{UserInfo, mbps_to_bps};
use chrono::{DateTime, Utc};
use common::{TokenBucket, current_timestamp, parse_user_key, user_key};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// How an address relates to the panel's alive-IP list for its user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpStatus {
    /// The panel has no alive addresses for the user
    Unknown,
    /// The panel lists this address as alive
    Alive,
    /// The panel lists other addresses, not this one
    NotAlive,
}

impl IpStatus {
    pub fn classify(ip: &str, alive_ips: &[String]) -> Self {
        if alive_ips.is_empty() {
            IpStatus::Unknown
        } else if alive_ips.iter().any(|alive| alive == ip) {
            IpStatus::Alive
        } else {
            IpStatus::NotAlive
        }
    }
}

/// Outcome of [`Limiter::check_limit`].
#[derive(Debug, Clone)]
pub enum Admission {
    /// Accept the connection, pacing it with the bucket when one is given
    Accepted(Option<TokenBucket>),
    Rejected,
}

impl Admission {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected)
    }

    pub fn bucket(&self) -> Option<&TokenBucket> {
        match self {
            Admission::Accepted(bucket) => bucket.as_ref(),
            Admission::Rejected => None,
        }
    }
}

struct ResolvedLimit {
    uid: i64,
    speed_limit: u64,
    device_limit: usize,
}

/// Quota state of one node tag.
///
/// Every per-user map is a `DashMap` so admission for unrelated users never contends; the
/// previous-cycle memory of the online-device differ sits behind its own mutexes because only
/// the differ touches it.
pub struct Limiter {
    tag: String,
    /// Node default, bits per second
    speed_limit: u64,
    device_limit: usize,
    alive_ips: Arc<AliveIpSnapshot>,
    user_limit_info: DashMap<String, UserLimitInfo>,
    uuid_to_uid: DashMap<String, i64>,
    /// user key -> (ip -> uid) seen during the current cycle
    user_online_ip: DashMap<String, Arc<DashMap<String, i64>>>,
    speed_limiter: DashMap<String, TokenBucket>,
    ip_allowed: DashMap<String, IpStatus>,
    /// uid -> address reported by the previous differ cycle
    online_device: Mutex<HashMap<i64, String>>,
    /// uid -> cumulative traffic observed by the previous differ cycle
    otraffic: Mutex<HashMap<i64, u64>>,
}

impl Limiter {
    pub fn new(
        tag: &str,
        config: &LimitConfig,
        users: &[UserInfo],
        alive_ips: Arc<AliveIpSnapshot>,
    ) -> Self {
        let limiter = Self {
            tag: tag.to_string(),
            speed_limit: mbps_to_bps(config.speed_limit_mbps),
            device_limit: config.device_limit,
            alive_ips,
            user_limit_info: DashMap::new(),
            uuid_to_uid: DashMap::new(),
            user_online_ip: DashMap::new(),
            speed_limiter: DashMap::new(),
            ip_allowed: DashMap::new(),
            online_device: Mutex::new(HashMap::new()),
            otraffic: Mutex::new(HashMap::new()),
        };
        for user in users {
            limiter.insert_user(user);
        }
        limiter
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn insert_user(&self, user: &UserInfo) {
        let info = UserLimitInfo {
            uid: user.id,
            speed_limit: mbps_to_bps(user.speed_limit),
            device_limit: user.device_limit,
            ..Default::default()
        };
        self.user_limit_info.insert(user_key(&self.tag, &user.uuid), info);
        self.uuid_to_uid.insert(user.uuid.clone(), user.id);
    }

    /// Apply a user-list diff. Online addresses and traffic memory are left alone so
    /// connections of untouched users are unaffected.
    pub fn update_user(&self, added: &[UserInfo], deleted: &[UserInfo]) {
        for user in deleted {
            self.user_limit_info.remove(&user_key(&self.tag, &user.uuid));
            self.uuid_to_uid.remove(&user.uuid);
        }
        for user in added {
            self.insert_user(user);
        }
    }

    /// Install a temporary speed cap (bits per second) lasting until `expire`.
    pub fn update_dynamic_speed_limit(
        &self,
        uuid: &str,
        limit: u64,
        expire: DateTime<Utc>,
    ) -> Result<()> {
        let key = user_key(&self.tag, uuid);
        let Some(uid) = self.uid(uuid) else {
            return Err(NodeError::UserNotFound(key));
        };
        // a record dropped by an earlier expiry is recreated for the known uid
        let mut info = self
            .user_limit_info
            .entry(key)
            .or_insert_with(|| UserLimitInfo {
                uid,
                ..Default::default()
            });
        info.dynamic_speed_limit = limit;
        info.expire_time = expire.timestamp();
        Ok(())
    }

    pub fn user_limit(&self, uuid: &str) -> Option<UserLimitInfo> {
        self.user_limit_info
            .get(&user_key(&self.tag, uuid))
            .map(|info| info.clone())
    }

    pub fn uid(&self, uuid: &str) -> Option<i64> {
        self.uuid_to_uid.get(uuid).map(|uid| *uid)
    }

    /// Addresses registered for the user during the current cycle
    pub fn online_ip_count(&self, key: &str) -> usize {
        self.user_online_ip.get(key).map_or(0, |ips| ips.len())
    }

    /// Decide whether a new connection for `key` from `ip` may proceed.
    ///
    /// Missing user records are not an error. A known uid without a record (its expired override
    /// was dropped) keeps the node defaults; a user unknown to the node gets the node speed
    /// default and no device cap.
    pub fn check_limit(&self, key: &str, ip: &str) -> Admission {
        let resolved = self.resolve_user_limit(key, current_timestamp());
        let (uid, user_speed, device_limit) = match &resolved {
            Some(r) => (
                Some(r.uid),
                r.speed_limit,
                determine_limit(self.device_limit, r.device_limit),
            ),
            None => match self.uid_for_key(key) {
                Some(uid) => (Some(uid), 0, self.device_limit),
                None => (None, 0, 0),
            },
        };

        let alive = self.alive_ips.snapshot();
        let alive_ips = uid
            .and_then(|uid| alive.get(&uid))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let status = IpStatus::classify(ip, alive_ips);
        self.ip_allowed.insert(ip.to_string(), status);

        // An address the panel has never seen cannot take a slot once the panel already
        // counts the user at the cap.
        if status == IpStatus::NotAlive && device_limit > 0 && device_limit <= alive_ips.len() {
            debug!(
                "Reject {} from {}: {} alive ips at device limit {}",
                key,
                ip,
                alive_ips.len(),
                device_limit
            );
            return Admission::Rejected;
        }

        if let Some(uid) = uid {
            let ips = self
                .user_online_ip
                .entry(key.to_string())
                .or_default()
                .value()
                .clone();
            if ips.insert(ip.to_string(), uid).is_none() {
                let distinct_ips = ips.len() + alive_ips.len();
                if status != IpStatus::Alive && device_limit > 0 && device_limit < distinct_ips {
                    ips.remove(ip);
                    debug!(
                        "Reject {} from {}: {} distinct ips over device limit {}",
                        key, ip, distinct_ips, device_limit
                    );
                    return Admission::Rejected;
                }
            }
        }

        let bytes_per_second = determine_limit(self.speed_limit, user_speed) / 8;
        if bytes_per_second == 0 {
            return Admission::Accepted(None);
        }
        let bucket = self
            .speed_limiter
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(bytes_per_second))
            .value()
            .clone();
        if bucket.rate() != bytes_per_second {
            bucket.set_rate(bytes_per_second);
        }
        Admission::Accepted(Some(bucket))
    }

    /// Read the user's limits, collapsing a lapsed dynamic override first.
    fn resolve_user_limit(&self, key: &str, now: i64) -> Option<ResolvedLimit> {
        let mut info = self.user_limit_info.get_mut(key)?;
        if !info.has_expired_override(now) {
            return Some(ResolvedLimit {
                uid: info.uid,
                speed_limit: info.current_speed_limit(),
                device_limit: info.device_limit,
            });
        }

        info.dynamic_speed_limit = 0;
        info.expire_time = 0;
        let resolved = ResolvedLimit {
            uid: info.uid,
            speed_limit: info.speed_limit,
            device_limit: info.device_limit,
        };
        let unrestricted = info.is_unrestricted();
        drop(info);

        debug!("Dynamic speed limit of {} expired", key);
        if unrestricted {
            self.user_limit_info
                .remove_if(key, |_, info| info.is_unrestricted());
        }
        Some(resolved)
    }

    fn uid_for_key(&self, key: &str) -> Option<i64> {
        let (_, uuid) = parse_user_key(key).ok()?;
        self.uid(uuid)
    }

    #[cfg(test)]
    fn bucket(&self, key: &str) -> Option<TokenBucket> {
        self.speed_limiter.get(key).map(|b| b.value().clone())
    }
}
