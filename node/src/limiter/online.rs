use super::{IpStatus, Limiter};
use crate::panel::OnlineUser;
use std::collections::HashMap;
use std::mem;
use tracing::{debug, trace};

impl Limiter {
    /// Turn this cycle's cumulative per-uid traffic into the online report.
    ///
    /// Returns the report and whether any uid's reported address differs from the previous
    /// cycle. Users whose traffic grew by no more than `min_traffic` since the last cycle are
    /// reported with an empty address and their online set is dropped, as are sets holding an
    /// address the panel disowns.
    pub fn get_online_device(
        &self,
        current_traffic: &HashMap<i64, u64>,
        min_traffic: u64,
    ) -> (Vec<OnlineUser>, bool) {
        let previous_traffic = mem::take(&mut *self.otraffic.lock());
        let previous_device = mem::take(&mut *self.online_device.lock());

        let tracked: Vec<_> = self
            .user_online_ip
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut online = Vec::new();
        let mut next_traffic = HashMap::new();
        let mut next_device = HashMap::new();
        let mut changed = false;
        let mut stale = Vec::new();

        for (key, ips) in tracked {
            let mut discard = false;
            let mut idle = false;
            for entry in ips.iter() {
                let (ip, uid) = (entry.key(), *entry.value());
                let current = current_traffic.get(&uid).copied().unwrap_or(0);
                // counters that went backwards were reset by the engine
                let delta = match previous_traffic.get(&uid) {
                    Some(&previous) => current.checked_sub(previous).unwrap_or(current),
                    None => current,
                };
                let status = self
                    .ip_allowed
                    .get(ip)
                    .map_or(IpStatus::Unknown, |status| *status);
                if status == IpStatus::NotAlive {
                    discard = true;
                }
                idle = delta <= min_traffic;
                let reported = if idle { String::new() } else { ip.clone() };

                next_traffic.insert(uid, current);
                // one remembered address per uid: a user active from several addresses differs
                // from it on every cycle and is always reported as changed
                if previous_device.get(&uid) != Some(&reported) {
                    changed = true;
                }
                trace!("Online uid {} at {:?}, delta {}", uid, reported, delta);
                next_device.insert(uid, reported.clone());
                online.push(OnlineUser { uid, ip: reported });
            }
            if discard || idle {
                stale.push(key);
            }
        }

        for key in &stale {
            self.user_online_ip.remove(key);
        }
        if !stale.is_empty() {
            debug!("Cleared {} online ip sets on {}", stale.len(), self.tag);
        }

        *self.otraffic.lock() = next_traffic;
        *self.online_device.lock() = next_device;
        (online, changed)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::LimitConfig;
    use crate::limiter::{AliveIpSnapshot, Limiter};
    use crate::panel::{OnlineUser, UserInfo};
    use common::user_key;
    use std::collections::HashMap;
    use std::sync::Arc;

    const TAG: &str = "trojan-node-2";
    const THRESHOLD: u64 = 30_000;

    fn limiter(users: &[(i64, &str)]) -> (Limiter, Arc<AliveIpSnapshot>) {
        let users: Vec<UserInfo> = users
            .iter()
            .map(|&(id, uuid)| UserInfo {
                id,
                uuid: uuid.to_string(),
                speed_limit: 0,
                device_limit: 0,
            })
            .collect();
        let alive = Arc::new(AliveIpSnapshot::new());
        let limiter = Limiter::new(TAG, &LimitConfig::default(), &users, alive.clone());
        (limiter, alive)
    }

    fn online(uid: i64, ip: &str) -> OnlineUser {
        OnlineUser {
            uid,
            ip: ip.to_string(),
        }
    }

    #[test]
    fn active_user_is_reported_with_its_address() {
        let (limiter, _) = limiter(&[(1, "a")]);
        limiter.check_limit(&user_key(TAG, "a"), "10.0.0.1");

        let (users, changed) = limiter.get_online_device(&HashMap::from([(1, 100_000)]), THRESHOLD);

        assert_eq!(users, vec![online(1, "10.0.0.1")]);
        assert!(changed);
        assert_eq!(limiter.online_ip_count(&user_key(TAG, "a")), 1);
    }

    #[test]
    fn idle_user_is_blanked_and_its_set_cleared() {
        let (limiter, _) = limiter(&[(1, "a")]);
        limiter.check_limit(&user_key(TAG, "a"), "10.0.0.1");

        let (users, _) = limiter.get_online_device(&HashMap::from([(1, 500)]), THRESHOLD);

        assert_eq!(users, vec![online(1, "")]);
        assert_eq!(limiter.online_ip_count(&user_key(TAG, "a")), 0);
    }

    #[test]
    fn repeated_idle_cycle_is_unchanged() {
        let (limiter, _) = limiter(&[(1, "a")]);
        limiter.check_limit(&user_key(TAG, "a"), "10.0.0.1");
        let traffic = HashMap::from([(1, 10)]);

        let (_, first) = limiter.get_online_device(&traffic, THRESHOLD);
        let (users, second) = limiter.get_online_device(&traffic, THRESHOLD);

        assert!(first);
        assert!(users.is_empty());
        assert!(!second);
    }

    #[test]
    fn going_idle_is_a_change_then_settles() {
        let (limiter, _) = limiter(&[(1, "a")]);
        limiter.check_limit(&user_key(TAG, "a"), "10.0.0.1");
        let traffic = HashMap::from([(1, 90_000)]);

        let (_, first) = limiter.get_online_device(&traffic, THRESHOLD);
        // same cumulative total, so the delta is zero
        let (users, second) = limiter.get_online_device(&traffic, THRESHOLD);
        let (_, third) = limiter.get_online_device(&traffic, THRESHOLD);

        assert!(first);
        assert_eq!(users, vec![online(1, "")]);
        assert!(second);
        assert!(!third);
    }

    #[test]
    fn steady_traffic_from_same_address_is_unchanged() {
        let (limiter, _) = limiter(&[(1, "a")]);
        let key = user_key(TAG, "a");
        limiter.check_limit(&key, "10.0.0.1");
        limiter.get_online_device(&HashMap::from([(1, 100_000)]), THRESHOLD);

        limiter.check_limit(&key, "10.0.0.1");
        let (users, changed) = limiter.get_online_device(&HashMap::from([(1, 200_000)]), THRESHOLD);

        assert_eq!(users, vec![online(1, "10.0.0.1")]);
        assert!(!changed);
    }

    #[test]
    fn disowned_address_clears_the_whole_set() {
        let (limiter, alive) = limiter(&[(1, "a")]);
        let key = user_key(TAG, "a");
        limiter.check_limit(&key, "10.0.0.1");
        // the panel now knows the user from elsewhere, making 10.0.0.1 a stranger
        alive.replace(HashMap::from([(1, vec!["10.9.9.9".to_string()])]));
        limiter.check_limit(&key, "10.0.0.1");

        let (users, _) = limiter.get_online_device(&HashMap::from([(1, 100_000)]), THRESHOLD);

        assert_eq!(users, vec![online(1, "10.0.0.1")]);
        assert_eq!(limiter.online_ip_count(&key), 0);
    }

    #[test]
    fn counter_reset_counts_from_zero() {
        let (limiter, _) = limiter(&[(1, "a")]);
        let key = user_key(TAG, "a");
        limiter.check_limit(&key, "10.0.0.1");
        limiter.get_online_device(&HashMap::from([(1, 900_000)]), THRESHOLD);

        limiter.check_limit(&key, "10.0.0.1");
        let (users, _) = limiter.get_online_device(&HashMap::from([(1, 50_000)]), THRESHOLD);

        assert_eq!(users, vec![online(1, "10.0.0.1")]);
    }

    #[test]
    fn traffic_memory_is_kept_per_uid() {
        let (limiter, _) = limiter(&[(1, "a"), (2, "b")]);
        limiter.check_limit(&user_key(TAG, "a"), "10.0.0.1");
        limiter.check_limit(&user_key(TAG, "b"), "10.0.0.2");

        limiter.get_online_device(&HashMap::from([(1, 100_000), (2, 100)]), THRESHOLD);

        let traffic = limiter.otraffic.lock().clone();
        assert_eq!(traffic, HashMap::from([(1, 100_000), (2, 100)]));
        let devices = limiter.online_device.lock().clone();
        assert_eq!(devices.get(&1).map(String::as_str), Some("10.0.0.1"));
        assert_eq!(devices.get(&2).map(String::as_str), Some(""));
    }

    #[test]
    fn user_active_from_two_addresses_is_always_changed() {
        let (limiter, _) = limiter(&[(1, "a")]);
        limiter.check_limit(&user_key(TAG, "a"), "10.0.0.1");
        limiter.check_limit(&user_key(TAG, "a"), "10.0.0.2");

        for traffic in [100_000, 200_000, 300_000] {
            let (users, changed) =
                limiter.get_online_device(&HashMap::from([(1, traffic)]), THRESHOLD);
            assert_eq!(users.len(), 2);
            assert!(changed);
        }
        assert_eq!(limiter.online_ip_count(&user_key(TAG, "a")), 2);
    }
}
