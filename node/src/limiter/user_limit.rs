/// Per-user quota record. Speeds are in bits per second; 0 means "no cap from this source".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserLimitInfo {
    pub uid: i64,
    pub speed_limit: u64,
    pub device_limit: usize,
    pub dynamic_speed_limit: u64,
    /// Unix seconds at which the dynamic override lapses, 0 when none is installed
    pub expire_time: i64,
}

impl UserLimitInfo {
    pub fn has_expired_override(&self, now: i64) -> bool {
        self.expire_time != 0 && self.expire_time < now
    }

    /// Permanent limit combined with an active dynamic override
    pub fn current_speed_limit(&self) -> u64 {
        determine_limit(self.speed_limit, self.dynamic_speed_limit)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.speed_limit == 0 && self.device_limit == 0 && self.expire_time == 0
    }
}

/// Combine two caps where 0 means unlimited: a single non-zero side wins, otherwise the
/// tighter one does.
pub fn determine_limit<T: Ord + Copy + Default>(a: T, b: T) -> T {
    let zero = T::default();
    if a == zero || b == zero {
        a.max(b)
    } else {
        a.min(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determine_limit_treats_zero_as_unlimited() {
        assert_eq!(determine_limit(0u64, 0), 0);
        assert_eq!(determine_limit(0u64, 5), 5);
        assert_eq!(determine_limit(7u64, 0), 7);
        assert_eq!(determine_limit(7u64, 5), 5);
        assert_eq!(determine_limit(3usize, 9), 3);
    }

    #[test]
    fn override_expiry_is_strictly_after_deadline() {
        let info = UserLimitInfo {
            expire_time: 100,
            ..Default::default()
        };
        assert!(!info.has_expired_override(100));
        assert!(info.has_expired_override(101));
        assert!(!UserLimitInfo::default().has_expired_override(i64::MAX));
    }
}
