use super::NodeState;
use crate::error::{NodeError, Result};
use crate::panel::{OnlineUser, UserTraffic, mbps_to_bps};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

const BYTES_PER_MB: u64 = 1_000_000;

/// Whether the last successful online report carried any users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnlineReportState {
    #[default]
    Idle,
    Active,
}

/// Decides when the online-device report goes to the panel.
///
/// Any Idle/Active transition is reported. While active the report is sent when the differ saw
/// a change, or when `heartbeat` has passed since the last report. While idle nothing is sent.
#[derive(Debug, Default)]
pub struct OnlineReport {
    state: OnlineReportState,
    last_report: Option<Instant>,
}

impl OnlineReport {
    pub fn state(&self) -> OnlineReportState {
        self.state
    }

    pub fn should_report(
        &self,
        has_users: bool,
        changed: bool,
        now: Instant,
        heartbeat: Duration,
    ) -> bool {
        match (self.state, has_users) {
            (OnlineReportState::Idle, false) => false,
            (OnlineReportState::Idle, true) | (OnlineReportState::Active, false) => true,
            (OnlineReportState::Active, true) => {
                changed
                    || self
                        .last_report
                        .is_none_or(|last| now.duration_since(last) >= heartbeat)
            }
        }
    }

    pub fn reported(&mut self, has_users: bool, now: Instant) {
        self.state = if has_users {
            OnlineReportState::Active
        } else {
            OnlineReportState::Idle
        };
        self.last_report = Some(now);
    }
}

/// Split the differ's output into the per-uid address lists and per-uid occurrence counts the
/// panel expects. Blank addresses count towards presence but are not listed.
pub(crate) fn group_online_users(
    online: &[OnlineUser],
) -> (HashMap<i64, Vec<String>>, HashMap<i64, usize>) {
    let mut ips: HashMap<i64, Vec<String>> = HashMap::new();
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for user in online {
        *counts.entry(user.uid).or_default() += 1;
        if !user.ip.is_empty() {
            ips.entry(user.uid).or_default().push(user.ip.clone());
        }
    }
    (ips, counts)
}

impl NodeState {
    /// Drain the engine's traffic counters and push the non-zero ones.
    #[instrument(skip(self), fields(tag = %self.tag()))]
    pub(super) async fn report_user_traffic(&self) -> Result<()> {
        let tag = self.tag();
        let users = self.users();
        let track_dynamic = self.config.limit.dynamic_speed_limit.enable;

        let traffic: Vec<UserTraffic> = {
            let mut accumulated = self.traffic.lock();
            users
                .iter()
                .filter_map(|user| {
                    let (upload, download) = self.engine.get_user_traffic(&tag, &user.uuid, true);
                    if upload == 0 && download == 0 {
                        return None;
                    }
                    if track_dynamic {
                        *accumulated.entry(user.uuid.clone()).or_default() +=
                            upload.saturating_add(download);
                    }
                    Some(UserTraffic {
                        uid: user.id,
                        upload,
                        download,
                    })
                })
                .collect()
        };

        if traffic.is_empty() {
            trace!("No user traffic to report");
            return Ok(());
        }
        self.panel.push_user_traffic(&traffic).await?;
        info!("Reported traffic of {} users", traffic.len());
        Ok(())
    }

    /// Run the online-device differ and push its result when the report policy asks for it.
    #[instrument(skip(self), fields(tag = %self.tag()))]
    pub(super) async fn report_online_ips(&self) -> Result<()> {
        let tag = self.tag();
        let limit = &self.config.limit;
        let current: HashMap<i64, u64> = self
            .users()
            .iter()
            .map(|user| {
                let (upload, download) = self.engine.get_user_traffic(&tag, &user.uuid, false);
                (user.id, upload.saturating_add(download))
            })
            .collect();

        let (online, changed) =
            self.registry
                .get_online_device(&tag, &current, limit.min_traffic_threshold)?;
        let has_users = !online.is_empty();
        let now = Instant::now();
        let due = self.online_report.lock().should_report(
            has_users,
            changed,
            now,
            limit.min_report_interval(),
        );
        if !due {
            trace!("Online devices unchanged, {} entries", online.len());
            return Ok(());
        }

        let (ips, counts) = group_online_users(&online);
        self.panel.push_online_users(&ips, &counts).await?;
        self.online_report.lock().reported(has_users, now);
        debug!(
            "Reported {} online entries for {} users",
            online.len(),
            counts.len()
        );
        Ok(())
    }

    #[instrument(skip(self), fields(tag = %self.tag()))]
    pub(super) async fn poll_alive_ips(&self) -> Result<()> {
        if let Some(alive) = self.panel.fetch_alive_ips().await? {
            debug!("Alive ips refreshed for {} users", alive.len());
            self.registry.alive_ips().replace(alive);
        }
        Ok(())
    }

    /// Put a temporary speed cap on users whose accumulated traffic crossed the threshold.
    #[instrument(skip(self), fields(tag = %self.tag()))]
    pub(super) async fn check_dynamic_speed_limit(&self) -> Result<()> {
        let config = &self.config.limit.dynamic_speed_limit;
        let threshold = config.traffic_mb.saturating_mul(BYTES_PER_MB);
        let Some(expire) = config.expiry_from(Utc::now()) else {
            return Err(NodeError::Configuration(format!(
                "dynamic_speed_limit.expire_minutes out of range: {}",
                config.expire_minutes
            )));
        };
        let heavy: Vec<String> = {
            let mut accumulated = self.traffic.lock();
            let heavy: Vec<String> = accumulated
                .iter()
                .filter(|(_, bytes)| **bytes >= threshold)
                .map(|(uuid, _)| uuid.clone())
                .collect();
            for uuid in &heavy {
                accumulated.remove(uuid);
            }
            heavy
        };
        if heavy.is_empty() {
            return Ok(());
        }

        let tag = self.tag();
        let limit = mbps_to_bps(config.speed_limit_mbps);
        for uuid in &heavy {
            match self
                .registry
                .update_dynamic_speed_limit(&tag, uuid, limit, expire)
            {
                Ok(()) => info!("Limited {} to {} bit/s until {}", uuid, limit, expire),
                Err(e) => warn!("Failed to limit {}: {}", uuid, e),
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tag = %self.tag()))]
    pub(super) async fn renew_cert(&self) -> Result<()> {
        let Some(cert) = &self.cert else {
            return Ok(());
        };
        cert.renew_cert(&self.tag(), &self.config.cert).await?;
        info!("Certificate renewed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::mock::{MockPanel, node_config, node_info, user};
    use crate::controller::Controller;
    use crate::engine::LocalEngine;
    use crate::limiter::{AliveIpSnapshot, LimiterRegistry};
    use crate::panel::UserInfo;
    use common::user_key;
    use std::sync::Arc;

    struct Fixture {
        panel: Arc<MockPanel>,
        engine: Arc<LocalEngine>,
        registry: Arc<LimiterRegistry>,
        controller: Controller,
    }

    impl Fixture {
        async fn new(configure: impl FnOnce(&mut crate::config::NodeConfig)) -> Self {
            let panel = Arc::new(MockPanel::default());
            panel.queue_node_info(node_info(60, 60));
            panel.queue_users(vec![user(1, "a"), user(2, "b")]);
            let engine = Arc::new(LocalEngine::new());
            let registry = Arc::new(LimiterRegistry::new(Arc::new(AliveIpSnapshot::new())));
            let mut config = node_config();
            configure(&mut config);
            let controller = Controller::new(
                config,
                panel.clone(),
                engine.clone(),
                registry.clone(),
                None,
            );
            // bring the node up without starting the periodic tasks
            let info = panel.next_node_info();
            let users = panel.next_users();
            controller.state.install_node(&info, users).await.unwrap();
            Self {
                panel,
                engine,
                registry,
                controller,
            }
        }

        fn state(&self) -> &NodeState {
            &self.controller.state
        }

        fn connect(&self, uuid: &str, ip: &str) {
            let tag = self.controller.tag();
            self.registry
                .check_limit(&tag, &user_key(&tag, uuid), ip)
                .unwrap();
        }

        fn traffic(&self, uuid: &str, bytes: u64) {
            self.engine
                .record_traffic(&self.controller.tag(), uuid, bytes, 0);
        }
    }

    #[test]
    fn idle_state_reports_only_when_users_appear() {
        let now = Instant::now();
        let heartbeat = Duration::from_secs(300);
        let mut report = OnlineReport::default();

        assert!(!report.should_report(false, false, now, heartbeat));
        assert!(report.should_report(true, false, now, heartbeat));
        report.reported(true, now);
        assert_eq!(report.state(), OnlineReportState::Active);

        // active and unchanged: only the heartbeat forces a report
        assert!(!report.should_report(true, false, now + Duration::from_secs(10), heartbeat));
        assert!(report.should_report(true, true, now + Duration::from_secs(10), heartbeat));
        assert!(report.should_report(true, false, now + heartbeat, heartbeat));

        // dropping to zero users is reported once
        assert!(report.should_report(false, false, now + Duration::from_secs(20), heartbeat));
        report.reported(false, now + Duration::from_secs(20));
        assert_eq!(report.state(), OnlineReportState::Idle);
        assert!(!report.should_report(false, false, now + heartbeat * 3, heartbeat));
    }

    #[test]
    fn grouping_counts_blank_entries_without_listing_them() {
        let online = vec![
            OnlineUser {
                uid: 1,
                ip: "1.1.1.1".to_string(),
            },
            OnlineUser {
                uid: 1,
                ip: "1.1.1.2".to_string(),
            },
            OnlineUser {
                uid: 2,
                ip: String::new(),
            },
        ];
        let (ips, counts) = group_online_users(&online);
        assert_eq!(ips.get(&1).map(Vec::len), Some(2));
        assert!(!ips.contains_key(&2));
        assert_eq!(counts, HashMap::from([(1, 2), (2, 1)]));
    }

    #[tokio::test]
    async fn traffic_report_drains_counters_and_skips_idle_users() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.traffic("a", 4_096);

        fixture.state().report_user_traffic().await.unwrap();
        fixture.state().report_user_traffic().await.unwrap();

        let pushed = fixture.panel.pushed_traffic();
        assert_eq!(
            pushed,
            vec![vec![UserTraffic {
                uid: 1,
                upload: 4_096,
                download: 0
            }]]
        );
    }

    #[tokio::test]
    async fn limit_change_keeps_unreported_traffic() {
        let fixture = Fixture::new(|_| {}).await;
        let tag = fixture.controller.tag();
        fixture
            .engine
            .record_traffic(&tag, "a", 5_000_000, 7_000_000);

        let faster = UserInfo {
            speed_limit: 50,
            ..user(1, "a")
        };
        fixture
            .state()
            .sync_users(vec![faster, user(2, "b")])
            .await
            .unwrap();
        fixture.state().report_user_traffic().await.unwrap();

        assert_eq!(
            fixture.panel.pushed_traffic(),
            vec![vec![UserTraffic {
                uid: 1,
                upload: 5_000_000,
                download: 7_000_000
            }]]
        );
        let limiter = fixture.registry.get_limiter(&tag).unwrap();
        assert_eq!(limiter.user_limit("a").unwrap().speed_limit, mbps_to_bps(50));
    }

    #[tokio::test]
    async fn online_report_follows_the_report_policy() {
        let fixture = Fixture::new(|_| {}).await;

        // nobody online yet: idle, nothing pushed
        fixture.state().report_online_ips().await.unwrap();
        assert!(fixture.panel.pushed_online().is_empty());

        fixture.connect("a", "10.0.0.1");
        fixture.traffic("a", 100_000);
        fixture.state().report_online_ips().await.unwrap();
        let pushed = fixture.panel.pushed_online();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, HashMap::from([(1, vec!["10.0.0.1".to_string()])]));
        assert_eq!(pushed[0].1, HashMap::from([(1, 1)]));

        // same address, enough new traffic, no change and no heartbeat yet
        fixture.connect("a", "10.0.0.1");
        fixture.traffic("a", 100_000);
        fixture.state().report_online_ips().await.unwrap();
        assert_eq!(fixture.panel.pushed_online().len(), 1);

        // user goes quiet and the set empties: the blanked entry is a change
        fixture.state().report_online_ips().await.unwrap();
        assert_eq!(fixture.panel.pushed_online().len(), 2);

        // nobody left: the transition to idle is reported once
        fixture.state().report_online_ips().await.unwrap();
        fixture.state().report_online_ips().await.unwrap();
        let pushed = fixture.panel.pushed_online();
        assert_eq!(pushed.len(), 3);
        assert!(pushed[2].1.is_empty());
    }

    #[tokio::test]
    async fn alive_poll_replaces_the_snapshot_only_on_new_data() {
        let fixture = Fixture::new(|_| {}).await;
        fixture
            .panel
            .queue_alive_ips(HashMap::from([(1, vec!["9.9.9.9".to_string()])]));

        fixture.state().poll_alive_ips().await.unwrap();
        fixture.state().poll_alive_ips().await.unwrap();

        let snapshot = fixture.registry.alive_ips().snapshot();
        assert_eq!(snapshot.get(&1), Some(&vec!["9.9.9.9".to_string()]));
    }

    #[tokio::test]
    async fn heavy_users_get_a_temporary_cap() {
        let fixture = Fixture::new(|config| {
            let dynamic = &mut config.limit.dynamic_speed_limit;
            dynamic.enable = true;
            dynamic.traffic_mb = 1;
            dynamic.speed_limit_mbps = 2;
            dynamic.expire_minutes = 10;
        })
        .await;
        fixture.traffic("a", 1_500_000);
        fixture.traffic("b", 10_000);

        fixture.state().report_user_traffic().await.unwrap();
        fixture.state().check_dynamic_speed_limit().await.unwrap();

        let limiter = fixture.registry.get_limiter(&fixture.controller.tag()).unwrap();
        let a = limiter.user_limit("a").unwrap();
        assert_eq!(a.dynamic_speed_limit, 2_000_000);
        assert!(a.expire_time > Utc::now().timestamp());
        assert_eq!(limiter.user_limit("b").unwrap().dynamic_speed_limit, 0);
        // the heavy user's accumulator starts over, the light one keeps counting
        let accumulated = fixture.state().traffic.lock().clone();
        assert_eq!(accumulated, HashMap::from([("b".to_string(), 10_000)]));
    }

    #[tokio::test]
    async fn unrepresentable_expiry_fails_without_losing_traffic() {
        let fixture = Fixture::new(|config| {
            let dynamic = &mut config.limit.dynamic_speed_limit;
            dynamic.enable = true;
            dynamic.traffic_mb = 1;
            dynamic.expire_minutes = u64::MAX;
        })
        .await;
        fixture.traffic("a", 1_500_000);
        fixture.state().report_user_traffic().await.unwrap();

        let result = fixture.state().check_dynamic_speed_limit().await;

        assert!(matches!(result, Err(NodeError::Configuration(_))));
        let accumulated = fixture.state().traffic.lock().clone();
        assert_eq!(accumulated, HashMap::from([("a".to_string(), 1_500_000)]));
    }
}
