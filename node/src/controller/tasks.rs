use super::{NodeState, compare_user_list, membership_changes};
use crate::cert::CERT_RENEW_INTERVAL;
use crate::engine::AddUsersParams;
use crate::error::Result;
use crate::panel::{DEFAULT_INTERVAL, NodeInfo, UserInfo};
use crate::task::{Clock, Execute, PeriodicTask, StartDelay};
use futures::FutureExt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, instrument};

/// Cadence of every periodic task, derived from the panel's push and pull intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskIntervals {
    pub node_monitor: Duration,
    pub online_ip_report: Duration,
    pub alive_ip_poll: Duration,
    pub user_report: Duration,
}

impl TaskIntervals {
    pub fn from_node(info: &NodeInfo) -> Self {
        let pull = non_zero(info.pull_interval);
        let push = non_zero(info.push_interval);
        Self {
            node_monitor: pull,
            online_ip_report: push,
            // polled just after the panel has digested the online report
            alive_ip_poll: push + Duration::from_secs(5),
            user_report: push * 4 + Duration::from_secs(1),
        }
    }
}

fn non_zero(interval: Duration) -> Duration {
    if interval.is_zero() {
        DEFAULT_INTERVAL
    } else {
        interval
    }
}

pub(crate) struct ControllerTasks {
    pub(crate) node_monitor: PeriodicTask,
    pub(crate) user_report: PeriodicTask,
    pub(crate) online_ip_report: PeriodicTask,
    pub(crate) alive_ip_poll: PeriodicTask,
    pub(crate) dynamic_speed_limit: Option<PeriodicTask>,
    pub(crate) cert_renew: Option<PeriodicTask>,
}

fn execute<F, Fut>(state: &Arc<NodeState>, job: F) -> Execute
where
    F: Fn(Arc<NodeState>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let state = state.clone();
    Arc::new(move || job(state.clone()).boxed())
}

pub(crate) fn start_tasks(
    state: &Arc<NodeState>,
    info: &NodeInfo,
    clock: Clock,
) -> Arc<ControllerTasks> {
    let intervals = TaskIntervals::from_node(info);
    let tag = state.tag();

    let tasks = Arc::new_cyclic(|tasks: &Weak<ControllerTasks>| {
        let monitor = {
            let tasks = tasks.clone();
            execute(state, move |state| {
                let tasks = tasks.clone();
                async move {
                    match tasks.upgrade() {
                        Some(tasks) => state.node_info_monitor(&tasks).await,
                        None => Ok(()),
                    }
                }
            })
        };

        let dynamic = &state.config.limit.dynamic_speed_limit;
        let dynamic_speed_limit = (dynamic.enable && dynamic.periodic_secs > 0).then(|| {
            PeriodicTask::with_clock(
                format!("{tag} dynamic-speed-limit"),
                Duration::from_secs(dynamic.periodic_secs),
                execute(state, |state| async move {
                    state.check_dynamic_speed_limit().await
                }),
                clock.clone(),
            )
        });

        let cert_renew = (state.wants_managed_cert(info) && state.cert.is_some()).then(|| {
            PeriodicTask::with_clock(
                format!("{tag} cert-renew"),
                CERT_RENEW_INTERVAL,
                execute(state, |state| async move { state.renew_cert().await }),
                clock.clone(),
            )
        });

        ControllerTasks {
            node_monitor: PeriodicTask::with_clock(
                format!("{tag} node-monitor"),
                intervals.node_monitor,
                monitor,
                clock.clone(),
            ),
            user_report: PeriodicTask::with_clock(
                format!("{tag} user-report"),
                intervals.user_report,
                execute(state, |state| async move {
                    state.report_user_traffic().await
                }),
                clock.clone(),
            ),
            online_ip_report: PeriodicTask::with_clock(
                format!("{tag} online-ip-report"),
                intervals.online_ip_report,
                execute(state, |state| async move { state.report_online_ips().await }),
                clock.clone(),
            ),
            alive_ip_poll: PeriodicTask::with_clock(
                format!("{tag} alive-ip-poll"),
                intervals.alive_ip_poll,
                execute(state, |state| async move { state.poll_alive_ips().await }),
                clock.clone(),
            ),
            dynamic_speed_limit,
            cert_renew,
        }
    });

    info!("Starting periodic tasks for {}: {:?}", tag, intervals);
    tasks.node_monitor.start(StartDelay::Aligned);
    tasks.user_report.start(StartDelay::Aligned);
    tasks.online_ip_report.start(StartDelay::Aligned);
    tasks.alive_ip_poll.start(StartDelay::Aligned);
    if let Some(task) = &tasks.dynamic_speed_limit {
        task.start(StartDelay::Interval);
    }
    if let Some(task) = &tasks.cert_renew {
        task.start(StartDelay::Interval);
    }
    tasks
}

impl ControllerTasks {
    fn intervals(&self) -> TaskIntervals {
        TaskIntervals {
            node_monitor: self.node_monitor.interval(),
            online_ip_report: self.online_ip_report.interval(),
            alive_ip_poll: self.alive_ip_poll.interval(),
            user_report: self.user_report.interval(),
        }
    }

    /// Move every task onto `intervals`, each restarting on a boundary of its new interval.
    /// Called from the node monitor's own execution, so the monitor is only rescheduled.
    async fn realign(&self, intervals: TaskIntervals) {
        let current = self.intervals();
        if current.node_monitor == intervals.node_monitor
            && current.online_ip_report == intervals.online_ip_report
        {
            return;
        }
        info!("Task intervals changed from {:?} to {:?}", current, intervals);
        self.online_ip_report
            .restart_aligned(intervals.online_ip_report)
            .await;
        self.alive_ip_poll
            .restart_aligned(intervals.alive_ip_poll)
            .await;
        self.user_report.restart_aligned(intervals.user_report).await;
        self.node_monitor.reschedule(intervals.node_monitor);
    }

    /// The node monitor goes first: it is the only task that restarts the others.
    pub(crate) async fn close(&self) {
        self.node_monitor.close().await;
        self.user_report.close().await;
        self.online_ip_report.close().await;
        self.alive_ip_poll.close().await;
        if let Some(task) = &self.dynamic_speed_limit {
            task.close().await;
        }
        if let Some(task) = &self.cert_renew {
            task.close().await;
        }
    }
}

impl NodeState {
    #[instrument(skip(self, tasks), fields(tag = %self.tag()))]
    async fn node_info_monitor(&self, tasks: &ControllerTasks) -> Result<()> {
        let new_info = self.panel.fetch_node_info().await?;
        let new_users = self.panel.fetch_user_list().await?;

        if let Some(info) = new_info {
            self.reload_node(&info, new_users).await?;
            tasks.realign(TaskIntervals::from_node(&info)).await;
            return Ok(());
        }
        match new_users {
            Some(users) => self.sync_users(users).await,
            None => Ok(()),
        }
    }

    /// The node definition changed: tear the node down and bring it back under a fresh limiter.
    async fn reload_node(&self, info: &NodeInfo, new_users: Option<Vec<UserInfo>>) -> Result<()> {
        let old_tag = self.tag();
        info!("Node {} changed, reloading", old_tag);
        self.engine.del_node(&old_tag).await?;
        self.traffic.lock().clear();

        let users = new_users.unwrap_or_else(|| self.users());
        if self.build_node_tag(info) != old_tag {
            self.registry.delete_limiter(&old_tag);
        }
        self.install_node(info, users).await?;
        Ok(())
    }

    /// Patch engine and limiter with the difference between the known and the new user list.
    pub(super) async fn sync_users(&self, new_users: Vec<UserInfo>) -> Result<()> {
        // an empty list is treated as a panel hiccup rather than "delete everyone"
        if new_users.is_empty() {
            return Ok(());
        }
        let tag = self.tag();
        let (deleted, added) = compare_user_list(&self.users(), &new_users);
        let (left, joined) = membership_changes(&deleted, &added);

        if !left.is_empty() {
            self.engine.del_users(&left, &tag).await?;
        }
        if !joined.is_empty() {
            let info = self.info.read().clone();
            if let Some(info) = info {
                self.engine
                    .add_users(AddUsersParams {
                        tag: &tag,
                        users: &joined,
                        node_info: &info,
                    })
                    .await?;
            }
        }
        if !added.is_empty() || !deleted.is_empty() {
            self.registry.update_user(&tag, &added, &deleted)?;
            let mut traffic = self.traffic.lock();
            for user in &left {
                traffic.remove(&user.uuid);
            }
            info!(
                "{} users left, {} users joined, {} limits changed on {}",
                left.len(),
                joined.len(),
                added.len() - joined.len(),
                tag
            );
        }
        *self.users.write() = new_users;
        Ok(())
    }
}
