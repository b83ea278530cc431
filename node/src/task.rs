//! Fixed-delay periodic tasks whose runs can be phase-aligned to wall-clock boundaries.

use crate::error::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type Execute = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wall-clock time since the Unix epoch
pub type Clock = Arc<dyn Fn() -> Duration + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    })
}

/// Time left until the next multiple of `interval`. A clock already sitting on a boundary waits
/// a full interval.
pub fn align_delay(now: Duration, interval: Duration) -> Duration {
    let interval_nanos = interval.as_nanos();
    if interval_nanos == 0 {
        return Duration::ZERO;
    }
    let into_period = now.as_nanos() % interval_nanos;
    Duration::from_nanos((interval_nanos - into_period) as u64)
}

/// When the first run of a freshly started task happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDelay {
    Immediate,
    /// After one full interval
    Interval,
    /// On the next wall-clock multiple of the interval
    Aligned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Running,
}

struct TaskShared {
    name: String,
    interval: Mutex<Duration>,
    realign: AtomicBool,
    execute: Execute,
    clock: Clock,
}

impl TaskShared {
    fn delay_for(&self, start: StartDelay) -> Duration {
        let interval = *self.interval.lock();
        match start {
            StartDelay::Immediate => Duration::ZERO,
            StartDelay::Interval => interval,
            StartDelay::Aligned => align_delay((self.clock)(), interval),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A periodic job.
///
/// Runs are fixed-delay: each execution is followed by a sleep of the current interval, so one
/// task never overlaps itself. Cancellation only takes effect while the task sleeps, which lets
/// [`PeriodicTask::close`] hand back a task that is guaranteed idle.
pub struct PeriodicTask {
    shared: Arc<TaskShared>,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>, interval: Duration, execute: Execute) -> Self {
        Self::with_clock(name, interval, execute, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        interval: Duration,
        execute: Execute,
        clock: Clock,
    ) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                name: name.into(),
                interval: Mutex::new(interval),
                realign: AtomicBool::new(false),
                execute,
                clock,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn interval(&self) -> Duration {
        *self.shared.interval.lock()
    }

    pub fn state(&self) -> TaskState {
        match self.running.lock().as_ref() {
            Some(running) if !running.handle.is_finished() => TaskState::Running,
            _ => TaskState::Stopped,
        }
    }

    /// Spawn the task loop. Starting a running task does nothing.
    pub fn start(&self, start: StartDelay) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Task {} is already running", self.shared.name);
            return;
        }

        let cancel = CancellationToken::new();
        let shared = self.shared.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let first = shared.delay_for(start);
            Self::run(shared, token, first).await;
        });
        *running = Some(Running { cancel, handle });
    }

    /// Stop the loop and wait until it has exited. An execution in progress runs to completion.
    pub async fn close(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!("Task {} ended abnormally: {}", self.shared.name, e);
        }
        debug!("Task {} stopped", self.shared.name);
    }

    /// Stop, switch to `interval` and start again on the next boundary of the new interval.
    ///
    /// Awaits the running loop, so it must not be called from the task's own execution; use
    /// [`PeriodicTask::reschedule`] there.
    pub async fn restart_aligned(&self, interval: Duration) {
        self.close().await;
        *self.shared.interval.lock() = interval;
        self.shared.realign.store(false, Ordering::Release);
        info!(
            "Task {} restarted with interval {:?}",
            self.shared.name, interval
        );
        self.start(StartDelay::Aligned);
    }

    /// Switch to `interval` without stopping. The sleep after the current execution lands on the
    /// next boundary of the new interval instead of lasting one interval.
    pub fn reschedule(&self, interval: Duration) {
        *self.shared.interval.lock() = interval;
        self.shared.realign.store(true, Ordering::Release);
        info!(
            "Task {} rescheduled with interval {:?}",
            self.shared.name, interval
        );
    }

    async fn run(shared: Arc<TaskShared>, cancel: CancellationToken, first: Duration) {
        if !Self::sleep(&cancel, first).await {
            return;
        }
        loop {
            if let Err(e) = (shared.execute)().await {
                warn!("Task {} failed: {}", shared.name, e);
            }

            let interval = *shared.interval.lock();
            let delay = if shared.realign.swap(false, Ordering::AcqRel) {
                align_delay((shared.clock)(), interval)
            } else {
                interval
            };
            if !Self::sleep(&cancel, delay).await {
                return;
            }
        }
    }

    /// Returns `false` when cancelled
    async fn sleep(cancel: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    // a multiple of both 60 and 90, plus 15
    const BASE_SECS: u64 = 180_015;

    fn paused_clock(started: Instant) -> Clock {
        Arc::new(move || Duration::from_secs(BASE_SECS) + started.elapsed())
    }

    /// Records the elapsed second of every run and flags overlapping executions.
    struct Probe {
        runs: Arc<Mutex<Vec<u64>>>,
        overlapped: Arc<AtomicBool>,
    }

    fn probe(started: Instant, work: Duration) -> (Probe, Execute) {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let overlapped = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let execute: Execute = {
            let runs = runs.clone();
            let overlapped = overlapped.clone();
            Arc::new(move || {
                let runs = runs.clone();
                let overlapped = overlapped.clone();
                let in_flight = in_flight.clone();
                async move {
                    if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    runs.lock().push(started.elapsed().as_secs());
                    tokio::time::sleep(work).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            })
        };
        (Probe { runs, overlapped }, execute)
    }

    #[test]
    fn align_delay_waits_for_next_boundary() {
        let minute = Duration::from_secs(60);
        assert_eq!(align_delay(Duration::from_secs(125), minute), Duration::from_secs(55));
        assert_eq!(align_delay(Duration::from_secs(120), minute), minute);
        assert_eq!(
            align_delay(Duration::from_millis(59_500), minute),
            Duration::from_millis(500)
        );
        assert_eq!(align_delay(Duration::from_secs(7), Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_realigns_without_overlap() {
        let started = Instant::now();
        let (probe, execute) = probe(started, Duration::from_secs(2));
        let task = PeriodicTask::with_clock(
            "online-ip-report",
            Duration::from_secs(60),
            execute,
            paused_clock(started),
        );

        task.start(StartDelay::Aligned);
        assert_eq!(task.state(), TaskState::Running);

        // lands inside the run that started at 169
        tokio::time::sleep_until(started + Duration::from_secs(170)).await;
        task.restart_aligned(Duration::from_secs(90)).await;
        assert_eq!(task.interval(), Duration::from_secs(90));

        tokio::time::sleep_until(started + Duration::from_secs(440)).await;
        task.close().await;

        // 45 is the first minute boundary; 255 is the first 90s boundary after the run
        // in progress at 170 finished
        assert_eq!(*probe.runs.lock(), vec![45, 107, 169, 255, 347, 439]);
        assert!(!probe.overlapped.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_delays_are_honoured() {
        let started = Instant::now();
        let minute = Duration::from_secs(60);

        let (immediate, execute) = probe(started, Duration::ZERO);
        let immediate_task = PeriodicTask::new("immediate", minute, execute);
        let (delayed, execute) = probe(started, Duration::ZERO);
        let delayed_task = PeriodicTask::new("delayed", minute, execute);

        immediate_task.start(StartDelay::Immediate);
        delayed_task.start(StartDelay::Interval);
        tokio::time::sleep_until(started + Duration::from_secs(130)).await;
        immediate_task.close().await;
        delayed_task.close().await;

        assert_eq!(*immediate.runs.lock(), vec![0, 60, 120]);
        assert_eq!(*delayed.runs.lock(), vec![60, 120]);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_from_own_execution_realigns_next_sleep() {
        let started = Instant::now();
        let runs = Arc::new(Mutex::new(Vec::new()));
        let task = Arc::new_cyclic(|weak: &std::sync::Weak<PeriodicTask>| {
            let runs = runs.clone();
            let weak = weak.clone();
            let execute: Execute = Arc::new(move || {
                let runs = runs.clone();
                let weak = weak.clone();
                async move {
                    let mut runs = runs.lock();
                    runs.push(started.elapsed().as_secs());
                    if runs.len() == 1
                        && let Some(task) = weak.upgrade()
                    {
                        task.reschedule(Duration::from_secs(90));
                    }
                    Ok(())
                }
                .boxed()
            });
            PeriodicTask::with_clock(
                "node-monitor",
                Duration::from_secs(60),
                execute,
                paused_clock(started),
            )
        });

        task.start(StartDelay::Immediate);
        tokio::time::sleep_until(started + Duration::from_secs(260)).await;
        task.close().await;

        // first run at 0 (clock 180_015), realigned to 180_090, then every 90s
        assert_eq!(*runs.lock(), vec![0, 75, 165, 255]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_execution_keeps_the_schedule() {
        let calls = Arc::new(AtomicUsize::new(0));
        let execute: Execute = {
            let calls = calls.clone();
            Arc::new(move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(NodeError::Panel("unreachable".to_string()))
                }
                .boxed()
            })
        };
        let task = PeriodicTask::new("flaky", Duration::from_secs(10), execute);

        task.start(StartDelay::Immediate);
        tokio::time::sleep(Duration::from_secs(35)).await;
        task.close().await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_runs_one_loop() {
        let started = Instant::now();
        let (probe, execute) = probe(started, Duration::ZERO);
        let task = PeriodicTask::new("twice", Duration::from_secs(30), execute);

        task.start(StartDelay::Immediate);
        task.start(StartDelay::Immediate);
        tokio::time::sleep_until(started + Duration::from_secs(45)).await;
        task.close().await;
        task.close().await;

        assert_eq!(*probe.runs.lock(), vec![0, 30]);
    }
}
