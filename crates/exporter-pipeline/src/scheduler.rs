//! Fixed-interval scheduler with graceful shutdown.
//!
//! At most one run is in flight. A tick that fires while the previous run is
//! still going is logged and dropped, never queued.

use std::future::Future;
use std::time::Duration;

use exporter_config::ScheduleConfig;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::SchedulerError;

/// Counters reported when the scheduler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub runs_started: u64,
    pub ticks_skipped: u64,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    interval: Duration,
    shutdown_timeout: Duration,
    run_on_startup: bool,
}

impl Scheduler {
    pub fn new(interval: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            interval,
            shutdown_timeout,
            run_on_startup: true,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(config.interval, config.shutdown_timeout).with_run_on_startup(config.run_on_startup)
    }

    pub fn with_run_on_startup(mut self, run_on_startup: bool) -> Self {
        self.run_on_startup = run_on_startup;
        self
    }

    /// Run `job` every interval until `shutdown` resolves.
    ///
    /// On shutdown ticking stops and the in-flight run gets up to
    /// `shutdown_timeout` to finish; past that it is aborted and
    /// [`SchedulerError::ShutdownTimeout`] is returned.
    pub async fn run<F, Fut, S>(&self, mut job: F, shutdown: S) -> Result<SchedulerStats, SchedulerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()>,
    {
        let first = if self.run_on_startup {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = tokio::time::interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval = %humantime::format_duration(self.interval),
            run_on_startup = self.run_on_startup,
            "scheduler started"
        );

        tokio::pin!(shutdown);
        let mut stats = SchedulerStats::default();
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("shutdown requested; no further runs will start");
                    break;
                }
                _ = ticker.tick() => {
                    if let Some(handle) = &in_flight
                        && !handle.is_finished()
                    {
                        warn!("previous export run still in flight; skipping tick");
                        stats.ticks_skipped += 1;
                        continue;
                    }
                    if let Some(handle) = in_flight.take() {
                        reap(handle).await;
                    }
                    stats.runs_started += 1;
                    in_flight = Some(tokio::spawn(job()));
                }
            }
        }

        if let Some(mut handle) = in_flight {
            if !handle.is_finished() {
                info!(
                    timeout = %humantime::format_duration(self.shutdown_timeout),
                    "waiting for in-flight export run"
                );
            }
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "export run task failed"),
                Err(_) => {
                    handle.abort();
                    error!(
                        timeout = %humantime::format_duration(self.shutdown_timeout),
                        "export run did not finish before shutdown timeout"
                    );
                    return Err(SchedulerError::ShutdownTimeout {
                        timeout: self.shutdown_timeout,
                    });
                }
            }
        }

        info!(
            runs_started = stats.runs_started,
            ticks_skipped = stats.ticks_skipped,
            "scheduler stopped"
        );
        Ok(stats)
    }
}

async fn reap(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(error = %e, "export run task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn sleep_ms(ms: u64) -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_runs_on_startup() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let scheduler = Scheduler::new(Duration::from_secs(3600), Duration::from_secs(1));

        let stats = scheduler
            .run(
                move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                },
                sleep_ms(50),
            )
            .await
            .unwrap();

        assert_eq!(stats.runs_started, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waits_for_first_interval_when_not_on_startup() {
        let scheduler = Scheduler::new(Duration::from_secs(3600), Duration::from_secs(1))
            .with_run_on_startup(false);

        let stats = scheduler.run(|| async {}, sleep_ms(30)).await.unwrap();
        assert_eq!(stats.runs_started, 0);
    }

    #[tokio::test]
    async fn test_overlapping_ticks_are_dropped() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let (a, m) = (active.clone(), max_active.clone());

        let scheduler = Scheduler::new(Duration::from_millis(20), Duration::from_secs(1));
        let stats = scheduler
            .run(
                move || {
                    let (active, max_active) = (a.clone(), m.clone());
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(70)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                },
                sleep_ms(200),
            )
            .await
            .unwrap();

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(stats.ticks_skipped >= 1, "{stats:?}");
        assert!(stats.runs_started >= 2, "{stats:?}");
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_run() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let scheduler = Scheduler::new(Duration::from_secs(3600), Duration::from_secs(2));

        scheduler
            .run(
                move || {
                    let flag = flag.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        flag.store(true, Ordering::SeqCst);
                    }
                },
                sleep_ms(20),
            )
            .await
            .unwrap();

        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_timeout() {
        let scheduler = Scheduler::new(Duration::from_secs(3600), Duration::from_millis(50));

        let err = scheduler
            .run(
                || async { tokio::time::sleep(Duration::from_secs(10)).await },
                sleep_ms(20),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SchedulerError::ShutdownTimeout { timeout } if timeout == Duration::from_millis(50)
        ));
    }

    #[test]
    fn test_from_config() {
        let config = ScheduleConfig {
            interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            run_on_startup: false,
        };
        let scheduler = Scheduler::from_config(&config);
        assert_eq!(scheduler.interval, Duration::from_secs(60));
        assert!(!scheduler.run_on_startup);
    }
}
