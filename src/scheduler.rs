use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::{coordinator, SentinelContext};
use crate::server::throttle::{TriggerThrottle, MANUAL_TRIGGER_WINDOW};

/// How often idle callers are dropped from the manual trigger throttle.
const THROTTLE_PRUNE_SECS: u64 = 300;

/// Runtime state for the scheduler, shared with the HTTP health probe.
pub struct SchedulerState {
    running: AtomicBool,
    in_flight: AtomicBool,
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_skipped: AtomicU64,
    callers_pruned: AtomicU64,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            runs_started: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_skipped: AtomicU64::new(0),
            callers_pruned: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.running.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_skipped: self.runs_skipped.load(Ordering::Relaxed),
            callers_pruned: self.callers_pruned.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub in_flight: bool,
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub runs_skipped: u64,
    pub callers_pruned: u64,
}

/// Run one scheduled pass unless the previous one is still going.
/// Returns `false` when the tick was skipped.
pub async fn run_scheduled(scheduler: &SchedulerState, ctx: &SentinelContext) -> bool {
    if scheduler
        .in_flight
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        scheduler.runs_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Previous scheduled run still in flight, skipping tick");
        return false;
    }

    scheduler.runs_started.fetch_add(1, Ordering::Relaxed);
    let summary = coordinator::run_pipeline(ctx, "schedule").await;
    if summary.status == "failed" {
        scheduler.runs_failed.fetch_add(1, Ordering::Relaxed);
    } else {
        scheduler.runs_completed.fetch_add(1, Ordering::Relaxed);
    }
    scheduler.in_flight.store(false, Ordering::Release);
    true
}

/// Start the pipeline and throttle-prune loops. Both exit when
/// `shutdown_rx` changes. A `schedule_secs` of zero starts only the prune loop.
pub fn start_loops(
    scheduler: Arc<SchedulerState>,
    ctx: SentinelContext,
    throttle: Arc<TriggerThrottle>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);
    let every = ctx.config.schedule_secs;
    if every == 0 {
        tracing::info!("In-process scheduler disabled, waiting for external triggers");
    } else {
        scheduler.running.store(true, Ordering::Relaxed);
        tracing::info!(schedule_secs = every, "Scheduler starting");
        handles.push(tokio::spawn({
            let scheduler = scheduler.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            async move {
                let mut interval = tokio::time::interval(Duration::from_secs(every));
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    if !scheduler.is_running() {
                        break;
                    }
                    run_scheduled(&scheduler, &ctx).await;
                }
                scheduler.running.store(false, Ordering::Relaxed);
                tracing::info!("Scheduler stopped");
            }
        }));
    }

    handles.push(tokio::spawn({
        let scheduler = scheduler.clone();
        let mut shutdown_rx = shutdown_rx;
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(THROTTLE_PRUNE_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                let dropped = throttle.prune(MANUAL_TRIGGER_WINDOW);
                if dropped > 0 {
                    scheduler.callers_pruned.fetch_add(dropped as u64, Ordering::Relaxed);
                    tracing::debug!(dropped, "Pruned idle trigger callers");
                }
            }
        }
    }));

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::engine::test_support;

    #[test]
    fn test_scheduler_state_initial() {
        let state = SchedulerState::new();
        assert!(!state.is_running());
        let stats = state.stats();
        assert!(!stats.in_flight);
        assert_eq!(stats.runs_started, 0);
        assert_eq!(stats.runs_skipped, 0);
    }

    #[tokio::test]
    async fn test_scheduled_run_updates_counters() {
        let ctx = test_support::context(init_test_db().unwrap());
        let state = SchedulerState::new();

        assert!(run_scheduled(&state, &ctx).await);
        let stats = state.stats();
        assert_eq!(stats.runs_started, 1);
        assert_eq!(stats.runs_completed, 1);
        assert!(!stats.in_flight);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let ctx = test_support::context(init_test_db().unwrap());
        let state = SchedulerState::new();
        state.in_flight.store(true, Ordering::Relaxed);

        assert!(!run_scheduled(&state, &ctx).await);
        assert_eq!(state.stats().runs_skipped, 1);
        assert_eq!(state.stats().runs_started, 0);
    }

    #[tokio::test]
    async fn test_zero_interval_disables_pipeline_loop() {
        let mut config = crate::config::SentinelConfig::default();
        config.schedule_secs = 0;
        let ctx = test_support::context_with(init_test_db().unwrap(), config);
        let state = Arc::new(SchedulerState::new());
        let (tx, rx) = watch::channel(false);

        let handles = start_loops(state.clone(), ctx, Arc::new(TriggerThrottle::new()), rx);
        assert_eq!(handles.len(), 1);
        assert!(!state.is_running());
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_loops_stop_on_shutdown() {
        let ctx = test_support::context(init_test_db().unwrap());
        let state = Arc::new(SchedulerState::new());
        let (tx, rx) = watch::channel(false);

        let handles = start_loops(state.clone(), ctx, Arc::new(TriggerThrottle::new()), rx);
        assert!(state.is_running());
        // First interval tick fires immediately.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!state.is_running());
        assert!(state.stats().runs_started >= 1);
    }
}
