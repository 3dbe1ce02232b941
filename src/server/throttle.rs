use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Window over which manual pipeline triggers are counted.
pub const MANUAL_TRIGGER_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter for manual pipeline triggers, keyed by caller.
#[derive(Default)]
pub struct TriggerThrottle {
    callers: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl TriggerThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one trigger for `caller`.
    ///
    /// Returns `Err(retry_after_secs)` once `max` triggers already landed
    /// inside `window`; the rejected attempt is not recorded.
    pub fn admit(&self, caller: &str, max: usize, window: Duration) -> Result<(), u64> {
        let now = Instant::now();
        let mut callers = self.callers.lock().unwrap_or_else(|e| e.into_inner());
        let hits = callers.entry(caller.to_string()).or_default();
        while hits.front().is_some_and(|t| now.duration_since(*t) >= window) {
            hits.pop_front();
        }

        if hits.len() >= max {
            let retry_after = hits
                .front()
                .and_then(|oldest| window.checked_sub(now.duration_since(*oldest)))
                .unwrap_or(Duration::from_secs(1));
            return Err(retry_after.as_secs().max(1));
        }
        hits.push_back(now);
        Ok(())
    }

    /// Drop callers with no hits inside `window`. Returns how many were dropped.
    pub fn prune(&self, window: Duration) -> usize {
        let now = Instant::now();
        let mut callers = self.callers.lock().unwrap_or_else(|e| e.into_inner());
        let before = callers.len();
        callers.retain(|_, hits| hits.back().is_some_and(|t| now.duration_since(*t) < window));
        before - callers.len()
    }

    pub fn tracked_callers(&self) -> usize {
        self.callers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_seventh_trigger_in_a_minute_is_rejected() {
        let throttle = TriggerThrottle::new();
        for _ in 0..6 {
            assert!(throttle.admit("user-1", 6, MANUAL_TRIGGER_WINDOW).is_ok());
        }
        let retry_after = throttle.admit("user-1", 6, MANUAL_TRIGGER_WINDOW).unwrap_err();
        assert!((1..=60).contains(&retry_after));
        // Other callers have their own budget.
        assert!(throttle.admit("user-2", 6, MANUAL_TRIGGER_WINDOW).is_ok());
    }

    #[test]
    fn test_budget_returns_after_window() {
        let throttle = TriggerThrottle::new();
        let window = Duration::from_millis(40);
        for _ in 0..2 {
            throttle.admit("user-1", 2, window).unwrap();
        }
        assert!(throttle.admit("user-1", 2, window).is_err());
        thread::sleep(Duration::from_millis(50));
        assert!(throttle.admit("user-1", 2, window).is_ok());
    }

    #[test]
    fn test_prune_drops_idle_callers() {
        let throttle = TriggerThrottle::new();
        let window = Duration::from_millis(30);
        throttle.admit("idle", 5, window).unwrap();
        thread::sleep(Duration::from_millis(40));
        throttle.admit("busy", 5, window).unwrap();

        assert_eq!(throttle.prune(window), 1);
        assert_eq!(throttle.tracked_callers(), 1);
    }
}
