use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Signals shared between the scheduler and every session worker of a run.
///
/// Single writer (the scheduler), many readers. Reads never take a lock
/// that the writer holds for longer than a store.
#[derive(Debug)]
pub struct RunControl {
    stop: watch::Sender<bool>,
    slowdown_bits: AtomicU64,
    phase: AtomicUsize,
}

impl RunControl {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            slowdown_bits: AtomicU64::new(1.0f64.to_bits()),
            phase: AtomicUsize::new(0),
        }
    }

    pub fn clear_stop(&self) {
        self.stop.send_replace(false);
    }

    pub fn raise_stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Current think-time multiplier.
    pub fn slowdown_factor(&self) -> f64 {
        f64::from_bits(self.slowdown_bits.load(Ordering::Acquire))
    }

    /// Callers validate the factor; see `LoadScheduler::set_slowdown_factor`.
    pub(crate) fn store_slowdown_factor(&self, value: f64) {
        self.slowdown_bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn phase(&self) -> usize {
        self.phase.load(Ordering::Acquire)
    }

    pub(crate) fn set_phase(&self, phase: usize) {
        self.phase.store(phase, Ordering::Release);
    }

    /// Suspend for `duration`, waking early once the stop flag is raised.
    ///
    /// Returns `true` when the pause was cut short by a stop.
    pub async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            // Still yield so zero-think sessions cannot starve the runtime.
            tokio::task::yield_now().await;
            return self.is_stopped();
        }

        let mut rx = self.stop.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            res = rx.wait_for(|stopped| *stopped) => {
                if res.is_err() {
                    debug!("Stop channel closed while thinking, treating as stop");
                }
                true
            }
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_stop_flag_round_trip() {
        let control = RunControl::new();
        assert!(!control.is_stopped());
        control.raise_stop();
        assert!(control.is_stopped());
        control.clear_stop();
        assert!(!control.is_stopped());
    }

    #[test]
    fn test_slowdown_defaults_to_one() {
        let control = RunControl::new();
        assert_eq!(control.slowdown_factor(), 1.0);
        control.store_slowdown_factor(2.5);
        assert_eq!(control.slowdown_factor(), 2.5);
    }

    #[tokio::test]
    async fn test_pause_runs_to_completion_without_stop() {
        let control = RunControl::new();
        let start = Instant::now();
        assert!(!control.pause(Duration::from_millis(20)).await);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_pause_wakes_on_stop() {
        let control = Arc::new(RunControl::new());
        let sleeper = {
            let control = control.clone();
            tokio::spawn(async move { control.pause(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        control.raise_stop();

        let interrupted = sleeper.await.unwrap();
        assert!(interrupted);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_pause_returns_immediately_when_already_stopped() {
        let control = RunControl::new();
        control.raise_stop();
        assert!(control.pause(Duration::from_secs(30)).await);
    }
}
