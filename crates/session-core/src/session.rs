//! One emulated user walking the transition matrix.

use crate::control::RunControl;
use crate::executor::{RequestExecutor, SessionContext};
use crate::matrix::{
    saturating_think_time, NextOperation, OperationId, ThinkTimePolicy, TransitionMatrix,
};
use crate::stats::StatsCounter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Operation every session starts with.
    pub entry: OperationId,
    pub think_time: ThinkTimePolicy,
    /// Upper bound on operations per session.
    pub max_transitions: Option<u64>,
    /// Start a new session instead of stopping when one ends.
    pub repeat: bool,
    pub seed: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            entry: 0,
            think_time: ThinkTimePolicy::default(),
            max_transitions: None,
            repeat: false,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Terminal,
    TransitionLimit,
    StopFlag,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: u64,
    /// Always `Stopped` once `run` returns.
    pub state: SessionState,
    pub stop_reason: StopReason,
    pub sessions_completed: u64,
    pub operations: u64,
    /// Indexed by the run phase active when each operation completed.
    pub phase_stats: Vec<StatsCounter>,
}

impl SessionOutcome {
    /// All phases folded together.
    pub fn stats(&self) -> StatsCounter {
        let mut total = StatsCounter::new();
        for stats in &self.phase_stats {
            total.merge(stats);
        }
        total
    }
}

pub struct SessionWorker {
    session_id: u64,
    matrix: Arc<TransitionMatrix>,
    executor: Arc<dyn RequestExecutor>,
    control: Arc<RunControl>,
    settings: SessionSettings,
    rng: StdRng,
    state: SessionState,
    phase_stats: Vec<StatsCounter>,
}

impl SessionWorker {
    pub fn new(
        session_id: u64,
        matrix: Arc<TransitionMatrix>,
        executor: Arc<dyn RequestExecutor>,
        control: Arc<RunControl>,
        settings: SessionSettings,
    ) -> Self {
        let rng = StdRng::seed_from_u64(
            settings.seed ^ session_id.wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );

        Self {
            session_id,
            matrix,
            executor,
            control,
            settings,
            rng,
            state: SessionState::Running,
            phase_stats: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run until the stop flag is raised or, without `repeat`, until the
    /// session ends.
    pub async fn run(mut self) -> SessionOutcome {
        let entry = self.settings.entry;
        let mut current = entry;
        let mut round = 0u64;
        let mut transition = 0u64;
        let mut operations = 0u64;

        let stop_reason = loop {
            if self.control.is_stopped() {
                break StopReason::StopFlag;
            }

            let context = SessionContext {
                session_id: self.session_id,
                session_round: round,
                transition,
            };
            self.perform(current, &context).await;
            operations += 1;
            transition += 1;

            let limit_reached = self
                .settings
                .max_transitions
                .is_some_and(|max| transition >= max);

            let ended = if limit_reached {
                Some(StopReason::TransitionLimit)
            } else {
                let draw: f64 = self.rng.gen();
                match self.matrix.sample_next(current, draw) {
                    NextOperation::Terminal => Some(StopReason::Terminal),
                    NextOperation::Operation(next) => {
                        self.think(current).await;
                        current = next;
                        None
                    }
                }
            };

            if let Some(reason) = ended {
                round += 1;
                if !self.settings.repeat {
                    break reason;
                }
                self.think(current).await;
                current = entry;
                transition = 0;
            }
        };

        self.state = SessionState::Stopped;
        debug!(
            session_id = self.session_id,
            ?stop_reason,
            operations,
            "Session worker stopped"
        );

        SessionOutcome {
            session_id: self.session_id,
            state: self.state,
            stop_reason,
            sessions_completed: round,
            operations,
            phase_stats: self.phase_stats,
        }
    }

    async fn perform(&mut self, operation: OperationId, context: &SessionContext) {
        let name = self.matrix.operation_name(operation);
        let start = Instant::now();

        let (latency_ms, failed) = match self.executor.execute(name, context).await {
            Ok(outcome) => (outcome.latency_ms, false),
            Err(e) => {
                debug!(
                    session_id = self.session_id,
                    operation = name,
                    error = %e,
                    "Request failed"
                );
                (start.elapsed().as_millis() as u64, true)
            }
        };

        let phase = self.control.phase();
        if self.phase_stats.len() <= phase {
            let operations = self.matrix.len();
            self.phase_stats
                .resize_with(phase + 1, || StatsCounter::with_operations(operations));
        }
        self.phase_stats[phase].record(operation, latency_ms, failed);
    }

    /// Think after leaving `operation`, scaled by the current slowdown.
    async fn think(&mut self, operation: OperationId) {
        let draw: f64 = self.rng.gen();
        let base = self
            .matrix
            .sample_think_time(operation, draw, self.settings.think_time);
        let pause = saturating_think_time(base.as_secs_f64() * self.control.slowdown_factor());
        self.control.pause(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use std::time::Duration;

    const CHAIN: &str = "from home browse view end think\n\
                         home   0 1 0 0 0\n\
                         browse 0 0 1 0 0\n\
                         view   0 0 0 1 0\n";

    const AUCTION: &str = "from home browse view end think\n\
                           home   0.0 0.7 0.2 0.1 0\n\
                           browse 0.1 0.3 0.5 0.1 0\n\
                           view   0.2 0.4 0.2 0.2 0\n";

    fn worker(
        src: &str,
        executor: Arc<dyn RequestExecutor>,
        control: Arc<RunControl>,
        settings: SessionSettings,
    ) -> SessionWorker {
        let matrix = Arc::new(TransitionMatrix::parse(src).unwrap());
        SessionWorker::new(1, matrix, executor, control, settings)
    }

    #[tokio::test]
    async fn test_failing_requests_do_not_abort_session() {
        let w = worker(
            CHAIN,
            Arc::new(MockExecutor::failing(0)),
            Arc::new(RunControl::new()),
            SessionSettings::default(),
        );
        assert_eq!(w.state(), SessionState::Running);

        let outcome = w.run().await;
        assert_eq!(outcome.state, SessionState::Stopped);
        assert_eq!(outcome.stop_reason, StopReason::Terminal);
        assert_eq!(outcome.operations, 3);

        let stats = outcome.stats();
        for op in 0..3 {
            assert_eq!(stats.count(op), 1);
            assert_eq!(stats.failures(op), 1);
        }
    }

    #[tokio::test]
    async fn test_entry_operation_is_counted() {
        let w = worker(
            "from home end think\nhome 0 1 0\n",
            Arc::new(MockExecutor::new(0)),
            Arc::new(RunControl::new()),
            SessionSettings::default(),
        );

        let outcome = w.run().await;
        assert_eq!(outcome.stop_reason, StopReason::Terminal);
        assert_eq!(outcome.stats().count(0), 1);
        assert_eq!(outcome.sessions_completed, 1);
    }

    #[tokio::test]
    async fn test_raised_stop_flag_prevents_work() {
        let control = Arc::new(RunControl::new());
        control.raise_stop();
        let w = worker(
            CHAIN,
            Arc::new(MockExecutor::new(0)),
            control,
            SessionSettings::default(),
        );

        let outcome = w.run().await;
        assert_eq!(outcome.state, SessionState::Stopped);
        assert_eq!(outcome.stop_reason, StopReason::StopFlag);
        assert_eq!(outcome.operations, 0);
        assert_eq!(outcome.stats().total(), 0);
    }

    #[tokio::test]
    async fn test_transition_limit_ends_session() {
        let w = worker(
            "from home end think\nhome 1 0 0\n",
            Arc::new(MockExecutor::new(0)),
            Arc::new(RunControl::new()),
            SessionSettings {
                max_transitions: Some(5),
                ..Default::default()
            },
        );

        let outcome = w.run().await;
        assert_eq!(outcome.stop_reason, StopReason::TransitionLimit);
        assert_eq!(outcome.operations, 5);
    }

    #[tokio::test]
    async fn test_repeat_restarts_until_stopped() {
        let control = Arc::new(RunControl::new());
        let w = worker(
            "from home end think\nhome 0 1 2\n",
            Arc::new(MockExecutor::new(0)),
            control.clone(),
            SessionSettings {
                repeat: true,
                think_time: ThinkTimePolicy::Fixed,
                ..Default::default()
            },
        );

        let handle = tokio::spawn(w.run());
        tokio::time::sleep(Duration::from_millis(60)).await;
        control.raise_stop();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::StopFlag);
        assert!(outcome.sessions_completed > 1);
        assert_eq!(outcome.stats().count(0), outcome.sessions_completed);
    }

    #[tokio::test]
    async fn test_huge_slowdown_pause_is_interruptible() {
        let control = Arc::new(RunControl::new());
        control.store_slowdown_factor(1e300);
        let w = worker(
            "from home end think\nhome 1 0 10\n",
            Arc::new(MockExecutor::new(0)),
            control.clone(),
            SessionSettings {
                think_time: ThinkTimePolicy::Fixed,
                ..Default::default()
            },
        );

        let handle = tokio::spawn(w.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        control.raise_stop();

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::StopFlag);
        assert_eq!(outcome.stats().count(0), 1);
    }

    #[tokio::test]
    async fn test_same_seed_same_walk() {
        let settings = SessionSettings {
            max_transitions: Some(200),
            repeat: false,
            seed: 42,
            ..Default::default()
        };

        let mut walks = Vec::new();
        for _ in 0..2 {
            let w = worker(
                AUCTION,
                Arc::new(MockExecutor::new(0)),
                Arc::new(RunControl::new()),
                settings.clone(),
            );
            let outcome = w.run().await;
            walks.push((outcome.operations, outcome.stats().snapshot()));
        }
        assert_eq!(walks[0], walks[1]);
    }

    #[tokio::test]
    async fn test_records_are_tagged_with_phase() {
        let control = Arc::new(RunControl::new());
        control.set_phase(2);
        let w = worker(
            CHAIN,
            Arc::new(MockExecutor::new(0)),
            control,
            SessionSettings::default(),
        );

        let outcome = w.run().await;
        assert_eq!(outcome.phase_stats.len(), 3);
        assert_eq!(outcome.phase_stats[0].total(), 0);
        assert_eq!(outcome.phase_stats[2].total(), 3);
    }
}
