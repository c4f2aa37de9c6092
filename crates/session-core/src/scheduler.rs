//! Wave scheduler: spawn N session workers, let them run, stop them, and
//! fold their counters into wave, phase and run totals.

use crate::control::RunControl;
use crate::error::LoadError;
use crate::executor::RequestExecutor;
use crate::matrix::TransitionMatrix;
use crate::schedule::{Phase, RampPlan};
use crate::session::{SessionOutcome, SessionSettings, SessionWorker, StopReason};
use crate::stats::StatsCounter;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct SchedulerSettings {
    /// Give up on workers this long after the stop flag is raised.
    /// `None` waits for every worker.
    pub join_timeout: Option<Duration>,
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReasonCounts {
    pub terminal: u64,
    pub transition_limit: u64,
    pub stop_flag: u64,
}

impl StopReasonCounts {
    fn add(&mut self, reason: StopReason) {
        match reason {
            StopReason::Terminal => self.terminal += 1,
            StopReason::TransitionLimit => self.transition_limit += 1,
            StopReason::StopFlag => self.stop_flag += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WaveReport {
    pub index: usize,
    pub sessions: u32,
    pub session_ids: Range<u64>,
    /// Workers that reported an outcome.
    pub completed: usize,
    /// Workers aborted after the join timeout; their counts are discarded.
    pub stragglers: usize,
    /// Workers whose task panicked or was cancelled.
    pub interrupted: usize,
    pub stop_reasons: StopReasonCounts,
    pub stats: StatsCounter,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: Phase,
    pub stats: StatsCounter,
}

#[derive(Debug, Clone)]
pub struct RampReport {
    pub sessions: u32,
    pub session_ids: Range<u64>,
    pub completed: usize,
    pub stragglers: usize,
    pub interrupted: usize,
    pub stop_reasons: StopReasonCounts,
    pub phases: Vec<PhaseReport>,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Joined {
    outcomes: Vec<SessionOutcome>,
    stragglers: usize,
    interrupted: usize,
}

pub struct LoadScheduler {
    matrix: Arc<TransitionMatrix>,
    executor: Arc<dyn RequestExecutor>,
    control: Arc<RunControl>,
    settings: SchedulerSettings,
    next_session_id: u64,
    aggregate: StatsCounter,
}

impl LoadScheduler {
    pub fn new(
        matrix: Arc<TransitionMatrix>,
        executor: Arc<dyn RequestExecutor>,
        settings: SchedulerSettings,
    ) -> Self {
        let aggregate = StatsCounter::with_operations(matrix.len());
        Self {
            matrix,
            executor,
            control: Arc::new(RunControl::new()),
            settings,
            next_session_id: 0,
            aggregate,
        }
    }

    pub fn matrix(&self) -> &TransitionMatrix {
        &self.matrix
    }

    pub fn control(&self) -> &Arc<RunControl> {
        &self.control
    }

    /// Change the think-time multiplier of every running worker.
    pub fn set_slowdown_factor(&self, value: f64) -> Result<(), LoadError> {
        check_slowdown(value)?;
        self.control.store_slowdown_factor(value);
        Ok(())
    }

    pub fn slowdown_factor(&self) -> f64 {
        self.control.slowdown_factor()
    }

    /// Everything merged so far, across waves and ramps.
    pub fn aggregate(&self) -> &StatsCounter {
        &self.aggregate
    }

    /// Run one wave per schedule entry, strictly one after the other.
    pub async fn run(&mut self, schedule: &[u32], wave_duration: Duration) -> Vec<WaveReport> {
        let mut reports = Vec::with_capacity(schedule.len());
        for (index, sessions) in schedule.iter().enumerate() {
            reports.push(self.run_wave(index, *sessions, wave_duration).await);
        }
        reports
    }

    pub async fn run_wave(&mut self, index: usize, sessions: u32, wave_duration: Duration) -> WaveReport {
        let start = Instant::now();
        self.control.clear_stop();
        self.control.set_phase(0);

        info!(wave = index, "Starting {} session workers", sessions);
        let (workers, session_ids) = self.spawn_workers(sessions);

        sleep(wave_duration).await;
        self.control.raise_stop();

        let joined = self.join_all(workers).await;

        let mut stats = StatsCounter::with_operations(self.matrix.len());
        let mut stop_reasons = StopReasonCounts::default();
        for outcome in &joined.outcomes {
            stats.merge(&outcome.stats());
            stop_reasons.add(outcome.stop_reason);
        }
        self.aggregate.merge(&stats);

        info!(
            wave = index,
            operations = stats.total(),
            failures = stats.total_failures(),
            "All {} session workers finished",
            joined.outcomes.len()
        );

        WaveReport {
            index,
            sessions,
            session_ids,
            completed: joined.outcomes.len(),
            stragglers: joined.stragglers,
            interrupted: joined.interrupted,
            stop_reasons,
            stats,
            elapsed: start.elapsed(),
        }
    }

    /// Start `sessions` workers once and walk them through every phase of
    /// `plan`, switching the slowdown factor at each boundary. Each phase
    /// keeps its own counter.
    pub async fn run_ramp(&mut self, sessions: u32, plan: &RampPlan) -> Result<RampReport, LoadError> {
        for phase in plan.phases() {
            check_slowdown(phase.slowdown)?;
        }

        let start = Instant::now();
        let previous_slowdown = self.control.slowdown_factor();
        self.control.clear_stop();
        self.control.set_phase(0);
        if let Some(first) = plan.phases().first() {
            self.control.store_slowdown_factor(first.slowdown);
        }

        info!(
            total_duration_ms = plan.total_duration_ms(),
            "Starting {} session workers for a {}-phase ramp",
            sessions,
            plan.phases().len()
        );
        let (workers, session_ids) = self.spawn_workers(sessions);

        for (idx, phase) in plan.phases().iter().enumerate() {
            self.control.set_phase(idx);
            self.control.store_slowdown_factor(phase.slowdown);
            info!(
                phase = ?phase.kind,
                slowdown = phase.slowdown,
                duration_ms = phase.duration_ms,
                "Switching phase"
            );
            sleep(Duration::from_millis(phase.duration_ms)).await;
        }

        info!("Shutting down session workers");
        self.control.raise_stop();
        let joined = self.join_all(workers).await;
        self.control.store_slowdown_factor(previous_slowdown);

        let operations = self.matrix.len();
        let mut phase_stats = vec![StatsCounter::with_operations(operations); plan.phases().len().max(1)];
        let last = phase_stats.len() - 1;
        let mut stop_reasons = StopReasonCounts::default();
        for outcome in &joined.outcomes {
            stop_reasons.add(outcome.stop_reason);
            for (idx, stats) in outcome.phase_stats.iter().enumerate() {
                phase_stats[idx.min(last)].merge(stats);
            }
        }
        for stats in &phase_stats {
            self.aggregate.merge(stats);
        }

        let phases = plan
            .phases()
            .iter()
            .cloned()
            .zip(phase_stats)
            .map(|(phase, stats)| PhaseReport { phase, stats })
            .collect();

        Ok(RampReport {
            sessions,
            session_ids,
            completed: joined.outcomes.len(),
            stragglers: joined.stragglers,
            interrupted: joined.interrupted,
            stop_reasons,
            phases,
            elapsed: start.elapsed(),
        })
    }

    fn spawn_workers(&mut self, sessions: u32) -> (JoinSet<SessionOutcome>, Range<u64>) {
        let first = self.next_session_id;
        let mut workers = JoinSet::new();

        for offset in 0..sessions as u64 {
            let worker = SessionWorker::new(
                first + offset,
                self.matrix.clone(),
                self.executor.clone(),
                self.control.clone(),
                self.settings.session.clone(),
            );
            workers.spawn(worker.run());
        }

        self.next_session_id = first + sessions as u64;
        (workers, first..self.next_session_id)
    }

    async fn join_all(&self, mut workers: JoinSet<SessionOutcome>) -> Joined {
        let mut joined = Joined::default();
        let deadline = self
            .settings
            .join_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, workers.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            stragglers = workers.len(),
                            "Join timeout reached, aborting remaining session workers"
                        );
                        workers.abort_all();
                        while let Some(res) = workers.join_next().await {
                            match res {
                                Ok(outcome) => joined.outcomes.push(outcome),
                                Err(e) if e.is_cancelled() => joined.stragglers += 1,
                                Err(e) => {
                                    warn!(error = %e, "Session worker interrupted");
                                    joined.interrupted += 1;
                                }
                            }
                        }
                        break;
                    }
                },
                None => workers.join_next().await,
            };

            match next {
                Some(Ok(outcome)) => joined.outcomes.push(outcome),
                Some(Err(e)) => {
                    warn!(error = %e, "Session worker interrupted, assuming it finished");
                    joined.interrupted += 1;
                }
                None => break,
            }
        }

        joined
    }
}

fn check_slowdown(value: f64) -> Result<(), LoadError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(LoadError::config(format!(
            "slowdown factor must be a positive number, got {value}"
        )));
    }
    Ok(())
}
