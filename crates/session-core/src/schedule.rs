use crate::error::LoadError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Wave sizes read from a schedule source, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    waves: Vec<u32>,
    malformed: Option<(usize, String)>,
}

impl Schedule {
    /// Parse whitespace separated session counts. Parsing stops at the first
    /// token that is not an unsigned integer; the waves before it are kept.
    pub fn parse(input: &str) -> Self {
        let mut waves = Vec::new();
        let mut malformed = None;

        for (position, token) in input.split_whitespace().enumerate() {
            match token.parse::<u32>() {
                Ok(n) => waves.push(n),
                Err(_) => {
                    malformed = Some((position, token.to_string()));
                    break;
                }
            }
        }

        Self { waves, malformed }
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| LoadError::io(path, e))?;
        Ok(Self::parse(&contents))
    }

    pub fn waves(&self) -> &[u32] {
        &self.waves
    }

    pub fn total_sessions(&self) -> u64 {
        self.waves.iter().map(|n| *n as u64).sum()
    }

    /// The token parsing stopped at, as an error.
    pub fn check(&self) -> Result<(), LoadError> {
        match &self.malformed {
            Some((position, token)) => Err(LoadError::MalformedSchedule {
                position: *position,
                token: token.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    UpRamp,
    Session,
    DownRamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub kind: PhaseKind,
    pub duration_ms: u64,
    /// Think-time multiplier while the phase is active.
    pub slowdown: f64,
}

/// Phases of a ramped run, applied strictly in order.
#[derive(Debug, Clone, PartialEq)]
pub struct RampPlan {
    phases: Vec<Phase>,
}

impl RampPlan {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// Up-ramp, steady session at factor 1, down-ramp.
    pub fn three_phase(
        up_ramp_ms: u64,
        up_ramp_slowdown: f64,
        session_ms: u64,
        down_ramp_ms: u64,
        down_ramp_slowdown: f64,
    ) -> Self {
        Self::new(vec![
            Phase {
                kind: PhaseKind::UpRamp,
                duration_ms: up_ramp_ms,
                slowdown: up_ramp_slowdown,
            },
            Phase {
                kind: PhaseKind::Session,
                duration_ms: session_ms,
                slowdown: 1.0,
            },
            Phase {
                kind: PhaseKind::DownRamp,
                duration_ms: down_ramp_ms,
                slowdown: down_ramp_slowdown,
            },
        ])
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.phases.iter().map(|p| p.duration_ms).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schedule() {
        let schedule = Schedule::parse("3\n0 2\n\t10\n");
        assert_eq!(schedule.waves(), &[3, 0, 2, 10]);
        assert_eq!(schedule.total_sessions(), 15);
        assert!(schedule.check().is_ok());
    }

    #[test]
    fn test_parse_stops_at_malformed_token() {
        let schedule = Schedule::parse("4 5 six 7");
        assert_eq!(schedule.waves(), &[4, 5]);

        match schedule.check() {
            Err(LoadError::MalformedSchedule { position, token }) => {
                assert_eq!(position, 2);
                assert_eq!(token, "six");
            }
            other => panic!("expected MalformedSchedule, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_count_is_malformed() {
        let schedule = Schedule::parse("2 -1 3");
        assert_eq!(schedule.waves(), &[2]);
        assert!(schedule.check().is_err());
    }

    #[test]
    fn test_empty_schedule() {
        let schedule = Schedule::parse("  \n");
        assert!(schedule.waves().is_empty());
        assert!(schedule.check().is_ok());
    }

    #[test]
    fn test_missing_schedule_file() {
        assert!(matches!(
            Schedule::read("/nonexistent/schedule.txt"),
            Err(LoadError::Io { .. })
        ));
    }

    #[test]
    fn test_ramp_plan_total_duration() {
        let plan = RampPlan::three_phase(5000, 2.0, 10000, 3000, 3.0);
        assert_eq!(plan.total_duration_ms(), 18000);
        assert_eq!(plan.phases().len(), 3);
        assert_eq!(plan.phases()[1].slowdown, 1.0);
    }
}
