use crate::error::LoadError;
use crate::executor::BackendFlavor;
use crate::matrix::{ThinkTimePolicy, TransitionMatrix, DEFAULT_TOLERANCE};
use crate::schedule::RampPlan;
use crate::scheduler::SchedulerSettings;
use crate::session::SessionSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub ramp: Option<RampConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| LoadError::io(path, e))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, LoadError> {
        let config: Config =
            toml::from_str(contents).map_err(|e| LoadError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.matrix.entry_operation.trim().is_empty() {
            return Err(LoadError::config("matrix.entry_operation must not be empty"));
        }
        if !(self.matrix.tolerance.is_finite() && self.matrix.tolerance >= 0.0) {
            return Err(LoadError::config("matrix.tolerance must be a non-negative number"));
        }
        if self.session.max_transitions == Some(0) {
            return Err(LoadError::config("session.max_transitions must be at least 1"));
        }
        if self.scheduler.join_timeout_ms == Some(0) {
            return Err(LoadError::config("scheduler.join_timeout_ms must be at least 1"));
        }
        if self.target.base_url.trim().is_empty() {
            return Err(LoadError::config("target.base_url must not be empty"));
        }
        if let Some(ramp) = &self.ramp {
            for (name, value) in [
                ("ramp.up_ramp_slowdown", ramp.up_ramp_slowdown),
                ("ramp.down_ramp_slowdown", ramp.down_ramp_slowdown),
            ] {
                if !value.is_finite() || value <= 0.0 {
                    return Err(LoadError::config(format!("{name} must be positive, got {value}")));
                }
            }
        }
        Ok(())
    }

    pub fn load_matrix(&self) -> Result<TransitionMatrix, LoadError> {
        TransitionMatrix::load_with_tolerance(&self.matrix.path, self.matrix.tolerance)
    }

    /// Resolve names against the loaded matrix.
    pub fn scheduler_settings(&self, matrix: &TransitionMatrix) -> Result<SchedulerSettings, LoadError> {
        let entry = matrix
            .operation_id(&self.matrix.entry_operation)
            .ok_or_else(|| {
                LoadError::config(format!(
                    "matrix.entry_operation {:?} is not an operation of the matrix",
                    self.matrix.entry_operation
                ))
            })?;

        Ok(SchedulerSettings {
            join_timeout: self.scheduler.join_timeout_ms.map(Duration::from_millis),
            session: SessionSettings {
                entry,
                think_time: self.matrix.think_time,
                max_transitions: self.session.max_transitions,
                repeat: self.session.repeat,
                seed: self.session.seed,
            },
        })
    }

    pub fn wave_duration(&self) -> Duration {
        Duration::from_millis(self.scheduler.wave_duration_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Path to the transition table text file
    pub path: PathBuf,
    /// Operation every session starts with
    pub entry_operation: String,
    #[serde(default)]
    pub think_time: ThinkTimePolicy,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Deterministic seed for reproducible walks
    #[serde(default)]
    pub seed: u64,
    /// Maximum operations per session
    pub max_transitions: Option<u64>,
    /// Start over at the entry operation when a session ends
    #[serde(default)]
    pub repeat: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long each wave runs before the stop flag is raised
    pub wave_duration_ms: u64,
    /// Abort workers still running this long after the stop flag
    pub join_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub base_url: String,
    #[serde(default)]
    pub flavor: BackendFlavor,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Concurrent sessions kept for the whole ramp
    pub sessions: u32,
    pub up_ramp_ms: u64,
    pub up_ramp_slowdown: f64,
    pub session_ms: u64,
    pub down_ramp_ms: u64,
    pub down_ramp_slowdown: f64,
}

impl RampConfig {
    pub fn plan(&self) -> RampPlan {
        RampPlan::three_phase(
            self.up_ramp_ms,
            self.up_ramp_slowdown,
            self.session_ms,
            self.down_ramp_ms,
            self.down_ramp_slowdown,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[matrix]
path = "config/auction_transitions.txt"
entry_operation = "home"
think_time = "fixed"

[session]
seed = 42
max_transitions = 100
repeat = true

[scheduler]
wave_duration_ms = 60000
join_timeout_ms = 5000

[target]
base_url = "http://localhost:8080"
flavor = "servlets"
timeout_ms = 5000

[ramp]
sessions = 50
up_ramp_ms = 10000
up_ramp_slowdown = 2.0
session_ms = 60000
down_ramp_ms = 10000
down_ramp_slowdown = 3.0
    "#;

    #[test]
    fn test_config_serde() {
        let config = Config::parse(CONFIG).unwrap();
        assert_eq!(config.matrix.entry_operation, "home");
        assert_eq!(config.matrix.think_time, ThinkTimePolicy::Fixed);
        assert_eq!(config.matrix.tolerance, DEFAULT_TOLERANCE);
        assert_eq!(config.session.seed, 42);
        assert!(config.session.repeat);
        assert_eq!(config.wave_duration(), Duration::from_secs(60));
        assert_eq!(config.target.flavor, BackendFlavor::Servlets);

        let plan = config.ramp.as_ref().unwrap().plan();
        assert_eq!(plan.total_duration_ms(), 80000);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::parse(
            r#"
[matrix]
path = "m.txt"
entry_operation = "home"

[scheduler]
wave_duration_ms = 1000

[target]
base_url = "http://localhost"
timeout_ms = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.matrix.think_time, ThinkTimePolicy::Exponential);
        assert_eq!(config.target.flavor, BackendFlavor::Php);
        assert_eq!(config.session.max_transitions, None);
        assert!(!config.session.repeat);
        assert!(config.ramp.is_none());
    }

    #[test]
    fn test_invalid_settings_are_config_errors() {
        let bad_slowdown = CONFIG.replace("up_ramp_slowdown = 2.0", "up_ramp_slowdown = 0.0");
        assert!(matches!(Config::parse(&bad_slowdown), Err(LoadError::Config(_))));

        let missing_section = "[matrix]\npath = \"m\"\nentry_operation = \"home\"\n";
        assert!(matches!(Config::parse(missing_section), Err(LoadError::Config(_))));

        let zero_limit = CONFIG.replace("max_transitions = 100", "max_transitions = 0");
        assert!(matches!(Config::parse(&zero_limit), Err(LoadError::Config(_))));
    }

    #[test]
    fn test_scheduler_settings_resolve_entry() {
        let config = Config::parse(CONFIG).unwrap();
        let matrix = TransitionMatrix::parse("from start home end think\nstart 0 1 0 0\nhome 0 0 1 0\n").unwrap();

        let settings = config.scheduler_settings(&matrix).unwrap();
        assert_eq!(settings.session.entry, 1);
        assert_eq!(settings.session.max_transitions, Some(100));
        assert_eq!(settings.join_timeout, Some(Duration::from_secs(5)));

        let other = TransitionMatrix::parse("from start end think\nstart 0 1 0\n").unwrap();
        assert!(matches!(
            config.scheduler_settings(&other),
            Err(LoadError::Config(_))
        ));
    }
}
