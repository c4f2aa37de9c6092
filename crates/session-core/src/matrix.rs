//! Transition model for emulated browser sessions.
//!
//! The matrix is read from a whitespace separated text table (the layout a
//! spreadsheet "export as text" produces):
//!
//! ```text
//! # comments and blank lines are ignored
//! from       home  browse  view_item  end   think_ms
//! home       0.0   0.7     0.2        0.1   500
//! browse     0.1   0.3     0.5        0.1   800
//! view_item  0.2   0.4     0.2        0.2   1200
//! ```
//!
//! The header names a corner cell, the K operations, the terminal column and
//! the think-time column. Each of the K rows that follow lists the
//! probability of moving to every operation, the probability of ending the
//! session, and the mean think time in milliseconds spent after leaving it.

use crate::error::LoadError;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Index of an operation in the matrix, `0..K`.
pub type OperationId = usize;

/// Allowed deviation of a row sum from 1.0.
pub const DEFAULT_TOLERANCE: f64 = 1e-3;

/// Exponential think times are capped at this multiple of the row mean.
pub const THINK_TIME_CAP_FACTOR: f64 = 10.0;

/// Longest single pause a worker will take, after any slowdown.
pub const MAX_THINK_TIME: Duration = Duration::from_secs(24 * 60 * 60);

const MAX_DRAW: f64 = 1.0 - f64::EPSILON;
const DRIFT_REPORT_THRESHOLD: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextOperation {
    Operation(OperationId),
    Terminal,
}

/// How think time is derived from a row's think-time parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkTimePolicy {
    /// Negative exponential around the row mean, capped at
    /// [`THINK_TIME_CAP_FACTOR`] times the mean.
    #[default]
    Exponential,
    /// The row value, as is (TPC-W style deterministic pauses).
    Fixed,
}

/// Diagnostics produced by [`TransitionMatrix::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixWarning {
    RowSumDrift { operation: String, sum: f64 },
    Unreachable { operation: String },
    NoTerminalPath { operation: String },
}

impl fmt::Display for MatrixWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixWarning::RowSumDrift { operation, sum } => {
                write!(f, "row {operation} sums to {sum:.6}")
            }
            MatrixWarning::Unreachable { operation } => {
                write!(f, "{operation} is unreachable from the entry operation")
            }
            MatrixWarning::NoTerminalPath { operation } => {
                write!(f, "sessions entering {operation} can never end")
            }
        }
    }
}

/// Immutable, shareable transition table.
#[derive(Debug, Clone)]
pub struct TransitionMatrix {
    operations: Vec<String>,
    terminal_label: String,
    think_label: String,
    /// K rows of K+1 entries; the last entry is the terminal outcome.
    probabilities: Vec<Vec<f64>>,
    cumulative: Vec<Vec<f64>>,
    think_ms: Vec<f64>,
}

impl TransitionMatrix {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        Self::load_with_tolerance(path, DEFAULT_TOLERANCE)
    }

    pub fn load_with_tolerance(path: impl AsRef<Path>, tolerance: f64) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| LoadError::io(path, e))?;
        Self::parse_with_tolerance(&contents, tolerance)
    }

    pub fn parse(input: &str) -> Result<Self, LoadError> {
        Self::parse_with_tolerance(input, DEFAULT_TOLERANCE)
    }

    pub fn parse_with_tolerance(input: &str, tolerance: f64) -> Result<Self, LoadError> {
        let mut lines = input
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let (_, header) = lines
            .next()
            .ok_or_else(|| LoadError::matrix("matrix source is empty"))?;
        let header: Vec<&str> = header.split_whitespace().collect();
        if header.len() < 4 {
            return Err(LoadError::matrix(
                "header must name a corner cell, at least one operation, a terminal column and a think-time column",
            ));
        }

        let k = header.len() - 3;
        let operations: Vec<String> = header[1..=k].iter().map(|s| s.to_string()).collect();
        let mut seen = HashSet::new();
        for op in &operations {
            if !seen.insert(op.as_str()) {
                return Err(LoadError::matrix(format!("operation {op:?} is listed twice")));
            }
        }

        let mut probabilities = Vec::with_capacity(k);
        let mut think_ms = Vec::with_capacity(k);

        for (line_no, line) in lines {
            let row = probabilities.len();
            if row == k {
                return Err(LoadError::matrix(format!(
                    "line {line_no}: more than {k} rows for {k} operations"
                )));
            }

            let cells: Vec<&str> = line.split_whitespace().collect();
            if cells[0] != operations[row] {
                return Err(LoadError::matrix(format!(
                    "line {line_no}: expected row {:?}, found {:?}",
                    operations[row], cells[0]
                )));
            }
            if cells.len() != k + 3 {
                return Err(LoadError::matrix(format!(
                    "line {line_no}: row {:?} has {} values, expected {}",
                    cells[0],
                    cells.len() - 1,
                    k + 2
                )));
            }

            let values = cells[1..]
                .iter()
                .map(|cell| parse_cell(cell, line_no))
                .collect::<Result<Vec<f64>, LoadError>>()?;
            let (probs, think) = values.split_at(k + 1);

            if let Some(p) = probs.iter().find(|p| **p < 0.0) {
                return Err(LoadError::matrix(format!(
                    "line {line_no}: row {:?} has negative probability {p}",
                    cells[0]
                )));
            }
            let sum: f64 = probs.iter().sum();
            if (sum - 1.0).abs() > tolerance {
                return Err(LoadError::matrix(format!(
                    "line {line_no}: row {:?} sums to {sum:.6}, expected 1",
                    cells[0]
                )));
            }
            if think[0] < 0.0 {
                return Err(LoadError::matrix(format!(
                    "line {line_no}: row {:?} has negative think time {}",
                    cells[0], think[0]
                )));
            }

            probabilities.push(probs.to_vec());
            think_ms.push(think[0]);
        }

        if probabilities.len() != k {
            return Err(LoadError::matrix(format!(
                "{} rows for {k} operations, matrix is not square",
                probabilities.len()
            )));
        }

        let cumulative = probabilities.iter().map(|row| cumulative_row(row)).collect();

        Ok(Self {
            operations,
            terminal_label: header[k + 1].to_string(),
            think_label: header[k + 2].to_string(),
            probabilities,
            cumulative,
            think_ms,
        })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[String] {
        &self.operations
    }

    pub fn operation_id(&self, name: &str) -> Option<OperationId> {
        self.operations.iter().position(|op| op == name)
    }

    pub fn operation_name(&self, id: OperationId) -> &str {
        &self.operations[id]
    }

    pub fn probability(&self, from: OperationId, to: NextOperation) -> f64 {
        match to {
            NextOperation::Operation(id) => self.probabilities[from][id],
            NextOperation::Terminal => self.probabilities[from][self.len()],
        }
    }

    pub fn think_ms(&self, id: OperationId) -> f64 {
        self.think_ms[id]
    }

    /// Inverse-CDF sampling of the next operation.
    ///
    /// Pure in `(self, current, draw)`. Draws outside `[0, 1)` are clamped.
    ///
    /// # Panics
    ///
    /// Panics if `current` is not an operation of this matrix.
    pub fn sample_next(&self, current: OperationId, draw: f64) -> NextOperation {
        let draw = clamp_draw(draw);
        let row = &self.cumulative[current];
        let idx = row
            .iter()
            .position(|c| *c > draw)
            .unwrap_or(row.len() - 1);

        if idx == self.len() {
            NextOperation::Terminal
        } else {
            NextOperation::Operation(idx)
        }
    }

    /// Think time spent after leaving `operation`, before any slowdown.
    pub fn sample_think_time(
        &self,
        operation: OperationId,
        draw: f64,
        policy: ThinkTimePolicy,
    ) -> Duration {
        let mean = self.think_ms[operation];
        let ms = match policy {
            ThinkTimePolicy::Fixed => mean,
            ThinkTimePolicy::Exponential => {
                let sample = -mean * (1.0 - clamp_draw(draw)).ln();
                sample.min(mean * THINK_TIME_CAP_FACTOR)
            }
        };
        saturating_think_time(ms / 1000.0)
    }

    /// Diagnostics relative to the first operation.
    pub fn validate(&self) -> Vec<MatrixWarning> {
        self.validate_from(0)
    }

    /// Diagnostics for display only; the matrix is never changed.
    pub fn validate_from(&self, entry: OperationId) -> Vec<MatrixWarning> {
        let mut warnings = Vec::new();
        let k = self.len();

        for (id, row) in self.probabilities.iter().enumerate() {
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > DRIFT_REPORT_THRESHOLD {
                warnings.push(MatrixWarning::RowSumDrift {
                    operation: self.operations[id].clone(),
                    sum,
                });
            }
        }

        let mut reachable = vec![false; k];
        let mut queue = VecDeque::new();
        if entry < k {
            reachable[entry] = true;
            queue.push_back(entry);
        }
        while let Some(from) = queue.pop_front() {
            for to in 0..k {
                if self.probabilities[from][to] > 0.0 && !reachable[to] {
                    reachable[to] = true;
                    queue.push_back(to);
                }
            }
        }
        for (id, seen) in reachable.iter().enumerate() {
            if !seen {
                warnings.push(MatrixWarning::Unreachable {
                    operation: self.operations[id].clone(),
                });
            }
        }

        // Walk backwards from the terminal column.
        let mut ends = vec![false; k];
        let mut queue: VecDeque<OperationId> = (0..k)
            .filter(|id| self.probabilities[*id][k] > 0.0)
            .collect();
        for id in &queue {
            ends[*id] = true;
        }
        while let Some(to) = queue.pop_front() {
            for from in 0..k {
                if self.probabilities[from][to] > 0.0 && !ends[from] {
                    ends[from] = true;
                    queue.push_back(from);
                }
            }
        }
        for (id, ok) in ends.iter().enumerate() {
            if !ok {
                warnings.push(MatrixWarning::NoTerminalPath {
                    operation: self.operations[id].clone(),
                });
            }
        }

        warnings
    }
}

impl fmt::Display for TransitionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name_width = self
            .operations
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max(4);
        let col_width = name_width.max(self.terminal_label.len()).max(self.think_label.len()).max(8);

        write!(f, "{:<name_width$}", "")?;
        for op in &self.operations {
            write!(f, " {op:>col_width$}")?;
        }
        writeln!(
            f,
            " {:>col_width$} {:>col_width$}",
            self.terminal_label, self.think_label
        )?;

        for (id, row) in self.probabilities.iter().enumerate() {
            write!(f, "{:<name_width$}", self.operations[id])?;
            for p in row {
                write!(f, " {p:>col_width$.4}")?;
            }
            writeln!(f, " {:>col_width$.0}", self.think_ms[id])?;
        }
        Ok(())
    }
}

/// Seconds to a pause, saturating at [`MAX_THINK_TIME`].
pub(crate) fn saturating_think_time(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0))
        .map_or(MAX_THINK_TIME, |d| d.min(MAX_THINK_TIME))
}

fn parse_cell(cell: &str, line_no: usize) -> Result<f64, LoadError> {
    let value: f64 = cell
        .parse()
        .map_err(|_| LoadError::matrix(format!("line {line_no}: {cell:?} is not a number")))?;
    if !value.is_finite() {
        return Err(LoadError::matrix(format!(
            "line {line_no}: {cell:?} is not a finite number"
        )));
    }
    Ok(value)
}

fn cumulative_row(probs: &[f64]) -> Vec<f64> {
    let mut acc = 0.0;
    let mut cumulative: Vec<f64> = probs
        .iter()
        .map(|p| {
            acc += p;
            acc
        })
        .collect();

    // Rounding must never leave a gap below 1.0 after the last live entry.
    if let Some(last) = probs.iter().rposition(|p| *p > 0.0) {
        for c in &mut cumulative[last..] {
            *c = 1.0;
        }
    }
    cumulative
}

fn clamp_draw(draw: f64) -> f64 {
    if draw.is_nan() {
        0.0
    } else {
        draw.clamp(0.0, MAX_DRAW)
    }
}
