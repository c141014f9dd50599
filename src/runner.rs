//! Run outcome reporting: per-transition step events and terminal summaries.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State a step entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Acting,
    Verifying,
    Succeeded,
    Retrying,
    Exhausted,
    Skipped,
    /// Fatal error while acting or verifying
    Failed,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Exhausted | StepState::Skipped | StepState::Failed
        )
    }
}

/// Terminal state of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Completed,
    Aborted,
    PartiallyFailed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Completed => "Completed",
            RunState::Aborted => "Aborted",
            RunState::PartiallyFailed => "PartiallyFailed",
        };
        f.write_str(name)
    }
}

/// One step transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub run_id: String,
    pub step_id: String,
    pub state: StepState,
    /// 1-based action attempt; 0 before the first action
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl StepEvent {
    pub fn new(run_id: &str, step_id: &str, state: StepState, attempt: u32) -> Self {
        Self {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            state,
            attempt,
            score: None,
            label: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Final result for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub state: StepState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Terminal summary of a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub workflow: String,
    pub device: String,
    pub state: RunState,
    /// Outcomes in execution order; a step run again after a branch appears again
    pub steps: Vec<StepOutcome>,
    /// Full event log
    pub events: Vec<StepEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// Events for one step, in order
    pub fn events_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a StepEvent> + 'a {
        self.events.iter().filter(move |e| e.step_id == step_id)
    }

    /// Number of events for `step_id` in `state`
    pub fn count(&self, step_id: &str, state: StepState) -> usize {
        self.events_for(step_id).filter(|e| e.state == state).count()
    }

    pub fn outcome(&self, step_id: &str) -> Option<&StepOutcome> {
        self.steps.iter().rev().find(|o| o.step_id == step_id)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Sink for run events and summaries
///
/// Reporting must not fail a run: implementations log their own I/O
/// problems instead of returning them.
pub trait RunReporter: Send {
    fn on_event(&mut self, event: &StepEvent);

    fn on_summary(&mut self, summary: &RunSummary);
}

/// Reporter that writes to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl RunReporter for LogReporter {
    fn on_event(&mut self, event: &StepEvent) {
        tracing::info!(
            run_id = %event.run_id,
            step_id = %event.step_id,
            state = ?event.state,
            attempt = event.attempt,
            score = ?event.score,
            label = ?event.label,
            message = ?event.message,
            "step transition"
        );
    }

    fn on_summary(&mut self, summary: &RunSummary) {
        let level_ok = summary.state == RunState::Completed;
        if level_ok {
            tracing::info!(
                run_id = %summary.run_id,
                workflow = %summary.workflow,
                device = %summary.device,
                state = %summary.state,
                steps = summary.steps.len(),
                "run finished"
            );
        } else {
            tracing::warn!(
                run_id = %summary.run_id,
                workflow = %summary.workflow,
                device = %summary.device,
                state = %summary.state,
                steps = summary.steps.len(),
                error = ?summary.error,
                "run finished"
            );
        }
    }
}

/// In-memory reporter; clones share the same buffers
#[derive(Debug, Default, Clone)]
pub struct MemoryReporter {
    events: Arc<Mutex<Vec<StepEvent>>>,
    summaries: Arc<Mutex<Vec<RunSummary>>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StepEvent> {
        self.events.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        self.summaries.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl RunReporter for MemoryReporter {
    fn on_event(&mut self, event: &StepEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }

    fn on_summary(&mut self, summary: &RunSummary) {
        if let Ok(mut summaries) = self.summaries.lock() {
            summaries.push(summary.clone());
        }
    }
}

/// Appends events to `events.jsonl` and writes `summary.json` in a directory
pub struct JsonlReporter {
    dir: PathBuf,
    events: Option<File>,
}

impl JsonlReporter {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.jsonl"))?;
        Ok(Self {
            dir,
            events: Some(events),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("summary.json")
    }
}

impl RunReporter for JsonlReporter {
    fn on_event(&mut self, event: &StepEvent) {
        let Some(file) = self.events.as_mut() else {
            return;
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize step event");
                return;
            }
        };
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::warn!(error = %e, path = %self.dir.display(), "failed to append step event");
        }
    }

    fn on_summary(&mut self, summary: &RunSummary) {
        let result = serde_json::to_string_pretty(summary)
            .map_err(std::io::Error::other)
            .and_then(|json| fs::write(self.summary_path(), json));
        if let Err(e) = result {
            tracing::warn!(error = %e, path = %self.dir.display(), "failed to write run summary");
        }
    }
}

/// Forwards to several reporters in order
#[derive(Default)]
pub struct FanoutReporter {
    reporters: Vec<Box<dyn RunReporter>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: impl RunReporter + 'static) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl RunReporter for FanoutReporter {
    fn on_event(&mut self, event: &StepEvent) {
        for reporter in &mut self.reporters {
            reporter.on_event(event);
        }
    }

    fn on_summary(&mut self, summary: &RunSummary) {
        for reporter in &mut self.reporters {
            reporter.on_summary(summary);
        }
    }
}
