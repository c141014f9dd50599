//! Step orchestration.
//!
//! A `Workflow` is a declarative list of `Step`s. The `Orchestrator` runs
//! one workflow against one device: act, pause, verify, retry once, then
//! apply the step's `on_fail` policy. Every transition is reported as a
//! `StepEvent` and the run ends in exactly one terminal `RunState`.

pub mod orchestrator;
pub mod types;

pub use orchestrator::{MAX_BRANCH_VISITS, Orchestrator};
pub use types::{Action, DelayRange, OnFail, RunContext, Step, Workflow};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::device::ChannelError;
use crate::gesture::GestureError;
use crate::oracle::OracleError;
use crate::region::RegionError;

/// Cooperative cancellation shared between a run and its controller.
///
/// Checked between steps and at every oracle poll; a gesture that has
/// started always completes.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result type for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors that end a run or prevent it from starting
#[derive(Debug)]
pub enum WorkflowError {
    /// Malformed step (region, expectation, branch target, variable)
    InvalidStepDefinition { step_id: String, reason: String },
    /// Device channel failed while acting
    Channel(ChannelError),
    /// Oracle could not evaluate (missing template, recognizer down)
    Oracle(OracleError),
    /// Branch target does not exist
    UnknownStep(String),
    /// I/O error
    Io(std::io::Error),
    /// Serialization error
    Serialization(serde_json::Error),
}

impl WorkflowError {
    pub fn invalid(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        WorkflowError::InvalidStepDefinition {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowError::InvalidStepDefinition { step_id, reason } => {
                write!(f, "Invalid step '{}': {}", step_id, reason)
            }
            WorkflowError::Channel(err) => write!(f, "Channel error: {}", err),
            WorkflowError::Oracle(err) => write!(f, "Oracle error: {}", err),
            WorkflowError::UnknownStep(id) => write!(f, "Unknown step '{}'", id),
            WorkflowError::Io(err) => write!(f, "I/O error: {}", err),
            WorkflowError::Serialization(err) => write!(f, "Serialization error: {}", err),
        }
    }
}

impl std::error::Error for WorkflowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkflowError::Channel(err) => Some(err),
            WorkflowError::Oracle(err) => Some(err),
            WorkflowError::Io(err) => Some(err),
            WorkflowError::Serialization(err) => Some(err),
            WorkflowError::InvalidStepDefinition { .. } | WorkflowError::UnknownStep(_) => None,
        }
    }
}

impl From<ChannelError> for WorkflowError {
    fn from(err: ChannelError) -> Self {
        WorkflowError::Channel(err)
    }
}

impl From<OracleError> for WorkflowError {
    fn from(err: OracleError) -> Self {
        WorkflowError::Oracle(err)
    }
}

impl From<std::io::Error> for WorkflowError {
    fn from(err: std::io::Error) -> Self {
        WorkflowError::Io(err)
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Serialization(err)
    }
}

impl From<GestureError> for WorkflowError {
    fn from(err: GestureError) -> Self {
        WorkflowError::invalid("<gesture>", err.to_string())
    }
}

impl From<RegionError> for WorkflowError {
    fn from(err: RegionError) -> Self {
        WorkflowError::invalid("<region>", err.to_string())
    }
}
