//! Touch Vision - perceptual UI automation for touchscreen devices.
//!
//! The engine drives a device it can only see through screenshots:
//! - `gesture` synthesizes human-like swipes and taps
//! - `snapshot` samples the screen and crops fractional regions
//! - `oracle` decides from pixels whether an expected state is visible
//! - `workflow` runs declarative steps with bounded retry and `on_fail` policies
//! - `device` abstracts the control channel (adb, or a scripted stand-in)
//! - `runner` and `session` report and persist run outcomes
//!
//! # Example
//!
//! ```rust,no_run
//! use touch_vision::device::AdbChannel;
//! use touch_vision::oracle::Oracle;
//! use touch_vision::workflow::{Orchestrator, RunContext, Workflow};
//!
//! let workflow = Workflow::from_json_file("workflow.json").unwrap();
//! let channel = AdbChannel::for_serial("emulator-5554");
//! let mut orchestrator = Orchestrator::new(channel, Oracle::tesseract());
//! let summary = orchestrator.run(&workflow, &mut RunContext::for_device("emulator-5554"));
//! println!("{}", summary.state);
//! ```

pub mod config;
pub mod device;
pub mod gesture;
pub mod logging;
pub mod oracle;
pub mod region;
pub mod runner;
pub mod session;
pub mod snapshot;
pub mod workflow;

// Re-export geometry and gestures
pub use gesture::{GestureError, GesturePath, PathSample, SwipeDirection, synthesize_path, synthesize_tap};
pub use region::{PixelRect, Point, Region, RegionError};

// Re-export device channel types
pub use device::{AdbChannel, ChannelError, DeviceChannel, ScriptedDevice, ShellOutput};

// Re-export snapshot types and backends
pub use snapshot::{
    CaptureBackend, DeviceBackend, Frame, MockFramebuffer, SamplerConfig, ScreenSampler, SnapshotError,
    SnapshotResult,
};

// Re-export oracle types
pub use oracle::{DetectionResult, Expectation, Oracle, OracleConfig, OracleError, TextRecognizer};

// Re-export workflow and reporting
pub use runner::{RunReporter, RunState, RunSummary, StepEvent, StepOutcome, StepState};
pub use workflow::{
    Action, CancellationFlag, OnFail, Orchestrator, RunContext, Step, Workflow, WorkflowError, WorkflowResult,
};

// Re-export session management
pub use session::{Session, cleanup_old_sessions, list_sessions};
