//! Step state machine.
//!
//! ```text
//! Pending → Acting → Verifying → Succeeded
//!                        ↓
//!                    Retrying → Acting → Verifying → Succeeded | Exhausted
//! ```
//!
//! One orchestrator owns one device channel and runs one workflow at a time;
//! acting and verifying never overlap.

use std::collections::HashMap;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::types::{Action, DelayRange, OnFail, RunContext, Step, Workflow};
use super::{CancellationFlag, WorkflowError, WorkflowResult};
use crate::device::{ChannelError, DeviceChannel, keycode};
use crate::gesture::{swipe_within, synthesize_path_with_rng, synthesize_tap_with_rng};
use crate::oracle::{DetectionResult, Oracle};
use crate::region::Region;
use crate::runner::{LogReporter, RunReporter, RunState, RunSummary, StepEvent, StepOutcome, StepState};
use crate::snapshot::{CaptureBackend, DeviceBackend, SamplerConfig, ScreenSampler, save_frame};

/// A step may be entered at most this many times per run (branch loop guard)
pub const MAX_BRANCH_VISITS: u32 = 3;

/// Retry cycles per step never exceed this
const MAX_RETRY_CYCLES: u32 = 1;

/// How a single step ended
enum StepFlow {
    Succeeded,
    Exhausted,
    Skipped,
    Cancelled,
    Fatal(WorkflowError),
}

/// Event log of the run in progress
struct RunLog {
    run_id: String,
    events: Vec<StepEvent>,
    outcomes: Vec<StepOutcome>,
}

/// Runs workflows against one device
pub struct Orchestrator<C: DeviceChannel> {
    channel: C,
    oracle: Oracle,
    sampler_config: SamplerConfig,
    reporter: Box<dyn RunReporter>,
    cancel: CancellationFlag,
    evidence_dir: Option<PathBuf>,
    rng: StdRng,
}

impl<C: DeviceChannel> Orchestrator<C> {
    pub fn new(channel: C, oracle: Oracle) -> Self {
        Self {
            channel,
            oracle,
            sampler_config: SamplerConfig::default(),
            reporter: Box::new(LogReporter),
            cancel: CancellationFlag::new(),
            evidence_dir: None,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn reporter(mut self, reporter: impl RunReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn sampler_config(mut self, config: SamplerConfig) -> Self {
        self.sampler_config = config;
        self
    }

    /// Save a frame of the screen whenever a step exhausts its retry
    pub fn evidence_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.evidence_dir = Some(dir.into());
        self
    }

    /// Deterministic gestures and think-times
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn cancellation_flag(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Run `workflow` to a terminal state.
    ///
    /// Errors never escape: they end the run as `Aborted` and are recorded in
    /// the event log and the summary.
    pub fn run(&mut self, workflow: &Workflow, ctx: &mut RunContext) -> RunSummary {
        let started_at = Utc::now();
        let mut log = RunLog {
            run_id: ctx.run_id.clone(),
            events: Vec::new(),
            outcomes: Vec::new(),
        };
        ctx.merge_defaults(&workflow.vars);

        tracing::info!(
            run_id = %ctx.run_id,
            workflow = %workflow.name,
            device = %self.channel.id(),
            steps = workflow.steps.len(),
            "run started"
        );

        let mut visited = vec![false; workflow.steps.len()];
        let (state, error) = match workflow.validate() {
            Ok(()) => self.run_steps(workflow, ctx, &mut log, &mut visited),
            Err(e) => {
                let step_id = match &e {
                    WorkflowError::InvalidStepDefinition { step_id, .. } => step_id.clone(),
                    _ => "<workflow>".to_string(),
                };
                self.emit(&mut log, StepEvent::new(&ctx.run_id, &step_id, StepState::Failed, 0).message(e.to_string()));
                if let Some(index) = workflow.step_index(&step_id) {
                    visited[index] = true;
                    log.outcomes.push(outcome(&workflow.steps[index], StepState::Failed, 0, None));
                }
                (RunState::Aborted, Some(e.to_string()))
            }
        };

        for (step, _) in workflow.steps.iter().zip(&visited).filter(|(_, seen)| !**seen) {
            self.emit(
                &mut log,
                StepEvent::new(&ctx.run_id, &step.id, StepState::Skipped, 0).message("not reached"),
            );
            log.outcomes.push(StepOutcome {
                step_id: step.id.clone(),
                state: StepState::Skipped,
                attempts: 0,
                score: None,
                label: None,
            });
        }

        let summary = RunSummary {
            run_id: ctx.run_id.clone(),
            workflow: workflow.name.clone(),
            device: self.channel.id().to_string(),
            state,
            steps: log.outcomes,
            events: log.events,
            error,
            started_at,
            finished_at: Utc::now(),
        };
        self.reporter.on_summary(&summary);
        summary
    }

    fn run_steps(
        &mut self,
        workflow: &Workflow,
        ctx: &mut RunContext,
        log: &mut RunLog,
        visited: &mut [bool],
    ) -> (RunState, Option<String>) {
        let mut visits: HashMap<usize, u32> = HashMap::new();
        let mut degraded = false;
        let mut index = 0;

        while index < workflow.steps.len() {
            if self.cancel.is_cancelled() {
                tracing::warn!(run_id = %ctx.run_id, "run cancelled");
                return (RunState::Aborted, Some("cancelled".to_string()));
            }

            let step = &workflow.steps[index];
            let count = visits.entry(index).or_insert(0);
            *count += 1;
            if *count > MAX_BRANCH_VISITS {
                let reason = format!("step '{}' entered more than {} times", step.id, MAX_BRANCH_VISITS);
                self.emit(log, StepEvent::new(&ctx.run_id, &step.id, StepState::Failed, 0).message(&reason));
                return (RunState::Aborted, Some(reason));
            }
            visited[index] = true;

            match self.execute_step(step, ctx, log) {
                StepFlow::Succeeded | StepFlow::Skipped => index += 1,
                StepFlow::Cancelled => {
                    tracing::warn!(run_id = %ctx.run_id, step_id = %step.id, "run cancelled");
                    return (RunState::Aborted, Some("cancelled".to_string()));
                }
                StepFlow::Fatal(e) => return (RunState::Aborted, Some(e.to_string())),
                StepFlow::Exhausted => match &step.on_fail {
                    OnFail::AbortRun => {
                        return (RunState::Aborted, Some(format!("step '{}' exhausted", step.id)));
                    }
                    OnFail::ContinueAnyway => {
                        ctx.set_flag(step.id.clone(), "missed");
                        degraded = true;
                        index += 1;
                    }
                    OnFail::BranchTo(target) => {
                        degraded = true;
                        // Targets were checked by validate()
                        match workflow.step_index(target) {
                            Some(next) => {
                                tracing::info!(step_id = %step.id, target = %target, "branching");
                                index = next;
                            }
                            None => {
                                let e = WorkflowError::UnknownStep(target.clone());
                                return (RunState::Aborted, Some(e.to_string()));
                            }
                        }
                    }
                },
            }
        }

        if degraded {
            (RunState::PartiallyFailed, None)
        } else {
            (RunState::Completed, None)
        }
    }

    fn execute_step(&mut self, step: &Step, ctx: &RunContext, log: &mut RunLog) -> StepFlow {
        let run_id = ctx.run_id.clone();
        self.emit(log, StepEvent::new(&run_id, &step.id, StepState::Pending, 0));

        if let Some(flag) = &step.skip_if {
            if ctx.flag(flag).is_some() {
                self.emit(
                    log,
                    StepEvent::new(&run_id, &step.id, StepState::Skipped, 0).message(format!("flag '{}' set", flag)),
                );
                log.outcomes.push(outcome(step, StepState::Skipped, 0, None));
                return StepFlow::Skipped;
            }
        }

        let retries = if step.max_retries > MAX_RETRY_CYCLES {
            tracing::warn!(
                step_id = %step.id,
                requested = step.max_retries,
                allowed = MAX_RETRY_CYCLES,
                "max_retries clamped"
            );
            MAX_RETRY_CYCLES
        } else {
            step.max_retries
        };

        let expectation = match step.expectation.as_ref().map(|e| ctx.resolve_expectation(e)).transpose() {
            Ok(expectation) => expectation,
            Err(reason) => {
                let e = WorkflowError::invalid(&step.id, reason);
                self.emit(log, StepEvent::new(&run_id, &step.id, StepState::Failed, 0).message(e.to_string()));
                log.outcomes.push(outcome(step, StepState::Failed, 0, None));
                return StepFlow::Fatal(e);
            }
        };

        let mut attempt = 1u32;
        loop {
            self.pause(step.wait_before);

            let action = step.action_for_attempt(attempt);
            self.emit(
                log,
                StepEvent::new(&run_id, &step.id, StepState::Acting, attempt).message(action.kind()),
            );
            if let Err(e) = self.perform(action, ctx, &step.id) {
                tracing::error!(step_id = %step.id, attempt, error = %e, "action failed");
                self.emit(
                    log,
                    StepEvent::new(&run_id, &step.id, StepState::Failed, attempt).message(e.to_string()),
                );
                log.outcomes.push(outcome(step, StepState::Failed, attempt, None));
                return StepFlow::Fatal(e);
            }

            self.pause(step.wait_after);

            let Some(expectation) = &expectation else {
                self.emit(log, StepEvent::new(&run_id, &step.id, StepState::Succeeded, attempt));
                log.outcomes.push(outcome(step, StepState::Succeeded, attempt, None));
                return StepFlow::Succeeded;
            };

            if self.cancel.is_cancelled() {
                return self.cancelled(step, &run_id, attempt, log);
            }

            self.emit(
                log,
                StepEvent::new(&run_id, &step.id, StepState::Verifying, attempt).message(expectation.to_string()),
            );
            let region = step.region.unwrap_or_else(Region::full);
            let detection = {
                let mut sampler =
                    ScreenSampler::with_config(DeviceBackend::new(&mut self.channel), self.sampler_config.clone());
                self.oracle
                    .detect(&mut sampler, &region, expectation, step.timeout_duration(), &self.cancel)
            };
            let result = match detection {
                Ok(result) => result,
                Err(e) => {
                    let e = WorkflowError::from(e);
                    tracing::error!(step_id = %step.id, error = %e, "verification failed");
                    self.emit(
                        log,
                        StepEvent::new(&run_id, &step.id, StepState::Failed, attempt).message(e.to_string()),
                    );
                    log.outcomes.push(outcome(step, StepState::Failed, attempt, None));
                    return StepFlow::Fatal(e);
                }
            };

            if result.matched {
                self.emit(
                    log,
                    StepEvent::new(&run_id, &step.id, StepState::Succeeded, attempt)
                        .score(result.score)
                        .label(result.label.clone()),
                );
                log.outcomes.push(outcome(step, StepState::Succeeded, attempt, Some(&result)));
                return StepFlow::Succeeded;
            }

            if self.cancel.is_cancelled() {
                return self.cancelled(step, &run_id, attempt, log);
            }

            if attempt <= retries {
                self.emit(
                    log,
                    StepEvent::new(&run_id, &step.id, StepState::Retrying, attempt)
                        .score(result.score)
                        .message(format!("no match after {} polls", result.polls)),
                );
                attempt += 1;
                continue;
            }

            self.emit(
                log,
                StepEvent::new(&run_id, &step.id, StepState::Exhausted, attempt)
                    .score(result.score)
                    .message(format!("on_fail {:?}", step.on_fail)),
            );
            self.save_evidence(&run_id, step, &result);
            log.outcomes.push(outcome(step, StepState::Exhausted, attempt, Some(&result)));
            return StepFlow::Exhausted;
        }
    }

    fn cancelled(&mut self, step: &Step, run_id: &str, attempt: u32, log: &mut RunLog) -> StepFlow {
        self.emit(log, StepEvent::new(run_id, &step.id, StepState::Failed, attempt).message("cancelled"));
        log.outcomes.push(outcome(step, StepState::Failed, attempt, None));
        StepFlow::Cancelled
    }

    /// Execute one action. Every failure here is fatal for the run.
    fn perform(&mut self, action: &Action, ctx: &RunContext, step_id: &str) -> WorkflowResult<()> {
        let invalid = |reason: String| WorkflowError::invalid(step_id, reason);
        match action {
            Action::Tap { region } => {
                let (width, height) = self.channel.resolution()?;
                let point = synthesize_tap_with_rng(&mut self.rng, region, width, height)
                    .map_err(|e| invalid(e.to_string()))?;
                tracing::debug!(step_id, x = point.x, y = point.y, "tap");
                self.channel.tap(point)?;
            }
            Action::Swipe { from, to, duration_ms } => {
                let (width, height) = self.channel.resolution()?;
                let start = Region::fraction_to_pixels(from.0, from.1, width, height);
                let end = Region::fraction_to_pixels(to.0, to.1, width, height);
                let path = synthesize_path_with_rng(&mut self.rng, start, end, Duration::from_millis(*duration_ms))
                    .map_err(|e| invalid(e.to_string()))?;
                tracing::debug!(step_id, samples = path.len(), "swipe");
                self.channel.swipe(path)?;
            }
            Action::SwipeIn {
                region,
                direction,
                duration_ms,
                extend,
            } => {
                let (width, height) = self.channel.resolution()?;
                let (start, end) =
                    swipe_within(region, *direction, *extend, width, height).map_err(|e| invalid(e.to_string()))?;
                let path = synthesize_path_with_rng(&mut self.rng, start, end, Duration::from_millis(*duration_ms))
                    .map_err(|e| invalid(e.to_string()))?;
                tracing::debug!(step_id, ?direction, samples = path.len(), "swipe in region");
                self.channel.swipe(path)?;
            }
            Action::TypeText { text, clear_first } => {
                let text = ctx.substitute(text).map_err(invalid)?;
                if *clear_first {
                    self.channel.key(&[keycode::META_CTRL, keycode::A])?;
                    self.channel.key(&[keycode::DELETE])?;
                }
                tracing::debug!(step_id, chars = text.chars().count(), "type text");
                self.channel.type_text(&text)?;
            }
            Action::Key { codes } => {
                self.channel.key(codes)?;
            }
            Action::Shell { command } => {
                let command = ctx.substitute(command).map_err(invalid)?;
                let output = self.channel.shell(&command)?;
                if !output.success() {
                    return Err(WorkflowError::Channel(ChannelError::CommandFailed {
                        command,
                        exit_code: Some(output.exit_code),
                        stderr: output.stdout,
                    }));
                }
            }
            Action::Wait | Action::None => {}
        }
        Ok(())
    }

    fn pause(&mut self, range: DelayRange) {
        let delay = range.sample(&mut self.rng);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    fn save_evidence(&mut self, run_id: &str, step: &Step, result: &DetectionResult) {
        let Some(dir) = self.evidence_dir.clone() else {
            return;
        };
        let frame = match DeviceBackend::new(&mut self.channel).capture() {
            Ok(Some(frame)) => frame,
            _ => {
                tracing::debug!(step_id = %step.id, "no frame for evidence");
                return;
            }
        };
        let extra = serde_json::json!({
            "run_id": run_id,
            "step_id": step.id,
            "score": result.score,
            "region": step.region,
        });
        let name = format!("{}_exhausted", crate::session::sanitize_name(&step.id));
        match save_frame(&frame, &dir, &name, "device", Some(extra)) {
            Ok(record) => tracing::info!(step_id = %step.id, path = %record.image_path.display(), "saved evidence frame"),
            Err(e) => tracing::warn!(step_id = %step.id, error = %e, "failed to save evidence frame"),
        }
    }

    fn emit(&mut self, log: &mut RunLog, event: StepEvent) {
        debug_assert_eq!(event.run_id, log.run_id);
        self.reporter.on_event(&event);
        log.events.push(event);
    }
}

fn outcome(step: &Step, state: StepState, attempts: u32, result: Option<&DetectionResult>) -> StepOutcome {
    StepOutcome {
        step_id: step.id.clone(),
        state,
        attempts,
        score: result.map(|r| r.score),
        label: result.and_then(|r| r.label.clone()),
    }
}
