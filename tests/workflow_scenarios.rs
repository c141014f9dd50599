//! End-to-end workflow runs against a scripted device.
//!
//! The recognizer used here "reads" a frame by counting dark pixels, so the
//! verdict depends on what the scripted device actually renders.

use std::thread;
use std::time::{Duration, Instant};

use image::GrayImage;
use pretty_assertions::assert_eq;
use touch_vision::device::{DeviceAction, ScriptedDevice};
use touch_vision::oracle::{Expectation, Oracle, OracleConfig, RecognizedText, ScriptedRecognizer};
use touch_vision::region::Region;
use touch_vision::runner::{JsonlReporter, MemoryReporter, RunState, StepEvent, StepState};
use touch_vision::snapshot::MockFramebuffer;
use touch_vision::workflow::{Action, OnFail, Orchestrator, RunContext, Step, Workflow};

const WIDTH: u32 = 200;
const HEIGHT: u32 = 400;

fn blank_screen() -> Vec<u8> {
    MockFramebuffer::with_color(WIDTH, HEIGHT, [255, 255, 255]).to_png().unwrap()
}

/// Category picker: the word "Other" in the upper area, a dense listing grid below
fn category_screen() -> Vec<u8> {
    let palette = [
        [230, 40, 40],
        [40, 160, 60],
        [30, 60, 200],
        [240, 200, 30],
        [20, 20, 20],
        [250, 250, 250],
        [150, 60, 180],
        [0, 170, 170],
    ];
    let mut fb = MockFramebuffer::with_color(WIDTH, HEIGHT, [255, 255, 255]);
    fb.draw_text_scaled(40, 100, "Other", [0, 0, 0], [255, 255, 255], 3);
    for row in 0..20u32 {
        let bg = palette[(row as usize + 3) % palette.len()];
        let fg = palette[row as usize % palette.len()];
        fb.draw_rect(0, 200 + row * 10, WIDTH, 10, bg);
        fb.draw_text(2, 200 + row * 10 + 1, "Lorem ipsum 42 dolor", fg, bg);
    }
    fb.to_png().unwrap()
}

/// Recognizes "Other" whenever more than 1% of the pixels are dark
fn pixel_reader(gray: &GrayImage) -> Vec<RecognizedText> {
    let total = (gray.width() * gray.height()).max(1) as f64;
    let dark = gray.pixels().filter(|p| p.0[0] < 100).count() as f64;
    if dark / total > 0.01 {
        vec![RecognizedText::new("Other", 0.92)]
    } else {
        Vec::new()
    }
}

fn quick_config() -> OracleConfig {
    OracleConfig::default().poll_interval(Duration::from_millis(20))
}

fn text_region() -> Region {
    Region::new(0.1, 0.9, 0.2, 0.35).unwrap()
}

fn listing_region() -> Region {
    Region::new(0.0, 1.0, 0.5, 1.0).unwrap()
}

fn states(events: &[StepEvent], step_id: &str) -> Vec<StepState> {
    events.iter().filter(|e| e.step_id == step_id).map(|e| e.state).collect()
}

#[test]
fn test_category_appears_after_retry_tap() {
    let device = ScriptedDevice::new("emulator-5554", WIDTH, HEIGHT, blank_screen()).screen_after(2, category_screen());
    let log = device.log();
    let reporter = MemoryReporter::new();
    let oracle = Oracle::with_config(Box::new(pixel_reader), quick_config());
    let mut orchestrator = Orchestrator::new(device, oracle).reporter(reporter.clone()).seed(11);

    let workflow = Workflow::new(
        "pick category",
        vec![
            Step::new("open_category", Action::tap(Region::new(0.1, 0.3, 0.05, 0.1).unwrap()))
                .expect(text_region(), Expectation::text("Other"))
                .timeout(Duration::from_millis(300)),
            Step::new("open_listing", Action::tap(Region::new(0.4, 0.6, 0.6, 0.7).unwrap()))
                .expect(listing_region(), Expectation::content().with_threshold(0.3))
                .timeout(Duration::from_millis(300)),
        ],
    );
    let summary = orchestrator.run(&workflow, &mut RunContext::new("run-1"));

    assert_eq!(summary.state, RunState::Completed, "{:?}", summary.error);
    assert_eq!(summary.count("open_category", StepState::Verifying), 2);
    assert_eq!(summary.count("open_category", StepState::Retrying), 1);
    assert_eq!(summary.count("open_listing", StepState::Verifying), 1);
    assert_eq!(summary.outcome("open_category").unwrap().attempts, 2);
    assert_eq!(summary.outcome("open_listing").unwrap().label.as_deref(), Some("content"));
    assert_eq!(log.taps().len(), 3);
    assert_eq!(reporter.events(), summary.events);
    assert_eq!(reporter.summaries().len(), 1);
}

#[test]
fn test_exhausted_step_aborts_before_next_action() {
    let device = ScriptedDevice::new("dev", WIDTH, HEIGHT, blank_screen());
    let log = device.log();
    let oracle = Oracle::with_config(Box::new(ScriptedRecognizer::new()), quick_config());
    let mut orchestrator = Orchestrator::new(device, oracle);

    let workflow = Workflow::new(
        "abort",
        vec![
            Step::new("open", Action::tap(Region::new(0.1, 0.2, 0.1, 0.2).unwrap()))
                .expect(Region::full(), Expectation::text("Sell"))
                .timeout(Duration::from_millis(60)),
            Step::new("publish", Action::tap(Region::new(0.8, 0.9, 0.8, 0.9).unwrap())),
        ],
    );
    let summary = orchestrator.run(&workflow, &mut RunContext::new("run-2"));

    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(
        states(&summary.events, "open"),
        vec![
            StepState::Pending,
            StepState::Acting,
            StepState::Verifying,
            StepState::Retrying,
            StepState::Acting,
            StepState::Verifying,
            StepState::Exhausted,
        ]
    );
    assert_eq!(summary.count("publish", StepState::Acting), 0);
    assert_eq!(summary.outcome("publish").unwrap().state, StepState::Skipped);
    // Two taps for "open", none for "publish"
    assert_eq!(log.taps().len(), 2);
}

#[test]
fn test_retry_is_bounded_to_one_cycle() {
    let device = ScriptedDevice::new("dev", WIDTH, HEIGHT, blank_screen());
    let oracle = Oracle::with_config(Box::new(ScriptedRecognizer::new()), quick_config());
    let mut orchestrator = Orchestrator::new(device, oracle);

    let step = Step::new("stubborn", Action::Wait)
        .expect(Region::full(), Expectation::any_text())
        .timeout(Duration::from_millis(30))
        .max_retries(5)
        .on_fail(OnFail::ContinueAnyway);
    let summary = orchestrator.run(&Workflow::new("bounded", vec![step]), &mut RunContext::new("run-3"));

    assert_eq!(summary.state, RunState::PartiallyFailed);
    assert_eq!(summary.count("stubborn", StepState::Acting), 2);
    assert_eq!(summary.count("stubborn", StepState::Verifying), 2);
    assert_eq!(summary.count("stubborn", StepState::Exhausted), 1);
}

#[test]
fn test_capture_gaps_are_not_failures() {
    let device = ScriptedDevice::new("dev", WIDTH, HEIGHT, category_screen()).capture_gaps(3);
    let oracle = Oracle::with_config(Box::new(ScriptedRecognizer::new()), quick_config());
    let mut orchestrator = Orchestrator::new(device, oracle);

    let step = Step::new("wait_feed", Action::None)
        .expect(listing_region(), Expectation::content().with_threshold(0.3))
        .timeout(Duration::from_secs(2));
    let summary = orchestrator.run(&Workflow::new("gaps", vec![step]), &mut RunContext::new("run-4"));

    assert_eq!(summary.state, RunState::Completed, "{:?}", summary.error);
    assert_eq!(summary.count("wait_feed", StepState::Verifying), 1);
    assert!(orchestrator.channel().screenshots_taken() >= 4);
}

#[test]
fn test_cancel_from_another_thread_stops_run() {
    let device = ScriptedDevice::new("dev", WIDTH, HEIGHT, blank_screen());
    let oracle = Oracle::with_config(Box::new(ScriptedRecognizer::new()), quick_config());
    let mut orchestrator = Orchestrator::new(device, oracle);
    let cancel = orchestrator.cancellation_flag();

    let workflow = Workflow::new(
        "long",
        vec![
            Step::new("wait", Action::Wait)
                .expect(Region::full(), Expectation::text("never"))
                .timeout(Duration::from_secs(10)),
            Step::new("after", Action::Wait),
        ],
    );

    let started = Instant::now();
    let handle = thread::spawn(move || orchestrator.run(&workflow, &mut RunContext::new("run-5")));
    thread::sleep(Duration::from_millis(100));
    cancel.cancel();
    let summary = handle.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.state, RunState::Aborted);
    assert_eq!(summary.error.as_deref(), Some("cancelled"));
    assert_eq!(summary.count("after", StepState::Acting), 0);

    let wait = summary.outcome("wait").unwrap();
    assert_eq!(wait.state, StepState::Failed);
    assert_eq!(wait.attempts, 1);
    assert_eq!(summary.count("wait", StepState::Failed), 1);
    assert_eq!(summary.outcome("after").unwrap().state, StepState::Skipped);
}

#[test]
fn test_continue_anyway_lets_later_steps_skip() {
    let device = ScriptedDevice::new("dev", WIDTH, HEIGHT, blank_screen());
    let log = device.log();
    let oracle = Oracle::with_config(Box::new(ScriptedRecognizer::new()), quick_config());
    let mut orchestrator = Orchestrator::new(device, oracle);

    let workflow = Workflow::new(
        "optional popup",
        vec![
            Step::new("popup", Action::Wait)
                .expect(Region::full(), Expectation::text("Got it"))
                .timeout(Duration::from_millis(20))
                .max_retries(0)
                .on_fail(OnFail::ContinueAnyway),
            Step::new("dismiss", Action::tap(Region::new(0.4, 0.6, 0.4, 0.6).unwrap())).skip_if("popup"),
            Step::new("type", Action::type_text("{title}")),
        ],
    );
    let mut ctx = RunContext::new("run-6").with_var("title", "Desk lamp");
    let summary = orchestrator.run(&workflow, &mut ctx);

    assert_eq!(summary.state, RunState::PartiallyFailed);
    assert_eq!(summary.outcome("dismiss").unwrap().state, StepState::Skipped);
    assert_eq!(log.snapshot(), vec![DeviceAction::TypeText("Desk lamp".into())]);
}

#[test]
fn test_demo_workflow_parses_and_validates() {
    let workflow = Workflow::from_json_str(include_str!("../demos/marketplace_listing.json")).unwrap();
    workflow.validate().unwrap();
    assert_eq!(workflow.steps.len(), 6);
    assert_eq!(workflow.steps[2].on_fail, OnFail::ContinueAnyway);
    assert_eq!(workflow.steps[5].on_fail, OnFail::BranchTo("title".into()));
    assert_eq!(workflow.vars.get("category").map(String::as_str), Some("Other"));
    assert_eq!(workflow.vars.get("title").map(String::as_str), Some("Desk lamp"));

    // Defaults alone must resolve every placeholder
    let mut ctx = RunContext::new("demo");
    ctx.merge_defaults(&workflow.vars);
    for step in &workflow.steps {
        if let Action::TypeText { text, .. } = &step.action {
            assert!(ctx.substitute(text).is_ok(), "step '{}' has an undefined variable", step.id);
        }
    }
}

#[test]
fn test_jsonl_event_log_matches_summary() {
    let dir = tempfile::tempdir().unwrap();
    let device = ScriptedDevice::new("dev", WIDTH, HEIGHT, blank_screen());
    let oracle = Oracle::with_config(Box::new(ScriptedRecognizer::new()), quick_config());
    let reporter = JsonlReporter::new(dir.path().join("run-7")).unwrap();
    let summary_path = reporter.summary_path();
    let mut orchestrator = Orchestrator::new(device, oracle)
        .reporter(reporter)
        .evidence_dir(dir.path().join("run-7"));

    let step = Step::new("missing", Action::Wait)
        .expect(Region::full(), Expectation::any_text())
        .timeout(Duration::from_millis(20))
        .max_retries(0);
    let summary = orchestrator.run(&Workflow::new("logged", vec![step]), &mut RunContext::new("run-7"));

    let lines = std::fs::read_to_string(dir.path().join("run-7/events.jsonl")).unwrap();
    let logged: Vec<StepEvent> = lines.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(logged.len(), summary.events.len());
    assert_eq!(logged.last().unwrap().state, StepState::Exhausted);
    assert!(summary_path.exists());
    assert!(dir.path().join("run-7/missing_exhausted.png").exists());
}
