use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{WorkflowError, WorkflowResult};
use crate::gesture::SwipeDirection;
use crate::oracle::Expectation;
use crate::region::Region;

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    1
}

fn default_swipe_ms() -> u64 {
    400
}

/// Randomized think-time, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn is_zero(&self) -> bool {
        self.max_ms == 0
    }

    /// Uniform pick inside the range. A degenerate non-zero range gets
    /// ±10% so pauses never repeat exactly.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.is_zero() {
            return Duration::ZERO;
        }
        let (lo, hi) = if self.min_ms == self.max_ms {
            let spread = (self.min_ms / 10).max(1);
            (self.min_ms.saturating_sub(spread), self.max_ms + spread)
        } else {
            (self.min_ms, self.max_ms)
        };
        Duration::from_millis(rng.gen_range(lo..=hi))
    }
}

/// What a step does to the device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Human-like tap inside a region
    Tap { region: Region },
    /// Curved swipe between two fractional screen points
    Swipe {
        from: (f64, f64),
        to: (f64, f64),
        #[serde(default = "default_swipe_ms")]
        duration_ms: u64,
    },
    /// Vertical swipe along a region's centre line
    SwipeIn {
        region: Region,
        direction: SwipeDirection,
        #[serde(default = "default_swipe_ms")]
        duration_ms: u64,
        /// Extra travel past the region edge, as a fraction of screen height
        #[serde(default)]
        extend: f64,
    },
    /// Type text; `{name}` is replaced by the run variable `name`
    TypeText {
        text: String,
        /// Select-all + delete before typing
        #[serde(default)]
        clear_first: bool,
    },
    /// Key event(s); several codes are sent as a chord
    Key { codes: Vec<u32> },
    /// Shell command on the device; non-zero exit fails the step
    Shell { command: String },
    /// Think-time only
    Wait,
    /// Verification only
    #[default]
    None,
}

impl Action {
    pub fn tap(region: Region) -> Self {
        Action::Tap { region }
    }

    pub fn type_text(text: impl Into<String>) -> Self {
        Action::TypeText {
            text: text.into(),
            clear_first: false,
        }
    }

    /// Short name for logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Tap { .. } => "tap",
            Action::Swipe { .. } => "swipe",
            Action::SwipeIn { .. } => "swipe_in",
            Action::TypeText { .. } => "type_text",
            Action::Key { .. } => "key",
            Action::Shell { .. } => "shell",
            Action::Wait => "wait",
            Action::None => "none",
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let unit_point = |name: &str, (x, y): (f64, f64)| {
            if (0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y) {
                Ok(())
            } else {
                Err(format!("{} point ({}, {}) outside [0,1]", name, x, y))
            }
        };
        match self {
            Action::Tap { region } => region.validate().map_err(|e| e.to_string()),
            Action::Swipe { from, to, duration_ms } => {
                unit_point("from", *from)?;
                unit_point("to", *to)?;
                if *duration_ms == 0 {
                    return Err("swipe duration is zero".to_string());
                }
                Ok(())
            }
            Action::SwipeIn {
                region,
                duration_ms,
                extend,
                ..
            } => {
                region.validate().map_err(|e| e.to_string())?;
                if *duration_ms == 0 {
                    return Err("swipe duration is zero".to_string());
                }
                if !(0.0..=1.0).contains(extend) {
                    return Err(format!("swipe extend {} outside [0,1]", extend));
                }
                Ok(())
            }
            Action::Key { codes } if codes.is_empty() => Err("key action has no codes".to_string()),
            Action::Shell { command } if command.trim().is_empty() => Err("shell command is empty".to_string()),
            _ => Ok(()),
        }
    }
}

/// Policy applied when a step exhausts its retry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFail {
    /// End the run as `Aborted`
    #[default]
    AbortRun,
    /// Record the miss and move on (advisory expectation)
    ContinueAnyway,
    /// Jump to another step
    BranchTo(String),
}

/// A declarative unit of work: act, pause, verify
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub action: Action,
    /// Verification region, full screen when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectation: Option<Expectation>,
    #[serde(default)]
    pub wait_before: DelayRange,
    #[serde(default)]
    pub wait_after: DelayRange,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retry cycles after a failed verification (at most one is honoured)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Action re-run on retry, e.g. a refresh control; defaults to `action`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_action: Option<Action>,
    #[serde(default)]
    pub on_fail: OnFail,
    /// Skip this step when the named run flag is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            action,
            region: None,
            expectation: None,
            wait_before: DelayRange::default(),
            wait_after: DelayRange::default(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_action: None,
            on_fail: OnFail::default(),
            skip_if: None,
        }
    }

    /// Verify `expectation` inside `region`
    pub fn expect(mut self, region: Region, expectation: Expectation) -> Self {
        self.region = Some(region);
        self.expectation = Some(expectation);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_with(mut self, action: Action) -> Self {
        self.retry_action = Some(action);
        self
    }

    pub fn on_fail(mut self, policy: OnFail) -> Self {
        self.on_fail = policy;
        self
    }

    pub fn wait_before(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.wait_before = DelayRange::new(min_ms, max_ms);
        self
    }

    pub fn wait_after(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.wait_after = DelayRange::new(min_ms, max_ms);
        self
    }

    pub fn skip_if(mut self, flag: impl Into<String>) -> Self {
        self.skip_if = Some(flag.into());
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Action for the given 1-based attempt
    pub fn action_for_attempt(&self, attempt: u32) -> &Action {
        match (&self.retry_action, attempt) {
            (Some(retry), n) if n > 1 => retry,
            _ => &self.action,
        }
    }

    pub fn validate(&self) -> WorkflowResult<()> {
        let invalid = |reason: String| WorkflowError::invalid(&self.id, reason);
        if self.id.trim().is_empty() {
            return Err(invalid("step id is empty".to_string()));
        }
        self.action.validate().map_err(invalid)?;
        if let Some(retry) = &self.retry_action {
            retry.validate().map_err(|e| invalid(format!("retry action: {}", e)))?;
        }
        if let Some(region) = &self.region {
            region.validate().map_err(|e| invalid(e.to_string()))?;
        }
        if let Some(expectation) = &self.expectation {
            expectation.validate().map_err(invalid)?;
        }
        for (name, delay) in [("wait_before", self.wait_before), ("wait_after", self.wait_after)] {
            if delay.min_ms > delay.max_ms {
                return Err(invalid(format!("{} min {} > max {}", name, delay.min_ms, delay.max_ms)));
            }
        }
        Ok(())
    }
}

/// A named, ordered list of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
    /// Default run variables; `--var` / `RunContext` values win
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            vars: BTreeMap::new(),
        }
    }

    pub fn from_json_str(json: &str) -> WorkflowResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> WorkflowResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Up-front structural checks: every step valid, ids unique, branch targets exist
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.steps.is_empty() {
            return Err(WorkflowError::invalid("<workflow>", format!("workflow '{}' has no steps", self.name)));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            step.validate()?;
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowError::invalid(&step.id, "duplicate step id"));
            }
        }
        for step in &self.steps {
            if let OnFail::BranchTo(target) = &step.on_fail {
                if self.step_index(target).is_none() {
                    return Err(WorkflowError::UnknownStep(target.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Per-run mutable state, passed explicitly into the orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub vars: HashMap<String, String>,
    pub flags: HashMap<String, String>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    /// Run id derived from the device id and the current time
    pub fn for_device(device_id: &str) -> Self {
        let device: String = device_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        Self::new(format!("{}_{}", device, chrono::Utc::now().format("%Y%m%d_%H%M%S%3f")))
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_var(key, value);
        self
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set_flag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.flags.insert(key.into(), value.into());
    }

    pub fn flag(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(String::as_str)
    }

    /// Fill variables the context does not already define
    pub fn merge_defaults(&mut self, defaults: &BTreeMap<String, String>) {
        for (key, value) in defaults {
            self.vars.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    /// Replace `{name}` placeholders with run variables.
    ///
    /// Braces that do not enclose an identifier are kept literally; an
    /// identifier with no value is an error.
    pub fn substitute(&self, text: &str) -> Result<String, String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let name_len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if name_len > 0 && after[name_len..].starts_with('}') {
                let name = &after[..name_len];
                let value = self
                    .var(name)
                    .ok_or_else(|| format!("undefined variable '{}'", name))?;
                out.push_str(value);
                rest = &after[name_len + 1..];
            } else {
                out.push('{');
                rest = after;
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Substitute run variables into the text of an expectation
    pub fn resolve_expectation(&self, expectation: &Expectation) -> Result<Expectation, String> {
        Ok(match expectation {
            Expectation::Text { text, min_confidence } => Expectation::Text {
                text: self.substitute(text)?,
                min_confidence: *min_confidence,
            },
            Expectation::AnyOf { any_of } => Expectation::AnyOf {
                any_of: any_of
                    .iter()
                    .map(|e| self.resolve_expectation(e))
                    .collect::<Result<_, _>>()?,
            },
            other => other.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn region() -> Region {
        Region::new(0.1, 0.3, 0.4, 0.5).unwrap()
    }

    #[test]
    fn test_substitute_vars() {
        let ctx = RunContext::new("r").with_var("title", "Blue bike").with_var("price", "120");
        assert_eq!(ctx.substitute("{title} for {price}$").unwrap(), "Blue bike for 120$");
        assert_eq!(ctx.substitute("json {\"a\": 1} {}").unwrap(), "json {\"a\": 1} {}");
        assert!(ctx.substitute("{missing}").unwrap_err().contains("missing"));
    }

    #[test]
    fn test_resolve_expectation_text() {
        let ctx = RunContext::new("r").with_var("category", "Garden");
        let nested = Expectation::any_of(vec![Expectation::text("{category}"), Expectation::content()]);
        match ctx.resolve_expectation(&nested).unwrap() {
            Expectation::AnyOf { any_of } => match &any_of[0] {
                Expectation::Text { text, .. } => assert_eq!(text, "Garden"),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(ctx.resolve_expectation(&Expectation::text("{nope}")).is_err());
    }

    #[test]
    fn test_delay_range_sampling() {
        let mut rng = StdRng::seed_from_u64(3);
        let range = DelayRange::new(100, 200);
        for _ in 0..100 {
            let d = range.sample(&mut rng);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
        assert_eq!(DelayRange::default().sample(&mut rng), Duration::ZERO);

        let fixed = DelayRange::new(1000, 1000);
        let picks: HashSet<Duration> = (0..50).map(|_| fixed.sample(&mut rng)).collect();
        assert!(picks.len() > 1);
    }

    #[test]
    fn test_retry_action_used_after_first_attempt() {
        let refresh = Region::new(0.8, 0.9, 0.0, 0.1).unwrap();
        let step = Step::new("s", Action::tap(region())).retry_with(Action::tap(refresh));
        assert!(matches!(step.action_for_attempt(1), Action::Tap { region: r } if *r == region()));
        assert!(matches!(step.action_for_attempt(2), Action::Tap { region: r } if *r == refresh));
    }

    #[test]
    fn test_workflow_json() {
        let json = r#"{
            "name": "listing",
            "vars": { "title": "Lamp" },
            "steps": [
                { "id": "open", "action": { "type": "tap", "region": { "x_min": 0.1, "x_max": 0.3, "y_min": 0.4, "y_max": 0.5 } },
                  "expectation": { "kind": "text", "text": "Other" }, "timeout_ms": 5000,
                  "wait_after": { "min_ms": 500, "max_ms": 900 } },
                { "id": "title", "action": { "type": "type_text", "text": "{title}", "clear_first": true },
                  "on_fail": { "branch_to": "open" } },
                { "id": "scroll", "action": { "type": "swipe_in", "direction": "up",
                  "region": { "x_min": 0.0, "x_max": 1.0, "y_min": 0.2, "y_max": 0.8 } },
                  "on_fail": "continue_anyway" }
            ]
        }"#;
        let wf = Workflow::from_json_str(json).unwrap();
        wf.validate().unwrap();
        assert_eq!(wf.steps.len(), 3);
        assert_eq!(wf.steps[0].max_retries, 1);
        assert_eq!(wf.steps[0].timeout_ms, 5000);
        assert_eq!(wf.steps[1].on_fail, OnFail::BranchTo("open".to_string()));
        assert_eq!(wf.steps[2].on_fail, OnFail::ContinueAnyway);
        assert!(matches!(wf.steps[2].action, Action::SwipeIn { duration_ms: 400, .. }));
        assert_eq!(wf.vars.get("title").map(String::as_str), Some("Lamp"));
    }

    #[test]
    fn test_validate_rejects_bad_definitions() {
        let dup = Workflow::new("w", vec![Step::new("a", Action::Wait), Step::new("a", Action::Wait)]);
        assert!(matches!(dup.validate(), Err(WorkflowError::InvalidStepDefinition { .. })));

        let branch = Workflow::new(
            "w",
            vec![Step::new("a", Action::Wait).on_fail(OnFail::BranchTo("nowhere".into()))],
        );
        assert!(matches!(branch.validate(), Err(WorkflowError::UnknownStep(_))));

        let bad_region = Region {
            x_min: 0.5,
            x_max: 0.5,
            y_min: 0.0,
            y_max: 1.0,
        };
        let zero = Workflow::new("w", vec![Step::new("a", Action::Tap { region: bad_region })]);
        assert!(matches!(zero.validate(), Err(WorkflowError::InvalidStepDefinition { .. })));

        let swipe = Workflow::new(
            "w",
            vec![Step::new(
                "s",
                Action::Swipe {
                    from: (0.5, 0.9),
                    to: (0.5, 1.2),
                    duration_ms: 300,
                },
            )],
        );
        assert!(swipe.validate().is_err());
    }

    #[test]
    fn test_context_defaults_do_not_override() {
        let mut ctx = RunContext::new("r").with_var("title", "cli");
        let mut defaults = BTreeMap::new();
        defaults.insert("title".to_string(), "file".to_string());
        defaults.insert("price".to_string(), "10".to_string());
        ctx.merge_defaults(&defaults);
        assert_eq!(ctx.var("title"), Some("cli"));
        assert_eq!(ctx.var("price"), Some("10"));
    }
}
