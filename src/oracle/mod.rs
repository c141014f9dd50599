//! Visual state oracle.
//!
//! Decides from pixels alone whether an expected UI state is on screen.
//! Three independent detector kinds are available (text, template, generic
//! content) plus a mean-intensity "ready" check and an `AnyOf` combinator.
//! `Oracle::evaluate` judges one frame; `Oracle::detect` polls a sampler
//! until a match or the timeout. A timeout is a normal outcome: the result
//! comes back with `matched == false` and the best score seen.

pub mod content;
pub mod enhance;
pub mod template;
pub mod text;

pub use content::{ContentSignals, content_score, content_signals};
pub use enhance::enhance;
pub use template::{TemplateMatch, match_template};
pub use text::{RecognizedText, ScriptedRecognizer, TesseractRecognizer, TextRecognizer, match_any_text, match_text};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::region::{Point, Region};
use crate::snapshot::{CaptureBackend, Frame, ScreenSampler};
use crate::workflow::CancellationFlag;

/// Result type for oracle operations
pub type OracleResult<T> = Result<T, OracleError>;

/// Structural oracle failures. "Not found" is never an error.
#[derive(Debug)]
pub enum OracleError {
    /// Template missing, unreadable or malformed
    Template(String),
    /// Text recognizer unavailable or crashed
    Recognizer(String),
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleError::Template(msg) => write!(f, "Template error: {}", msg),
            OracleError::Recognizer(msg) => write!(f, "Text recognizer error: {}", msg),
        }
    }
}

impl std::error::Error for OracleError {}

/// The oracle's verdict for one detection attempt
///
/// `score` is detector-specific and not comparable across detector kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub matched: bool,
    pub score: f64,
    pub label: Option<String>,
    /// Full-frame pixel location of the match (template detector)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Point>,
    /// Frames evaluated by `detect`; zero for single-frame evaluation
    #[serde(default)]
    pub polls: u32,
}

impl DetectionResult {
    pub fn hit(score: f64, label: Option<String>) -> Self {
        Self {
            matched: true,
            score,
            label,
            location: None,
            polls: 0,
        }
    }

    pub fn miss(score: f64) -> Self {
        Self {
            matched: false,
            score,
            label: None,
            location: None,
            polls: 0,
        }
    }

    fn located(mut self, location: Point) -> Self {
        self.location = Some(location);
        self
    }
}

/// What a step expects to see in its verification region
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    /// A recognized token containing `text` (case-insensitive)
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_confidence: Option<f64>,
    },
    /// Any recognized text at all
    AnyText {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_confidence: Option<f64>,
    },
    /// Reference image, loaded from `path` or supplied in memory
    Template {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        #[serde(skip)]
        image: Option<Arc<GrayImage>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f64>,
    },
    /// Generic "real content has loaded" heuristic
    Content {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f64>,
    },
    /// First satisfied expectation wins, cheapest detectors first
    AnyOf { any_of: Vec<Expectation> },
    /// Mean gray level inside a band (e.g. an enabled button)
    Ready { min_mean: f64, max_mean: f64 },
}

impl Expectation {
    pub fn text(text: impl Into<String>) -> Self {
        Expectation::Text {
            text: text.into(),
            min_confidence: None,
        }
    }

    pub fn any_text() -> Self {
        Expectation::AnyText { min_confidence: None }
    }

    pub fn content() -> Self {
        Expectation::Content { threshold: None }
    }

    pub fn template_path(path: impl Into<PathBuf>) -> Self {
        Expectation::Template {
            path: Some(path.into()),
            image: None,
            threshold: None,
        }
    }

    pub fn template_image(image: GrayImage) -> Self {
        Expectation::Template {
            path: None,
            image: Some(Arc::new(image)),
            threshold: None,
        }
    }

    pub fn any_of(options: Vec<Expectation>) -> Self {
        Expectation::AnyOf { any_of: options }
    }

    pub fn ready(min_mean: f64, max_mean: f64) -> Self {
        Expectation::Ready { min_mean, max_mean }
    }

    /// Override the detector threshold (confidence for text kinds)
    pub fn with_threshold(self, value: f64) -> Self {
        match self {
            Expectation::Text { text, .. } => Expectation::Text {
                text,
                min_confidence: Some(value),
            },
            Expectation::AnyText { .. } => Expectation::AnyText {
                min_confidence: Some(value),
            },
            Expectation::Template { path, image, .. } => Expectation::Template {
                path,
                image,
                threshold: Some(value),
            },
            Expectation::Content { .. } => Expectation::Content { threshold: Some(value) },
            other => other,
        }
    }

    /// Structural checks done before a run starts
    pub fn validate(&self) -> Result<(), String> {
        let unit = |name: &str, v: Option<f64>| match v {
            Some(v) if !(0.0..=1.0).contains(&v) => Err(format!("{} {} outside [0,1]", name, v)),
            _ => Ok(()),
        };
        match self {
            Expectation::Text { text, min_confidence } => {
                if text.trim().is_empty() {
                    return Err("text expectation is empty".to_string());
                }
                unit("min_confidence", *min_confidence)
            }
            Expectation::AnyText { min_confidence } => unit("min_confidence", *min_confidence),
            Expectation::Template { path, image, threshold } => {
                if path.is_none() && image.is_none() {
                    return Err("template expectation needs a path or an image".to_string());
                }
                unit("threshold", *threshold)
            }
            Expectation::Content { threshold } => unit("threshold", *threshold),
            Expectation::AnyOf { any_of } => {
                if any_of.is_empty() {
                    return Err("any_of has no alternatives".to_string());
                }
                any_of.iter().try_for_each(Expectation::validate)
            }
            Expectation::Ready { min_mean, max_mean } => {
                if !(0.0..=255.0).contains(min_mean) || !(0.0..=255.0).contains(max_mean) || min_mean > max_mean {
                    return Err(format!("ready band {}..{} is invalid", min_mean, max_mean));
                }
                Ok(())
            }
        }
    }

    /// Lower runs first inside `AnyOf`
    fn cost_rank(&self) -> u8 {
        match self {
            Expectation::Ready { .. } | Expectation::Content { .. } => 0,
            Expectation::Template { .. } => 1,
            Expectation::Text { .. } | Expectation::AnyText { .. } => 2,
            Expectation::AnyOf { .. } => 3,
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Text { text, .. } => write!(f, "text \"{}\"", text),
            Expectation::AnyText { .. } => write!(f, "any text"),
            Expectation::Template { path: Some(p), .. } => write!(f, "template {}", p.display()),
            Expectation::Template { .. } => write!(f, "template <in-memory>"),
            Expectation::Content { .. } => write!(f, "content"),
            Expectation::AnyOf { any_of } => {
                let parts: Vec<String> = any_of.iter().map(|e| e.to_string()).collect();
                write!(f, "any of [{}]", parts.join(", "))
            }
            Expectation::Ready { min_mean, max_mean } => write!(f, "ready {}..{}", min_mean, max_mean),
        }
    }
}

/// Oracle thresholds and polling
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub poll_interval: Duration,
    pub text_threshold: f64,
    pub any_text_threshold: f64,
    pub template_threshold: f64,
    pub content_threshold: f64,
    /// Relative template paths are resolved against this directory
    pub assets_dir: PathBuf,
}

impl Default for OracleConfig {
    fn default() -> Self {
        let settings = &config::get().oracle;
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            text_threshold: settings.text_threshold,
            any_text_threshold: settings.any_text_threshold,
            template_threshold: settings.template_threshold,
            content_threshold: settings.content_threshold,
            assets_dir: PathBuf::from(&settings.assets_dir),
        }
    }
}

impl OracleConfig {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn content_threshold(mut self, threshold: f64) -> Self {
        self.content_threshold = threshold;
        self
    }

    pub fn template_threshold(mut self, threshold: f64) -> Self {
        self.template_threshold = threshold;
        self
    }

    pub fn assets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.assets_dir = dir.into();
        self
    }
}

/// Visual state oracle
pub struct Oracle {
    config: OracleConfig,
    recognizer: Box<dyn TextRecognizer>,
    templates: Mutex<HashMap<PathBuf, Arc<GrayImage>>>,
}

impl Oracle {
    pub fn new(recognizer: Box<dyn TextRecognizer>) -> Self {
        Self::with_config(recognizer, OracleConfig::default())
    }

    pub fn with_config(recognizer: Box<dyn TextRecognizer>, config: OracleConfig) -> Self {
        Self {
            config,
            recognizer,
            templates: Mutex::new(HashMap::new()),
        }
    }

    /// Oracle using the `tesseract` CLI for text
    pub fn tesseract() -> Self {
        Self::new(Box::new(TesseractRecognizer::new()))
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Judge a single frame. The same frame and expectation always produce
    /// the same verdict.
    pub fn evaluate(&self, frame: &Frame, expectation: &Expectation) -> OracleResult<DetectionResult> {
        if frame.is_empty() {
            return Ok(DetectionResult::miss(0.0));
        }
        match expectation {
            Expectation::Text { text, min_confidence } => {
                let tokens = self.recognize(frame)?;
                let min = min_confidence.unwrap_or(self.config.text_threshold);
                Ok(match_text(&tokens, text, min))
            }
            Expectation::AnyText { min_confidence } => {
                let tokens = self.recognize(frame)?;
                let min = min_confidence.unwrap_or(self.config.any_text_threshold);
                Ok(match_any_text(&tokens, min))
            }
            Expectation::Template { path, image, threshold } => {
                let template = match (image, path) {
                    (Some(image), _) => Arc::clone(image),
                    (None, Some(path)) => self.load_template(path)?,
                    (None, None) => {
                        return Err(OracleError::Template("no template path or image".to_string()));
                    }
                };
                let threshold = threshold.unwrap_or(self.config.template_threshold);
                Ok(self.evaluate_template(frame, &template, threshold, path.as_deref()))
            }
            Expectation::Content { threshold } => {
                let threshold = threshold.unwrap_or(self.config.content_threshold);
                let signals = content_signals(frame.image());
                tracing::trace!(
                    edge_density = signals.edge_density,
                    value_variance = signals.value_variance,
                    entropy = signals.entropy,
                    score = signals.score,
                    "content signals"
                );
                Ok(if signals.score >= threshold {
                    DetectionResult::hit(signals.score, Some("content".to_string()))
                } else {
                    DetectionResult::miss(signals.score)
                })
            }
            Expectation::AnyOf { any_of } => {
                let mut ordered: Vec<&Expectation> = any_of.iter().collect();
                ordered.sort_by_key(|e| e.cost_rank());
                let mut best = DetectionResult::miss(0.0);
                for option in ordered {
                    let result = self.evaluate(frame, option)?;
                    if result.matched {
                        return Ok(result);
                    }
                    if result.score > best.score {
                        best = result;
                    }
                }
                Ok(best)
            }
            Expectation::Ready { min_mean, max_mean } => {
                let gray = frame.to_gray();
                let n = f64::from(gray.width()) * f64::from(gray.height());
                let mean = gray.pixels().map(|p| f64::from(p.0[0])).sum::<f64>() / n;
                Ok(if (*min_mean..=*max_mean).contains(&mean) {
                    DetectionResult::hit(mean, Some("ready".to_string()))
                } else {
                    DetectionResult::miss(mean)
                })
            }
        }
    }

    /// Poll `sampler` until `expectation` holds inside `region`, the timeout
    /// elapses or `cancel` is raised.
    ///
    /// Capture gaps and capture errors count as "no evidence yet".
    pub fn detect<B: CaptureBackend>(
        &self,
        sampler: &mut ScreenSampler<B>,
        region: &Region,
        expectation: &Expectation,
        timeout: Duration,
        cancel: &CancellationFlag,
    ) -> OracleResult<DetectionResult> {
        let started = Instant::now();
        let mut best = DetectionResult::miss(0.0);
        let mut polls = 0u32;

        loop {
            if cancel.is_cancelled() {
                tracing::debug!(polls, "detection cancelled");
                break;
            }
            polls += 1;
            match sampler.try_capture() {
                Ok(Some(frame)) => {
                    let crop = frame.crop(region);
                    let mut result = self.evaluate(&crop, expectation)?;
                    tracing::debug!(
                        poll = polls,
                        expectation = %expectation,
                        matched = result.matched,
                        score = result.score,
                        "oracle poll"
                    );
                    if result.matched {
                        result.polls = polls;
                        return Ok(result);
                    }
                    if result.score > best.score {
                        best = result;
                    }
                }
                Ok(None) => tracing::debug!(poll = polls, "no frame yet"),
                Err(e) => tracing::warn!(poll = polls, error = %e, "capture failed during detection"),
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                break;
            }
            thread::sleep(self.config.poll_interval.min(timeout - elapsed));
        }

        tracing::debug!(
            expectation = %expectation,
            polls,
            best_score = best.score,
            "no match before timeout"
        );
        best.polls = polls;
        Ok(best)
    }

    fn recognize(&self, frame: &Frame) -> OracleResult<Vec<RecognizedText>> {
        let enhanced = enhance(&frame.to_gray());
        self.recognizer.recognize(&enhanced)
    }

    fn evaluate_template(
        &self,
        frame: &Frame,
        template: &GrayImage,
        threshold: f64,
        path: Option<&Path>,
    ) -> DetectionResult {
        let Some(found) = match_template(&frame.to_gray(), template) else {
            return DetectionResult::miss(0.0);
        };
        let (cx, cy) = found.center();
        let (ox, oy) = frame.origin();
        let location = Point::new(f64::from(ox) + cx, f64::from(oy) + cy);
        let label = path
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "template".to_string());
        let result = if found.score >= threshold {
            DetectionResult::hit(found.score, Some(label))
        } else {
            DetectionResult::miss(found.score)
        };
        result.located(location)
    }

    fn load_template(&self, path: &Path) -> OracleResult<Arc<GrayImage>> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.assets_dir.join(path)
        };
        if let Ok(cache) = self.templates.lock() {
            if let Some(image) = cache.get(&resolved) {
                return Ok(Arc::clone(image));
            }
        }
        let image = image::open(&resolved)
            .map_err(|e| OracleError::Template(format!("{}: {}", resolved.display(), e)))?
            .to_luma8();
        let image = Arc::new(image);
        if let Ok(mut cache) = self.templates.lock() {
            cache.insert(resolved, Arc::clone(&image));
        }
        Ok(image)
    }
}
