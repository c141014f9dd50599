//! Text detection: recognition seam and token matching.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use wait_timeout::ChildExt;

use super::{DetectionResult, OracleError, OracleResult};
use crate::config;
use crate::region::PixelRect;

/// One token returned by a recognizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedText {
    pub text: String,
    /// Recognizer confidence in [0,1]
    pub confidence: f64,
    /// Token bounds inside the recognized image, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<PixelRect>,
}

impl RecognizedText {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence,
            bounds: None,
        }
    }
}

/// Text recognition backend
///
/// Implementations receive the already enhanced grayscale region and return
/// tokens in reading order.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &GrayImage) -> OracleResult<Vec<RecognizedText>>;

    fn name(&self) -> &str {
        "recognizer"
    }
}

impl<F> TextRecognizer for F
where
    F: Fn(&GrayImage) -> Vec<RecognizedText> + Send + Sync,
{
    fn recognize(&self, image: &GrayImage) -> OracleResult<Vec<RecognizedText>> {
        Ok(self(image))
    }

    fn name(&self) -> &str {
        "closure"
    }
}

/// First token containing `expected` (case-insensitive) at or above `min_confidence`.
///
/// Falls back to the qualifying tokens joined with spaces, so multi-word
/// expectations match word-level recognizers.
pub fn match_text(tokens: &[RecognizedText], expected: &str, min_confidence: f64) -> DetectionResult {
    let needle = expected.trim().to_lowercase();
    let mut best = 0.0f64;

    for token in tokens {
        if token.text.to_lowercase().contains(&needle) {
            if token.confidence >= min_confidence {
                return DetectionResult::hit(token.confidence, Some(token.text.clone()));
            }
            best = best.max(token.confidence);
        }
    }

    let qualifying: Vec<&RecognizedText> = tokens
        .iter()
        .filter(|t| t.confidence >= min_confidence && !t.text.trim().is_empty())
        .collect();
    if !qualifying.is_empty() {
        let line = qualifying
            .iter()
            .map(|t| t.text.trim())
            .collect::<Vec<_>>()
            .join(" ");
        if line.to_lowercase().contains(&needle) {
            let mean = qualifying.iter().map(|t| t.confidence).sum::<f64>() / qualifying.len() as f64;
            return DetectionResult::hit(mean, Some(line));
        }
    }

    DetectionResult::miss(best)
}

/// First non-blank token at or above `min_confidence`
pub fn match_any_text(tokens: &[RecognizedText], min_confidence: f64) -> DetectionResult {
    let mut best = 0.0f64;
    for token in tokens.iter().filter(|t| !t.text.trim().is_empty()) {
        if token.confidence >= min_confidence {
            return DetectionResult::hit(token.confidence, Some(token.text.clone()));
        }
        best = best.max(token.confidence);
    }
    DetectionResult::miss(best)
}

/// Deterministic recognizer for tests: returns queued token lists in order,
/// repeating the last one once the queue runs dry.
#[derive(Debug, Default)]
pub struct ScriptedRecognizer {
    queue: Mutex<VecDeque<Vec<RecognizedText>>>,
    last: Mutex<Vec<RecognizedText>>,
    calls: Mutex<usize>,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always return `tokens`
    pub fn always(tokens: Vec<RecognizedText>) -> Self {
        Self {
            last: Mutex::new(tokens),
            ..Self::default()
        }
    }

    /// Queue the result of the next call
    pub fn then(self, tokens: Vec<RecognizedText>) -> Self {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(tokens);
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

impl TextRecognizer for ScriptedRecognizer {
    fn recognize(&self, _image: &GrayImage) -> OracleResult<Vec<RecognizedText>> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        let mut last = self
            .last
            .lock()
            .map_err(|_| OracleError::Recognizer("scripted recognizer poisoned".to_string()))?;
        if let Some(tokens) = next {
            *last = tokens;
        }
        Ok(last.clone())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Recognizer backed by the `tesseract` command line tool (TSV output)
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    binary: String,
    language: Option<String>,
    timeout: Duration,
}

impl Default for TesseractRecognizer {
    fn default() -> Self {
        Self {
            binary: config::get().oracle.tesseract_path.clone(),
            language: None,
            timeout: Duration::from_secs(20),
        }
    }
}

impl TesseractRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Tesseract language pack, e.g. "eng+ukr"
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, png: Vec<u8>) -> OracleResult<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-").arg("-");
        if let Some(lang) = &self.language {
            cmd.arg("-l").arg(lang);
        }
        cmd.arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| OracleError::Recognizer(format!("failed to start {}: {}", self.binary, e)))?;

        // Writer and readers run on their own threads so a full pipe cannot deadlock
        let stdin = child.stdin.take();
        let writer = std::thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&png);
            }
        });
        let stdout = child.stdout.take();
        let reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_string(&mut buf);
            }
            buf
        });
        let stderr = child.stderr.take();
        let err_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut err) = stderr {
                let _ = err.read_to_string(&mut buf);
            }
            buf
        });

        let status = match child
            .wait_timeout(self.timeout)
            .map_err(|e| OracleError::Recognizer(e.to_string()))?
        {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(OracleError::Recognizer(format!(
                    "{} timed out after {:?}",
                    self.binary, self.timeout
                )));
            }
        };
        let _ = writer.join();
        let stdout = reader.join().unwrap_or_default();
        let stderr = err_reader.join().unwrap_or_default();

        if !status.success() {
            return Err(OracleError::Recognizer(format!(
                "{} exited with {:?}: {}",
                self.binary,
                status.code(),
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(&self, image: &GrayImage) -> OracleResult<Vec<RecognizedText>> {
        let mut png = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| OracleError::Recognizer(format!("failed to encode region: {}", e)))?;
        let tsv = self.run(png)?;
        let tokens = parse_tsv(&tsv);
        tracing::trace!(tokens = tokens.len(), "tesseract finished");
        Ok(tokens)
    }

    fn name(&self) -> &str {
        "tesseract"
    }
}

/// Parse tesseract TSV output into word tokens (confidence scaled to [0,1])
pub fn parse_tsv(tsv: &str) -> Vec<RecognizedText> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 {
                return None;
            }
            let confidence: f64 = cols[10].trim().parse().ok()?;
            let text = cols[11].trim();
            if confidence < 0.0 || text.is_empty() {
                return None;
            }
            let num = |i: usize| cols[i].trim().parse::<u32>().ok();
            let bounds = match (num(6), num(7), num(8), num(9)) {
                (Some(x), Some(y), Some(width), Some(height)) => Some(PixelRect { x, y, width, height }),
                _ => None,
            };
            Some(RecognizedText {
                text: text.to_string(),
                confidence: (confidence / 100.0).clamp(0.0, 1.0),
                bounds,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(items: &[(&str, f64)]) -> Vec<RecognizedText> {
        items.iter().map(|(t, c)| RecognizedText::new(*t, *c)).collect()
    }

    #[test]
    fn test_match_is_case_insensitive_containment() {
        let result = match_text(&tokens(&[("Skip", 0.9), ("OTHERWISE", 0.7)]), "other", 0.5);
        assert!(result.matched);
        assert_eq!(result.label.as_deref(), Some("OTHERWISE"));
        assert_eq!(result.score, 0.7);
    }

    #[test]
    fn test_low_confidence_token_does_not_match() {
        let result = match_text(&tokens(&[("Other", 0.3)]), "Other", 0.5);
        assert!(!result.matched);
        assert_eq!(result.score, 0.3);
    }

    #[test]
    fn test_first_qualifying_token_wins() {
        let result = match_text(&tokens(&[("Other", 0.6), ("Others", 0.95)]), "other", 0.5);
        assert_eq!(result.label.as_deref(), Some("Other"));
    }

    #[test]
    fn test_multi_word_expectation_matches_joined_tokens() {
        let result = match_text(&tokens(&[("Add", 0.8), ("photos", 0.6), ("x", 0.05)]), "add photos", 0.5);
        assert!(result.matched);
        assert!((result.score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_any_text_uses_lower_threshold() {
        let toks = tokens(&[("  ", 0.9), ("~", 0.15)]);
        assert!(match_any_text(&toks, 0.1).matched);
        assert!(!match_any_text(&toks, 0.5).matched);
    }

    #[test]
    fn test_scripted_recognizer_repeats_last() {
        let rec = ScriptedRecognizer::new()
            .then(tokens(&[("a", 1.0)]))
            .then(tokens(&[("b", 1.0)]));
        let img = GrayImage::new(1, 1);
        assert_eq!(rec.recognize(&img).unwrap()[0].text, "a");
        assert_eq!(rec.recognize(&img).unwrap()[0].text, "b");
        assert_eq!(rec.recognize(&img).unwrap()[0].text, "b");
        assert_eq!(rec.calls(), 3);
    }

    #[test]
    fn test_closure_recognizer() {
        let rec = |_: &GrayImage| tokens(&[("Other", 0.9)]);
        assert_eq!(rec.recognize(&GrayImage::new(2, 2)).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_tsv() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t640\t480\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t36\t92\t60\t18\t96.5\tOther\n\
                   5\t1\t1\t1\t1\t2\t100\t92\t40\t18\t12\tx\n";
        let toks = parse_tsv(tsv);
        assert_eq!(toks.len(), 2);
        assert_eq!(toks[0].text, "Other");
        assert!((toks[0].confidence - 0.965).abs() < 1e-9);
        assert_eq!(toks[0].bounds, Some(PixelRect { x: 36, y: 92, width: 60, height: 18 }));
    }
}
