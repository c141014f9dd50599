//! Screen sampler: full-frame capture with a bounded retry on transient gaps.

use std::thread;
use std::time::{Duration, Instant};

use super::backend::CaptureBackend;
use super::types::{Frame, SnapshotError, SnapshotResult};
use crate::config;
use crate::region::Region;

/// Delay between attempts while a capture gap lasts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Sampler configuration
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// How long `capture()` keeps retrying before it reports a hard failure
    pub capture_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_millis(config::get().device.capture_timeout_ms),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl SamplerConfig {
    pub fn capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// Acquires frames from one capture backend. One sampler per run.
pub struct ScreenSampler<B: CaptureBackend> {
    backend: B,
    config: SamplerConfig,
}

impl<B: CaptureBackend> ScreenSampler<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, SamplerConfig::default())
    }

    pub fn with_config(backend: B, config: SamplerConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn source_type(&self) -> &str {
        self.backend.source_type()
    }

    /// One attempt. `Ok(None)` is a transient gap ("no evidence yet").
    pub fn try_capture(&mut self) -> SnapshotResult<Option<Frame>> {
        self.backend.capture()
    }

    /// Capture a frame, retrying transient gaps until the capture timeout.
    pub fn capture(&mut self) -> SnapshotResult<Frame> {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(frame) = self.backend.capture()? {
                if attempts > 1 {
                    tracing::debug!(attempts, "capture recovered");
                }
                return Ok(frame);
            }
            if started.elapsed() + self.config.retry_interval > self.config.capture_timeout {
                tracing::warn!(
                    attempts,
                    source = self.backend.source_type(),
                    "no frame within capture timeout"
                );
                return Err(SnapshotError::Capture(format!(
                    "no frame from {} after {} attempts in {:?}",
                    self.backend.source_type(),
                    attempts,
                    started.elapsed()
                )));
            }
            thread::sleep(self.config.retry_interval);
        }
    }

    /// Crop against the frame's own pixel size
    pub fn crop(&self, frame: &Frame, region: &Region) -> Frame {
        frame.crop(region)
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MockFramebuffer;

    /// Returns `gaps` empty captures, then frames
    struct GappyBackend {
        gaps: usize,
        calls: usize,
    }

    impl CaptureBackend for GappyBackend {
        fn capture(&mut self) -> SnapshotResult<Option<Frame>> {
            self.calls += 1;
            if self.calls <= self.gaps {
                return Ok(None);
            }
            Ok(Some(MockFramebuffer::new(4, 4).to_frame()))
        }

        fn source_type(&self) -> &str {
            "gappy"
        }
    }

    fn fast() -> SamplerConfig {
        SamplerConfig {
            capture_timeout: Duration::from_millis(200),
            retry_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_capture_retries_through_gaps() {
        let mut sampler = ScreenSampler::with_config(GappyBackend { gaps: 3, calls: 0 }, fast());
        let frame = sampler.capture().unwrap();
        assert_eq!(frame.width(), 4);
        assert_eq!(sampler.into_backend().calls, 4);
    }

    #[test]
    fn test_capture_gives_up_after_timeout() {
        let mut sampler = ScreenSampler::with_config(GappyBackend { gaps: usize::MAX, calls: 0 }, fast());
        let started = Instant::now();
        assert!(matches!(sampler.capture(), Err(SnapshotError::Capture(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_try_capture_surfaces_gap() {
        let mut sampler = ScreenSampler::with_config(GappyBackend { gaps: 1, calls: 0 }, fast());
        assert!(sampler.try_capture().unwrap().is_none());
        assert!(sampler.try_capture().unwrap().is_some());
    }
}
