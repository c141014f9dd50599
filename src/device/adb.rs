//! adb-backed device channel.
//!
//! Every primitive is a single `adb -s <serial> …` invocation. Swipes are
//! replayed as one `input motionevent` script so the per-sample delays are
//! kept on the device side instead of being stretched by adb round trips.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use wait_timeout::ChildExt;

use super::{ChannelError, ChannelResult, DeviceChannel, ShellOutput};
use crate::config;
use crate::gesture::GesturePath;
use crate::region::Point;

/// Log previews are cut to this many characters
const LOG_PREVIEW_CHARS: usize = 100;

/// Configuration for an adb channel
#[derive(Debug, Clone)]
pub struct AdbConfig {
    /// adb executable
    pub adb_path: String,
    /// Device serial (`adb -s`)
    pub serial: String,
    /// Per-command timeout
    pub timeout: Duration,
    /// Screenshots can take far longer than taps on slow devices
    pub screenshot_timeout: Duration,
}

impl AdbConfig {
    pub fn new(serial: impl Into<String>) -> Self {
        let cfg = config::get();
        Self {
            adb_path: cfg.device.adb_path.clone(),
            serial: serial.into(),
            timeout: Duration::from_secs(cfg.device.adb_timeout),
            screenshot_timeout: Duration::from_secs(cfg.device.adb_timeout * 2),
        }
    }

    pub fn adb_path(mut self, path: impl Into<String>) -> Self {
        self.adb_path = path.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A device listed by `adb devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbDevice {
    pub serial: String,
    pub status: String,
}

struct RawOutput {
    exit_code: Option<i32>,
    stdout: Vec<u8>,
    stderr: String,
}

/// adb channel for one device
pub struct AdbChannel {
    config: AdbConfig,
}

impl AdbChannel {
    pub fn new(config: AdbConfig) -> Self {
        Self { config }
    }

    /// Channel for `serial` with configuration from the environment
    pub fn for_serial(serial: impl Into<String>) -> Self {
        Self::new(AdbConfig::new(serial))
    }

    /// List attached devices
    pub fn devices(adb_path: &str) -> ChannelResult<Vec<AdbDevice>> {
        let output = run_with_timeout(adb_path, &["devices"], Duration::from_secs(10))?;
        if output.exit_code != Some(0) {
            return Err(ChannelError::CommandFailed {
                command: format!("{} devices", adb_path),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        let devices = parse_devices(&String::from_utf8_lossy(&output.stdout));
        tracing::info!(count = devices.len(), "adb devices listed");
        Ok(devices)
    }

    fn run(&self, args: &[&str], timeout: Duration) -> ChannelResult<RawOutput> {
        let mut full: Vec<&str> = vec!["-s", self.config.serial.as_str()];
        full.extend_from_slice(args);
        let output = run_with_timeout(&self.config.adb_path, &full, timeout)?;

        let command = args.join(" ");
        let preview: String = String::from_utf8_lossy(&output.stdout)
            .chars()
            .take(LOG_PREVIEW_CHARS)
            .collect::<String>()
            .replace('\n', " ");
        if output.exit_code == Some(0) {
            tracing::debug!(serial = %self.config.serial, cmd = %command, rc = 0, out = %preview.trim(), "adb");
        } else {
            tracing::warn!(
                serial = %self.config.serial,
                cmd = %command,
                rc = ?output.exit_code,
                err = %output.stderr.trim(),
                "adb command failed"
            );
        }
        Ok(output)
    }

    /// Run an input command; any failure is an error
    fn input(&self, args: &[&str]) -> ChannelResult<()> {
        let output = self.run(args, self.config.timeout)?;
        if output.exit_code != Some(0) {
            return Err(ChannelError::CommandFailed {
                command: args.join(" "),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }
}

impl DeviceChannel for AdbChannel {
    fn id(&self) -> &str {
        &self.config.serial
    }

    fn tap(&mut self, point: Point) -> ChannelResult<()> {
        let (x, y) = point.to_pixel();
        self.input(&["shell", "input", "tap", &x.to_string(), &y.to_string()])
    }

    fn swipe(&mut self, path: GesturePath) -> ChannelResult<()> {
        let script = motion_script(&path);
        if script.is_empty() {
            return Ok(());
        }
        // Allow the whole gesture plus the usual command budget
        let timeout = self.config.timeout + path.total_duration();
        let output = self.run(&["shell", &script], timeout)?;
        if output.exit_code != Some(0) {
            return Err(ChannelError::CommandFailed {
                command: "input motionevent".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> ChannelResult<()> {
        if text.is_ascii() {
            let escaped = escape_input_text(text);
            self.input(&["shell", "input", "text", &escaped])
        } else {
            // `input text` cannot emit non-ASCII; ADBKeyBoard accepts a broadcast instead
            let quoted = format!("'{}'", text.replace('\'', "'\\''"));
            self.input(&[
                "shell", "am", "broadcast", "-a", "ADB_INPUT_TEXT", "--es", "msg", &quoted,
            ])
        }
    }

    fn key(&mut self, codes: &[u32]) -> ChannelResult<()> {
        let codes: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
        let code_refs: Vec<&str> = codes.iter().map(String::as_str).collect();
        if code_refs.len() > 1 {
            let mut args = vec!["shell", "input", "keycombination"];
            args.extend_from_slice(&code_refs);
            // keycombination needs Android 11+; older builds accept the codes as keyevents
            if self.input(&args).is_ok() {
                return Ok(());
            }
        }
        let mut args = vec!["shell", "input", "keyevent"];
        args.extend_from_slice(&code_refs);
        self.input(&args)
    }

    fn shell(&mut self, command: &str) -> ChannelResult<ShellOutput> {
        let output = self.run(&["shell", command], self.config.timeout)?;
        Ok(ShellOutput {
            exit_code: output.exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    fn screenshot(&mut self) -> ChannelResult<Vec<u8>> {
        let output = self.run(&["exec-out", "screencap", "-p"], self.config.screenshot_timeout)?;
        if output.exit_code != Some(0) {
            return Err(ChannelError::CommandFailed {
                command: "screencap".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    fn resolution(&mut self) -> ChannelResult<(u32, u32)> {
        let output = self.shell("wm size")?;
        parse_wm_size(&output.stdout).ok_or_else(|| ChannelError::CommandFailed {
            command: "wm size".to_string(),
            exit_code: Some(output.exit_code),
            stderr: format!("unrecognized output: {}", output.stdout.trim()),
        })
    }
}

/// Spawn a command, collect its output and kill it if it outlives `timeout`
fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> ChannelResult<RawOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ChannelError::Unreachable(format!("failed to start '{}': {}", program, e)))?;

    // Drain pipes on their own threads so a large screencap cannot block the child
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stdout {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });
    let err_reader = thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ChannelError::Timeout {
                command: format!("{} {}", program, args.join(" ")),
                after: timeout,
            });
        }
    };

    Ok(RawOutput {
        exit_code: status.code(),
        stdout: out_reader.join().unwrap_or_default(),
        stderr: err_reader.join().unwrap_or_default(),
    })
}

/// Build a device-side script replaying the path with its delays
fn motion_script(path: &GesturePath) -> String {
    let samples = path.samples();
    let Some((last, rest)) = samples.split_last() else {
        return String::new();
    };
    let mut parts = Vec::with_capacity(samples.len() * 2);
    for (i, sample) in rest.iter().enumerate() {
        if !sample.delay.is_zero() {
            parts.push(format!("sleep {:.3}", sample.delay.as_secs_f64()));
        }
        let (x, y) = sample.point.to_pixel();
        let kind = if i == 0 { "DOWN" } else { "MOVE" };
        parts.push(format!("input motionevent {} {} {}", kind, x, y));
    }
    if !last.delay.is_zero() {
        parts.push(format!("sleep {:.3}", last.delay.as_secs_f64()));
    }
    let (x, y) = last.point.to_pixel();
    if rest.is_empty() {
        parts.push(format!("input motionevent DOWN {} {}", x, y));
    }
    parts.push(format!("input motionevent UP {} {}", x, y));
    parts.join("; ")
}

/// Escape text for `input text`: spaces become `%s`, shell metacharacters are backslashed
fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        match ch {
            ' ' => out.push_str("%s"),
            '\\' | '\'' | '"' | '`' | '$' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '*' | '?'
            | '~' | '#' | '!' | '[' | ']' | '{' | '}' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Parse `adb devices` output
pub fn parse_devices(output: &str) -> Vec<AdbDevice> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('*') {
                return None;
            }
            let mut parts = line.split_whitespace();
            let serial = parts.next()?.to_string();
            let status = parts.next().unwrap_or("unknown").to_string();
            Some(AdbDevice { serial, status })
        })
        .collect()
}

/// Parse `wm size`; an override size wins over the physical one
fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let mut physical = None;
    let mut overridden = None;
    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let Some((w, h)) = value.trim().split_once('x') else {
            continue;
        };
        let (Ok(w), Ok(h)) = (w.trim().parse::<u32>(), h.trim().parse::<u32>()) else {
            continue;
        };
        let size = (w, h);
        if label.contains("Override") {
            overridden = Some(size);
        } else if label.contains("Physical") {
            physical = Some(size);
        }
    }
    overridden.or(physical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gesture::synthesize_path;

    #[test]
    fn test_parse_devices() {
        let out = "* daemon started successfully\nList of devices attached\nemulator-5554\tdevice\nR58M1234\tunauthorized\n\n";
        let devices = parse_devices(out);
        assert_eq!(
            devices,
            vec![
                AdbDevice { serial: "emulator-5554".into(), status: "device".into() },
                AdbDevice { serial: "R58M1234".into(), status: "unauthorized".into() },
            ]
        );
    }

    #[test]
    fn test_parse_devices_empty() {
        assert!(parse_devices("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn test_parse_wm_size() {
        assert_eq!(parse_wm_size("Physical size: 1080x2400\n"), Some((1080, 2400)));
        assert_eq!(
            parse_wm_size("Physical size: 1440x3200\nOverride size: 1080x2400\n"),
            Some((1080, 2400))
        );
        assert_eq!(parse_wm_size("garbage"), None);
    }

    #[test]
    fn test_parse_wm_size_skips_malformed_lines() {
        assert_eq!(
            parse_wm_size("Warning: axb\nPhysical size: 1080x2400\n"),
            Some((1080, 2400))
        );
        assert_eq!(
            parse_wm_size("Physical size: 1440x3200\nOverride size: wide x tall\n"),
            Some((1440, 3200))
        );
    }

    #[test]
    fn test_escape_input_text() {
        assert_eq!(escape_input_text("Hello world"), "Hello%sworld");
        assert_eq!(escape_input_text("a&b"), "a\\&b");
        assert_eq!(escape_input_text("$5 (new)"), "\\$5%s\\(new\\)");
    }

    #[test]
    fn test_motion_script_shape() {
        let path = synthesize_path(Point::new(10.0, 10.0), Point::new(10.0, 500.0), Duration::from_millis(300)).unwrap();
        let script = motion_script(&path);
        assert!(script.starts_with("input motionevent DOWN 10 10"));
        assert!(script.ends_with("input motionevent UP 10 500"));
        assert_eq!(script.matches("MOVE").count(), path.len() - 2);
    }
}
