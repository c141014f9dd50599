//! Device control channel.
//!
//! The engine only needs five primitives from a device: tap, swipe along a
//! synthesized path, type text, run a shell command and grab a screenshot.
//! `AdbChannel` provides them for Android over adb; `ScriptedDevice` is an
//! in-process stand-in for tests and dry runs.

pub mod adb;
pub mod scripted;

pub use adb::{AdbChannel, AdbConfig, AdbDevice, parse_devices};
pub use scripted::{ActionLog, DeviceAction, ScriptedDevice};

use std::time::Duration;

use crate::gesture::GesturePath;
use crate::region::Point;

/// Android key codes used by built-in actions
pub mod keycode {
    pub const DELETE: u32 = 67;
    pub const A: u32 = 29;
    pub const META_CTRL: u32 = 286;
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors surfaced by a device channel
#[derive(Debug)]
pub enum ChannelError {
    /// Device not reachable or the transport binary could not be started
    Unreachable(String),
    /// Command ran but reported failure
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    /// Command did not finish in time
    Timeout { command: String, after: Duration },
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Unreachable(msg) => write!(f, "Device unreachable: {}", msg),
            ChannelError::CommandFailed {
                command,
                exit_code,
                stderr,
            } => write!(
                f,
                "Command '{}' failed (exit {}): {}",
                command,
                exit_code.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string()),
                stderr.trim()
            ),
            ChannelError::Timeout { command, after } => {
                write!(f, "Command '{}' timed out after {:?}", command, after)
            }
            ChannelError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io(err)
    }
}

/// Output of a shell command on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for device channels
///
/// One channel instance belongs to exactly one workflow run; implementations
/// need not be shareable across threads, only movable into one.
pub trait DeviceChannel: Send {
    /// Identifier used in logs and run summaries (e.g. adb serial)
    fn id(&self) -> &str;

    /// Single touch at a pixel position
    fn tap(&mut self, point: Point) -> ChannelResult<()>;

    /// Replay a synthesized motion. The path is consumed.
    fn swipe(&mut self, path: GesturePath) -> ChannelResult<()>;

    /// Type literal text into the focused field
    fn type_text(&mut self, text: &str) -> ChannelResult<()>;

    /// Send key codes; more than one code is sent as a chord
    fn key(&mut self, codes: &[u32]) -> ChannelResult<()>;

    /// Run a shell command. A non-zero exit is reported in the output, not as an error.
    fn shell(&mut self, command: &str) -> ChannelResult<ShellOutput>;

    /// Encoded screenshot bytes (PNG). An empty buffer means "nothing yet".
    fn screenshot(&mut self) -> ChannelResult<Vec<u8>>;

    /// Current screen resolution in pixels
    fn resolution(&mut self) -> ChannelResult<(u32, u32)> {
        let bytes = self.screenshot()?;
        let img = image::load_from_memory(&bytes)
            .map_err(|e| ChannelError::Unreachable(format!("undecodable screenshot: {}", e)))?;
        Ok((img.width(), img.height()))
    }
}

impl<T: DeviceChannel + ?Sized> DeviceChannel for Box<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn tap(&mut self, point: Point) -> ChannelResult<()> {
        (**self).tap(point)
    }

    fn swipe(&mut self, path: GesturePath) -> ChannelResult<()> {
        (**self).swipe(path)
    }

    fn type_text(&mut self, text: &str) -> ChannelResult<()> {
        (**self).type_text(text)
    }

    fn key(&mut self, codes: &[u32]) -> ChannelResult<()> {
        (**self).key(codes)
    }

    fn shell(&mut self, command: &str) -> ChannelResult<ShellOutput> {
        (**self).shell(command)
    }

    fn screenshot(&mut self) -> ChannelResult<Vec<u8>> {
        (**self).screenshot()
    }

    fn resolution(&mut self) -> ChannelResult<(u32, u32)> {
        (**self).resolution()
    }
}
