//! In-process device for tests and dry runs.
//!
//! The screen shown by a `ScriptedDevice` is chosen by how many actions have
//! been performed so far, which is how a real app behaves: taps change what
//! is rendered. Every action is recorded in a shared `ActionLog` that stays
//! readable after the device has been moved into a run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{ChannelError, ChannelResult, DeviceChannel, ShellOutput};
use crate::gesture::GesturePath;
use crate::region::Point;

/// One recorded device interaction
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAction {
    Tap(Point),
    Swipe { start: Point, end: Point, samples: usize },
    TypeText(String),
    Key(Vec<u32>),
    Shell(String),
}

/// Shared, cloneable view of the actions a device performed
#[derive(Debug, Clone, Default)]
pub struct ActionLog(Arc<Mutex<Vec<DeviceAction>>>);

impl ActionLog {
    pub fn snapshot(&self) -> Vec<DeviceAction> {
        self.0.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn taps(&self) -> Vec<Point> {
        self.snapshot()
            .into_iter()
            .filter_map(|a| match a {
                DeviceAction::Tap(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn push(&self, action: DeviceAction) {
        if let Ok(mut v) = self.0.lock() {
            v.push(action);
        }
    }
}

/// A scripted device
pub struct ScriptedDevice {
    id: String,
    width: u32,
    height: u32,
    /// (shown once at least this many actions were performed, PNG bytes)
    screens: Vec<(usize, Vec<u8>)>,
    /// Upcoming screenshots that come back empty
    capture_gaps: usize,
    /// 1-based action number that fails with a channel error
    fail_on_action: Option<usize>,
    shell_responses: VecDeque<ShellOutput>,
    actions_performed: usize,
    screenshots_taken: usize,
    log: ActionLog,
}

impl ScriptedDevice {
    /// A device with the given resolution and initial screen
    pub fn new(id: impl Into<String>, width: u32, height: u32, initial_screen: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            screens: vec![(0, initial_screen)],
            capture_gaps: 0,
            fail_on_action: None,
            shell_responses: VecDeque::new(),
            actions_performed: 0,
            screenshots_taken: 0,
            log: ActionLog::default(),
        }
    }

    /// Show `screen` once `actions` actions have been performed
    pub fn screen_after(mut self, actions: usize, screen: Vec<u8>) -> Self {
        self.screens.push((actions, screen));
        self.screens.sort_by_key(|(n, _)| *n);
        self
    }

    /// The next `count` screenshots return nothing (transient capture failure)
    pub fn capture_gaps(mut self, count: usize) -> Self {
        self.capture_gaps = count;
        self
    }

    /// Make the `n`th action (1-based) fail as if the device dropped off
    pub fn fail_on_action(mut self, n: usize) -> Self {
        self.fail_on_action = Some(n);
        self
    }

    /// Queue a response for the next `shell` call
    pub fn shell_response(mut self, exit_code: i32, stdout: impl Into<String>) -> Self {
        self.shell_responses.push_back(ShellOutput {
            exit_code,
            stdout: stdout.into(),
        });
        self
    }

    pub fn log(&self) -> ActionLog {
        self.log.clone()
    }

    pub fn screenshots_taken(&self) -> usize {
        self.screenshots_taken
    }

    fn perform(&mut self, action: DeviceAction) -> ChannelResult<()> {
        self.actions_performed += 1;
        if self.fail_on_action == Some(self.actions_performed) {
            return Err(ChannelError::Unreachable(format!(
                "scripted failure on action {}",
                self.actions_performed
            )));
        }
        self.log.push(action);
        Ok(())
    }
}

impl DeviceChannel for ScriptedDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn tap(&mut self, point: Point) -> ChannelResult<()> {
        self.perform(DeviceAction::Tap(point))
    }

    fn swipe(&mut self, path: GesturePath) -> ChannelResult<()> {
        let (Some(start), Some(end)) = (path.start(), path.end()) else {
            return Ok(());
        };
        let samples = path.len();
        self.perform(DeviceAction::Swipe { start, end, samples })
    }

    fn type_text(&mut self, text: &str) -> ChannelResult<()> {
        self.perform(DeviceAction::TypeText(text.to_string()))
    }

    fn key(&mut self, codes: &[u32]) -> ChannelResult<()> {
        self.perform(DeviceAction::Key(codes.to_vec()))
    }

    fn shell(&mut self, command: &str) -> ChannelResult<ShellOutput> {
        self.perform(DeviceAction::Shell(command.to_string()))?;
        Ok(self.shell_responses.pop_front().unwrap_or(ShellOutput {
            exit_code: 0,
            stdout: String::new(),
        }))
    }

    fn screenshot(&mut self) -> ChannelResult<Vec<u8>> {
        self.screenshots_taken += 1;
        if self.capture_gaps > 0 {
            self.capture_gaps -= 1;
            return Ok(Vec::new());
        }
        let screen = self
            .screens
            .iter()
            .rev()
            .find(|(after, _)| *after <= self.actions_performed)
            .map(|(_, png)| png.clone())
            .unwrap_or_default();
        Ok(screen)
    }

    fn resolution(&mut self) -> ChannelResult<(u32, u32)> {
        Ok((self.width, self.height))
    }
}
