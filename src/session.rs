//! Session management for run output.
//!
//! Each session is a directory under the configured base that collects the
//! artifacts of one or more workflow runs:
//! - `.session.json` metadata written on `init()`
//! - one sub-directory per run holding `events.jsonl`, `summary.json`
//!   and evidence frames of failed verifications
//!
//! Sessions are removed on drop unless `keep` is set. Kept sessions pile up
//! under the base directory until `cleanup_old_sessions` removes them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config;

/// A run session with organized file management
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session ID
    pub id: String,
    /// Root directory for this session
    pub dir: PathBuf,
    /// Whether to keep files after session ends
    pub keep: bool,
    /// Workflow this session was created for
    pub workflow: Option<String>,
}

impl Session {
    /// Create a new session with a unique ID under the configured base
    pub fn new() -> Self {
        let id = generate_session_id();
        let dir = base_dir().join(&id);
        Self {
            id,
            dir,
            keep: false,
            workflow: None,
        }
    }

    /// Create a session named after a workflow
    pub fn for_workflow(name: &str) -> Self {
        let id = format!("{}_{}", sanitize_name(name), generate_timestamp_suffix());
        let dir = base_dir().join(&id);
        Self {
            id,
            dir,
            keep: false,
            workflow: Some(name.to_string()),
        }
    }

    /// Use a caller-chosen directory (kept by default)
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(generate_session_id);
        Self {
            id,
            dir,
            keep: true,
            workflow: None,
        }
    }

    /// Set whether to keep files after session ends
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Create the session directory and write its metadata
    pub fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let metadata = serde_json::json!({
            "id": self.id,
            "created": chrono::Utc::now().to_rfc3339(),
            "workflow": self.workflow,
            "pid": std::process::id(),
        });
        fs::write(self.dir.join(".session.json"), serde_json::to_string_pretty(&metadata)?)?;
        Ok(())
    }

    /// Directory for one run's artifacts
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.dir.join(sanitize_name(run_id))
    }

    /// Path for an evidence frame
    pub fn frame_path(&self, run_id: &str, name: &str) -> PathBuf {
        self.run_dir(run_id).join(format!("{}.png", sanitize_name(name)))
    }

    /// All PNG files in the session, recursively, sorted
    pub fn list_frames(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut frames = Vec::new();
        collect_pngs(&self.dir, &mut frames)?;
        frames.sort();
        Ok(frames)
    }

    /// Remove the session directory unless it is kept
    pub fn cleanup(&self) -> std::io::Result<()> {
        if self.dir.exists() && !self.keep {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

fn collect_pngs(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_pngs(&path, out)?;
        } else if path.extension().map(|e| e == "png").unwrap_or(false) {
            out.push(path);
        }
    }
    Ok(())
}

fn base_dir() -> PathBuf {
    PathBuf::from(config::session_base_dir())
}

/// Generate a unique session ID
fn generate_session_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("session_{}_{}", timestamp, std::process::id())
}

fn generate_timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Sanitize a name for use in filenames
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Remove sessions under `base` older than `max_age`
pub fn cleanup_old_sessions(base: &Path, max_age: std::time::Duration) -> std::io::Result<usize> {
    if !base.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut cleaned = 0;
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > max_age) && fs::remove_dir_all(&path).is_ok() {
            cleaned += 1;
        }
    }
    Ok(cleaned)
}

/// List the session directories under `base`
pub fn list_sessions(base: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut sessions = Vec::new();
    for entry in fs::read_dir(base)? {
        let path = entry?.path();
        if path.is_dir() {
            sessions.push(path);
        }
    }
    sessions.sort();
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_new() {
        let session = Session::new();
        assert!(session.id.starts_with("session_"));
        assert!(session.dir.starts_with(config::session_base_dir()));
        assert!(!session.keep);
    }

    #[test]
    fn test_session_for_workflow() {
        let session = Session::for_workflow("post listing");
        assert!(session.id.starts_with("post_listing_"));
        assert_eq!(session.workflow.as_deref(), Some("post listing"));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("hello world"), "hello_world");
        assert_eq!(sanitize_name("emulator-5554"), "emulator-5554");
        assert_eq!(sanitize_name("192.168.0.4:5555"), "192_168_0_4_5555");
    }

    #[test]
    fn test_paths_and_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("s1");
        let session = Session::in_dir(&dir).keep(false);
        session.init().unwrap();
        assert!(dir.join(".session.json").exists());

        let frame = session.frame_path("dev_1", "open exhausted");
        assert!(frame.ends_with("dev_1/open_exhausted.png"));
        fs::create_dir_all(frame.parent().unwrap()).unwrap();
        fs::write(&frame, b"png").unwrap();
        assert_eq!(session.list_frames().unwrap(), vec![frame]);

        session.cleanup().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_list_sessions_skips_files() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(list_sessions(&tmp.path().join("missing")).unwrap().is_empty());

        fs::create_dir(tmp.path().join("b_run")).unwrap();
        fs::create_dir(tmp.path().join("a_run")).unwrap();
        fs::write(tmp.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(
            list_sessions(tmp.path()).unwrap(),
            vec![tmp.path().join("a_run"), tmp.path().join("b_run")]
        );
    }

    #[test]
    fn test_cleanup_old_sessions_respects_age() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("old")).unwrap();

        let kept = cleanup_old_sessions(tmp.path(), std::time::Duration::from_secs(3600)).unwrap();
        assert_eq!(kept, 0);
        assert!(tmp.path().join("old").exists());

        std::thread::sleep(std::time::Duration::from_millis(50));
        let cleaned = cleanup_old_sessions(tmp.path(), std::time::Duration::from_millis(1)).unwrap();
        assert_eq!(cleaned, 1);
        assert!(list_sessions(tmp.path()).unwrap().is_empty());
    }
}
