use chrono::Utc;
use std::fs;
use std::path::Path;

use crate::snapshot::types::{Frame, FrameRecord, SnapshotResult};

/// Generate a timestamp string in YYYYMMDD_HHMMSS format
pub fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Generate a filename for frame images
pub fn generate_filename(prefix: &str, timestamp: &str) -> String {
    format!("{}_{}.png", prefix, timestamp)
}

/// Create base metadata map for a saved frame
pub fn create_base_metadata(frame: &Frame, source: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut meta = serde_json::Map::new();
    meta.insert("width".to_string(), frame.width().into());
    meta.insert("height".to_string(), frame.height().into());
    let (ox, oy) = frame.origin();
    meta.insert("origin".to_string(), serde_json::json!([ox, oy]));
    meta.insert("source".to_string(), source.into());
    meta
}

/// Write `frame` as `<dir>/<name>.png` with a JSON manifest next to it.
///
/// `extra` is merged into the manifest metadata (step id, score, ...).
pub fn save_frame(
    frame: &Frame,
    dir: &Path,
    name: &str,
    source: &str,
    extra: Option<serde_json::Value>,
) -> SnapshotResult<FrameRecord> {
    fs::create_dir_all(dir)?;
    let image_path = dir.join(format!("{}.png", name));
    fs::write(&image_path, frame.to_png()?)?;

    let mut metadata = create_base_metadata(frame, source);
    if let Some(serde_json::Value::Object(fields)) = extra {
        metadata.extend(fields);
    }

    let record = FrameRecord {
        image_path,
        source: source.to_string(),
        metadata: Some(serde_json::Value::Object(metadata)),
        timestamp: frame.captured_at(),
    };
    write_manifest(&record)?;
    Ok(record)
}

/// Write the JSON manifest for a saved frame
pub fn write_manifest(record: &FrameRecord) -> SnapshotResult<()> {
    let manifest_path = record.image_path.with_extension("json");
    fs::write(manifest_path, serde_json::to_string_pretty(record)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MockFramebuffer;

    #[test]
    fn test_generate_filename() {
        assert_eq!(generate_filename("step", "20240101_120000"), "step_20240101_120000.png");
    }

    #[test]
    fn test_save_frame_writes_png_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let frame = MockFramebuffer::with_color(12, 6, [10, 20, 30]).to_frame();
        let record = save_frame(
            &frame,
            dir.path(),
            "login_missed",
            "device",
            Some(serde_json::json!({ "step_id": "login", "score": 0.2 })),
        )
        .unwrap();

        assert!(record.image_path.exists());
        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(record.image_path.with_extension("json")).unwrap()).unwrap();
        assert_eq!(manifest["source"], "device");
        assert_eq!(manifest["metadata"]["width"], 12);
        assert_eq!(manifest["metadata"]["step_id"], "login");

        let reloaded = Frame::from_encoded(&fs::read(&record.image_path).unwrap()).unwrap();
        assert_eq!(reloaded.image(), frame.image());
    }
}
