pub mod backend;
pub mod sampler;
pub mod types;
pub mod utils;

pub use backend::{CaptureBackend, DeviceBackend, MockFramebuffer};
pub use sampler::{SamplerConfig, ScreenSampler};
pub use types::{Frame, FrameRecord, SnapshotError, SnapshotResult};
pub use utils::{create_base_metadata, generate_filename, generate_timestamp, save_frame, write_manifest};
