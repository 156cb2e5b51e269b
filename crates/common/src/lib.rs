//! storysnap Common Library
//!
//! Story planning, option resolution, resource hashing and upload
//! orchestration shared by the storysnap crates.

pub mod api;
pub mod args;
pub mod bridge;
pub mod config;
pub mod error;
pub mod filter;
pub mod planner;
pub mod resources;
pub mod types;
pub mod upload;

// Re-export commonly used types
pub use api::{ApiClient, ClientInfo};
pub use bridge::{discover_stories, CaptureOptions, DiscoveryBridge, EvalScript, Page, PageOptions};
pub use config::{GlobalConfig, OptionsLayer, SnapshotOptions, ValidationErrors};
pub use error::{Error, NoSnapshotsReason, Result};
pub use filter::{should_skip, Pattern};
pub use planner::{plan, ShardOptions};
pub use types::*;
pub use upload::{RunReport, UploadOrchestrator, UploadProgress, UPLOAD_CONCURRENCY};

/// storysnap version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable disabling storysnap entirely
pub const ENABLE_ENV: &str = "STORYSNAP_ENABLE";

/// Environment variable holding the API token
pub const TOKEN_ENV: &str = "STORYSNAP_TOKEN";

/// Whether an `STORYSNAP_ENABLE` value disables runs
pub fn is_disabled(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("0") | Some("false")
    )
}
