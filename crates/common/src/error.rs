//! Error types for storysnap

use thiserror::Error;

use crate::config::ValidationErrors;

/// Result type alias using the storysnap Error
pub type Result<T> = std::result::Result<T, Error>;

/// Why a plan came out empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoSnapshotsReason {
    /// Discovery returned no stories at all
    NoStories,
    /// Stories were discovered but every one was skipped, excluded or dropped
    AllFiltered { discovered: usize },
    /// The plan was non-empty but the selected shard holds nothing
    EmptyShard { index: usize, total: usize },
}

impl std::fmt::Display for NoSnapshotsReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoSnapshotsReason::NoStories => write!(f, "no stories were discovered"),
            NoSnapshotsReason::AllFiltered { discovered } => write!(
                f,
                "all {} discovered stories were filtered out",
                discovered
            ),
            NoSnapshotsReason::EmptyShard { index, total } => write!(
                f,
                "shard {} is empty ({} snapshots planned in total)",
                index, total
            ),
        }
    }
}

/// storysnap error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration:\n{0}")]
    ConfigValidation(ValidationErrors),

    #[error("Invalid option for {story}: {path}: {message}")]
    InvalidOption {
        story: String,
        path: String,
        message: String,
    },

    #[error("No snapshots found: {0}")]
    NoSnapshots(NoSnapshotsReason),

    #[error("Invalid shard options: {message} (count: {count}, size: {size}, total: {total})")]
    ShardConfiguration {
        message: String,
        count: String,
        size: String,
        total: usize,
    },

    #[error("Page crashed: {0}")]
    PageCrashed(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to upload snapshot '{name}' (story {story_id}): {source}")]
    Snapshot {
        story_id: String,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to upload resource {sha}: {source}")]
    ResourceUpload {
        sha: String,
        #[source]
        source: std::sync::Arc<Error>,
    },

    #[error("{failed} page unit(s) failed to upload; first failure: {first}")]
    UploadFailed { failed: usize, first: Box<Error> },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Operation timeout after {seconds}s: {what}")]
    Timeout { seconds: u64, what: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an error with the identity of the snapshot being processed
    pub fn for_snapshot(self, story_id: &str, name: &str) -> Self {
        match self {
            // Already carries an identity
            Error::Snapshot { .. } => self,
            other => Error::Snapshot {
                story_id: story_id.to_string(),
                name: name.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping snapshot identity wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Snapshot { source, .. } => source.root(),
            other => other,
        }
    }

    /// A 400-class conflict saying the snapshot name already exists
    pub fn is_duplicate_snapshot(&self) -> bool {
        match self.root() {
            Error::Api { status, message } => {
                (400..500).contains(status)
                    && (message.contains("must be unique") || message.contains("already exists"))
            }
            _ => false,
        }
    }

    /// Whether the page backing a capture went away
    pub fn is_page_crash(&self) -> bool {
        matches!(self.root(), Error::PageCrashed(_))
    }
}
