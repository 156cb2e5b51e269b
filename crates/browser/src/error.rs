//! Error types for the browser bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Playwright not found. Install with: npm install playwright && npx playwright install")]
    PlaywrightNotFound,

    #[error("Browser driver exited: {0}")]
    DriverExited(String),

    #[error("Browser driver timed out after {seconds}s waiting for {method}")]
    Timeout { method: String, seconds: u64 },

    #[error("Page crashed: {0}")]
    PageCrashed(String),

    #[error("Page error: {0}")]
    Page(String),

    #[error("Preview document at {url} unavailable after {attempts} attempts")]
    PreviewUnavailable { url: String, attempts: usize },

    #[error("Static server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type BrowserResult<T> = Result<T, BrowserError>;

impl From<BrowserError> for storysnap_common::Error {
    fn from(err: BrowserError) -> Self {
        use storysnap_common::Error;
        match err {
            BrowserError::PageCrashed(message) => Error::PageCrashed(message),
            BrowserError::Timeout { method, seconds } => Error::Timeout {
                seconds,
                what: method,
            },
            BrowserError::Io(e) => Error::Io(e),
            other => Error::Browser(other.to_string()),
        }
    }
}
