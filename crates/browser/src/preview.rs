//! Preview document fetching

use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use storysnap_common::resources::hash;
use storysnap_common::PreviewDocument;

use crate::error::{BrowserError, BrowserResult};

/// Retry policy while waiting for a catalog to come up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewWait {
    pub attempts: usize,
    pub interval: Duration,
    /// Log a single warning once the wait exceeds this
    pub warn_after: Duration,
}

impl Default for PreviewWait {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_millis(1000),
            warn_after: Duration::from_secs(5),
        }
    }
}

/// Fetch the preview document, retrying until the server answers
pub async fn fetch_preview_document(
    client: &reqwest::Client,
    url: &str,
    wait: &PreviewWait,
) -> BrowserResult<PreviewDocument> {
    let start = Instant::now();
    let mut warned = false;

    for attempt in 1..=wait.attempts {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let content = resp.text().await?;
                debug!("fetched preview document {} after {} attempt(s)", url, attempt);
                return Ok(PreviewDocument {
                    url: url.to_string(),
                    sha: hash(content.as_bytes()),
                    content,
                });
            }
            Ok(resp) => {
                debug!("preview document returned {}", resp.status());
            }
            Err(e) => {
                if attempt == 1 {
                    info!("Waiting for storybook at {}...", url);
                }
                // Connection refused is expected while storybook is starting
                if !e.is_connect() {
                    debug!("preview document error: {}", e);
                }
            }
        }

        if !warned && start.elapsed() >= wait.warn_after {
            warn!("still waiting for storybook at {}", url);
            warned = true;
        }
        if attempt < wait.attempts {
            sleep(wait.interval).await;
        }
    }

    Err(BrowserError::PreviewUnavailable {
        url: url.to_string(),
        attempts: wait.attempts,
    })
}
