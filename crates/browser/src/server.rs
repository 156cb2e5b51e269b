//! Local static server for built catalogs

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{BrowserError, BrowserResult};

/// Handle to a running static server; stops when dropped
pub struct StaticServer {
    root: PathBuf,
    base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StaticServer {
    /// Serve `root` on a free loopback port
    pub async fn serve(root: &Path) -> BrowserResult<Self> {
        if !root.is_dir() {
            return Err(BrowserError::Server(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let app = Router::new()
            .fallback_service(ServeDir::new(root))
            .layer(TraceLayer::new_for_http());

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let base_url = format!("http://{}", addr);

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                warn!("static server stopped: {}", e);
            }
        });

        info!("Serving {} at {}", root.display(), base_url);
        Ok(Self {
            root: root.to_path_buf(),
            base_url,
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    /// Get the base URL for this server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop the server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            info!("Stopping static server at {}", self.base_url);
            let _ = tx.send(());
        }
    }

    /// Stop and wait for the server task to finish
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StaticServer {
    fn drop(&mut self) {
        self.stop();
    }
}
