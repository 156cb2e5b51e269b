//! Remote visual-diffing service interface

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::types::{Build, Device, RemoteSnapshot, Resource, SnapshotRequest};

/// Client identity and build metadata sent when creating a build
///
/// Built once at startup and handed to the concrete client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientInfo {
    /// `storysnap/{version}`
    pub client: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    /// Set for sharded runs, which upload part of a build
    pub partial: bool,
}

impl ClientInfo {
    pub fn new(version: &str) -> Self {
        Self {
            client: format!("storysnap/{}", version),
            branch: None,
            commit_sha: None,
            partial: false,
        }
    }

    pub fn with_git(mut self, branch: Option<String>, commit_sha: Option<String>) -> Self {
        self.branch = branch;
        self.commit_sha = commit_sha;
        self
    }

    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }
}

/// Build lifecycle calls against the remote service
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Create the build; the response lists build resources the server lacks
    async fn create_build(&self, resources: &[Resource]) -> Result<Build>;

    /// Rendering targets of the build
    async fn device_details(&self, build_id: &str) -> Result<Vec<Device>>;

    /// Upload one resource's content
    async fn upload_resource(&self, build_id: &str, resource: &Resource) -> Result<()>;

    /// Create a snapshot from its root and build resources; the response lists
    /// what the server lacks
    async fn create_snapshot(
        &self,
        build_id: &str,
        request: &SnapshotRequest,
        resources: &[&Resource],
    ) -> Result<RemoteSnapshot>;

    async fn finalize_snapshot(&self, snapshot_id: &str) -> Result<()>;

    async fn finalize_build(&self, build_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_info() {
        let info = ClientInfo::new("1.2.3")
            .with_git(Some("main".into()), None)
            .partial(true);

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["client"], "storysnap/1.2.3");
        assert_eq!(value["branch"], "main");
        assert_eq!(value["partial"], true);
        assert!(value.get("commit-sha").is_none());
    }
}
