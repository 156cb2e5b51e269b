//! Core types for storysnap

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::args::ArgMap;
use crate::error::{Error, Result};

/// Parameter namespace holding storysnap options on each story
pub const PARAMETERS_KEY: &str = "storysnap";

/// A story discovered from the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    /// Stable story identifier, e.g. `button--primary`
    pub id: String,

    /// Group the story belongs to, e.g. `Button`
    pub kind: String,

    /// Story name within its group
    pub name: String,

    /// The storysnap parameter bag (`parameters.storysnap`), `null` when absent
    #[serde(default)]
    pub parameters: Value,
}

impl Story {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            name: name.into(),
            parameters: Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// `"{kind}: {name}"`, the name snapshots are reported under
    pub fn display_name(&self) -> String {
        format!("{}: {}", self.kind, self.name)
    }

    /// Build a story from one entry of the discovery script's output
    ///
    /// Accepts both the modern shape (`title`) and the legacy one (`kind`).
    pub fn from_discovery(value: &Value) -> Result<Self> {
        let field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);

        let kind = field("kind")
            .or_else(|| field("title"))
            .ok_or_else(|| Error::Browser(format!("story without a kind: {}", value)))?;
        let name = field("name")
            .ok_or_else(|| Error::Browser(format!("story without a name: {}", value)))?;
        let id = field("id").unwrap_or_else(|| legacy_story_id(&kind, &name));
        let parameters = value
            .get("parameters")
            .and_then(|p| p.get(PARAMETERS_KEY))
            .cloned()
            .unwrap_or(Value::Null);

        Ok(Self {
            id,
            kind,
            name,
            parameters,
        })
    }
}

/// Storybook's id scheme for catalogs that predate story ids
fn legacy_story_id(kind: &str, name: &str) -> String {
    let sanitize = |s: &str| {
        s.to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    };
    format!("{}--{}", sanitize(kind), sanitize(name))
}

/// One concrete, upload-ready snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedSnapshot {
    /// Story id this snapshot renders
    pub id: String,

    /// Final display name
    pub name: String,

    /// Fully qualified preview URL
    pub url: String,

    /// Query string of `url`, without the leading `?`
    pub encoded_params: String,

    pub widths: Vec<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_height: Option<u32>,

    pub enable_javascript: bool,

    /// Validated args, replayed into the page at capture time
    #[serde(skip)]
    pub args: ArgMap,

    /// Validated globals, replayed into the page at capture time
    #[serde(skip)]
    pub globals: ArgMap,
}

/// Serialized page content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub html: String,
}

/// The catalog's preview document (`iframe.html`)
#[derive(Debug, Clone)]
pub struct PreviewDocument {
    pub url: String,
    pub content: String,
    pub sha: String,
}

/// A content-addressed asset
#[derive(Clone, PartialEq)]
pub struct Resource {
    /// Root-relative URL the asset is served under
    pub resource_url: String,
    pub content: Vec<u8>,
    /// SHA-256 of `content`, lower-case hex
    pub sha: String,
    pub mimetype: String,
    /// The serialized HTML document of a snapshot
    pub is_root: bool,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("resource_url", &self.resource_url)
            .field("sha", &self.sha)
            .field("mimetype", &self.mimetype)
            .field("is_root", &self.is_root)
            .field("len", &self.content.len())
            .finish()
    }
}

/// Server-side build
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Build {
    pub id: String,
    pub web_url: Option<String>,
    /// Shas the server does not have yet
    pub missing_resources: Vec<String>,
}

/// Server-side snapshot record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteSnapshot {
    pub id: String,
    pub missing_resources: Vec<String>,
}

/// Capture options sent with a snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub widths: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_height: Option<u32>,
    pub enable_javascript: bool,
}

impl From<&PlannedSnapshot> for SnapshotRequest {
    fn from(snapshot: &PlannedSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            widths: snapshot.widths.clone(),
            minimum_height: snapshot.minimum_height,
            enable_javascript: snapshot.enable_javascript,
        }
    }
}

/// A rendering target reported by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_scale_factor")]
    pub device_scale_factor: f64,
}

fn default_scale_factor() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_story_from_modern_discovery() {
        let story = Story::from_discovery(&json!({
            "id": "button--primary",
            "title": "Button",
            "name": "Primary",
            "parameters": { "storysnap": { "skip": true }, "docs": {} }
        }))
        .unwrap();

        assert_eq!(story.id, "button--primary");
        assert_eq!(story.display_name(), "Button: Primary");
        assert_eq!(story.parameters, json!({ "skip": true }));
    }

    #[test]
    fn test_story_from_legacy_discovery() {
        let story = Story::from_discovery(&json!({ "kind": "Image Post", "name": "with caption" }))
            .unwrap();

        assert_eq!(story.id, "image-post--with-caption");
        assert_eq!(story.parameters, Value::Null);
    }

    #[test]
    fn test_story_without_name_is_rejected() {
        assert!(Story::from_discovery(&json!({ "kind": "Button" })).is_err());
    }

    #[test]
    fn test_snapshot_request_wire_names() {
        let request = SnapshotRequest {
            name: "Button: Primary".into(),
            widths: vec![375],
            minimum_height: Some(600),
            enable_javascript: false,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["minimum-height"], 600);
        assert_eq!(value["enable-javascript"], false);
    }
}
