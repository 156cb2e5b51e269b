//! Visual-diffing service REST client

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use storysnap_common::{
    ApiClient, Build, ClientInfo, Device, Error, RemoteSnapshot, Resource, Result, SnapshotRequest,
};

/// Default service endpoint
pub const DEFAULT_API_URL: &str = "https://api.storysnap.io";

/// JSON:API client for the visual-diffing service
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    info: ClientInfo,
}

impl RestClient {
    pub fn new(base_url: &str, token: &str, info: ClientInfo) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(info.client.as_str())
            .build()
            .map_err(transport)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            info,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        debug!("POST {}", path);
        let resp = self
            .http
            .post(self.url(path))
            .header("Authorization", format!("Token token={}", self.token))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        read_body(resp).await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        debug!("GET {}", path);
        let resp = self
            .http
            .get(self.url(path))
            .header("Authorization", format!("Token token={}", self.token))
            .send()
            .await
            .map_err(transport)?;
        read_body(resp).await
    }
}

#[async_trait]
impl ApiClient for RestClient {
    async fn create_build(&self, resources: &[Resource]) -> Result<Build> {
        let body = json!({
            "data": {
                "type": "builds",
                "attributes": {
                    "client": self.info.client,
                    "branch": self.info.branch,
                    "commit-sha": self.info.commit_sha,
                    "partial": self.info.partial,
                },
                "relationships": {
                    "resources": { "data": resource_identifiers(resources.iter()) }
                }
            }
        });

        let doc = self.post("builds", &body).await?;
        Ok(Build {
            id: resource_id(&doc)?,
            web_url: doc["data"]["attributes"]["web-url"].as_str().map(String::from),
            missing_resources: missing_shas(&doc),
        })
    }

    async fn device_details(&self, build_id: &str) -> Result<Vec<Device>> {
        let doc = self
            .get(&format!("discovery/device-details?build_id={}", urlencoding::encode(build_id)))
            .await?;
        Ok(serde_json::from_value(doc)?)
    }

    async fn upload_resource(&self, build_id: &str, resource: &Resource) -> Result<()> {
        let content = base64::engine::general_purpose::STANDARD.encode(&resource.content);
        let body = json!({
            "data": {
                "type": "resources",
                "id": resource.sha,
                "attributes": { "base64-content": content }
            }
        });
        self.post(&format!("builds/{}/resources", build_id), &body).await?;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        build_id: &str,
        request: &SnapshotRequest,
        resources: &[&Resource],
    ) -> Result<RemoteSnapshot> {
        let mut attributes = serde_json::to_value(request)?;
        if let Some(map) = attributes.as_object_mut() {
            // Widths unset here means the service picks its defaults
            map.entry("widths").or_insert(Value::Null);
        }

        let body = json!({
            "data": {
                "type": "snapshots",
                "attributes": attributes,
                "relationships": {
                    "resources": { "data": resource_identifiers(resources.iter().copied()) }
                }
            }
        });

        let doc = self.post(&format!("builds/{}/snapshots", build_id), &body).await?;
        Ok(RemoteSnapshot {
            id: resource_id(&doc)?,
            missing_resources: missing_shas(&doc),
        })
    }

    async fn finalize_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.post(&format!("snapshots/{}/finalize", snapshot_id), &json!({}))
            .await?;
        Ok(())
    }

    async fn finalize_build(&self, build_id: &str) -> Result<()> {
        self.post(&format!("builds/{}/finalize", build_id), &json!({}))
            .await?;
        Ok(())
    }
}

fn transport(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout {
            seconds: 60,
            what: err.url().map(|u| u.path().to_string()).unwrap_or_default(),
        }
    } else {
        Error::Transport(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ErrorDocument {
    #[serde(default)]
    errors: Vec<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

async fn read_body(resp: Response) -> Result<Value> {
    let status = resp.status();
    let text = resp.text().await.map_err(transport)?;

    if !status.is_success() {
        return Err(Error::Api {
            status: status.as_u16(),
            message: error_message(status, &text),
        });
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

/// Unwrap `{"errors":[{"detail":...}]}` bodies into one message
fn error_message(status: StatusCode, body: &str) -> String {
    let details: Vec<String> = serde_json::from_str::<ErrorDocument>(body)
        .map(|doc| {
            doc.errors
                .into_iter()
                .filter_map(|e| e.detail.or(e.title))
                .collect()
        })
        .unwrap_or_default();

    if !details.is_empty() {
        details.join(", ")
    } else if !body.trim().is_empty() {
        body.trim().to_string()
    } else {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    }
}

fn resource_identifiers<'a>(resources: impl Iterator<Item = &'a Resource>) -> Vec<Value> {
    resources
        .map(|r| {
            json!({
                "type": "resources",
                "id": r.sha,
                "attributes": {
                    "resource-url": r.resource_url,
                    "mimetype": r.mimetype,
                    "is-root": r.is_root,
                }
            })
        })
        .collect()
}

fn resource_id(doc: &Value) -> Result<String> {
    doc["data"]["id"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| Error::Api {
            status: 200,
            message: "response has no data.id".into(),
        })
}

fn missing_shas(doc: &Value) -> Vec<String> {
    doc["data"]["relationships"]["missing-resources"]["data"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["id"].as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(r#"{"errors":[{"detail":"name must be unique"}]}"#, "name must be unique" ; "detail")]
    #[test_case(r#"{"errors":[{"detail":"a"},{"title":"b"}]}"#, "a, b" ; "several")]
    #[test_case("upstream went away", "upstream went away" ; "plain text")]
    #[test_case("", "Bad Request" ; "empty")]
    fn test_error_message(body: &str, expected: &str) {
        assert_eq!(error_message(StatusCode::BAD_REQUEST, body), expected);
    }

    #[test]
    fn test_missing_shas() {
        let doc = json!({
            "data": {
                "id": "1",
                "relationships": {
                    "missing-resources": { "data": [{ "id": "aa" }, { "id": "bb" }] }
                }
            }
        });
        assert_eq!(missing_shas(&doc), vec!["aa", "bb"]);
        assert!(missing_shas(&json!({ "data": { "id": "1" } })).is_empty());
    }

    #[test]
    fn test_duplicate_response_is_recognised() {
        let err = Error::Api {
            status: 400,
            message: error_message(
                StatusCode::BAD_REQUEST,
                r#"{"errors":[{"detail":"The name of each snapshot must be unique"}]}"#,
            ),
        };
        assert!(err.is_duplicate_snapshot());
    }
}
