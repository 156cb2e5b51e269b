//! Browser interface used for discovery and capture
//!
//! The in-page scripts live here so every [`DiscoveryBridge`] implementation
//! evaluates the same code.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{DomSnapshot, PreviewDocument, Story};

/// Viewport of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOptions {
    pub width: u32,
    pub height: u32,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 1024,
        }
    }
}

/// DOM capture settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Keep `<script>` elements in the serialized document
    pub enable_javascript: bool,
}

/// A function evaluated inside a page
///
/// `function` is a JavaScript function expression called with `arg`;
/// helper sources are declared in the same scope before the call.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalScript {
    pub function: String,
    pub arg: Value,
    pub helpers: Vec<String>,
}

impl EvalScript {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            arg: Value::Null,
            helpers: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: Value) -> Self {
        self.arg = arg;
        self
    }

    pub fn with_helper(mut self, source: impl Into<String>) -> Self {
        self.helpers.push(source.into());
        self
    }

    /// A self-contained expression evaluating to the function's result
    pub fn render(&self) -> String {
        format!(
            "(async () => {{\n{}\nreturn await ({})({});\n}})()",
            self.helpers.join("\n"),
            self.function.trim(),
            self.arg
        )
    }
}

/// One browser page
#[async_trait]
pub trait Page: Send {
    async fn goto(&mut self, url: &str) -> Result<()>;

    async fn eval(&mut self, script: &EvalScript) -> Result<Value>;

    /// Serialize the current document
    async fn snapshot(&mut self, options: &CaptureOptions) -> Result<DomSnapshot> {
        let script = EvalScript::new(SERIALIZE_DOM_JS)
            .with_arg(json!({ "enableJavaScript": options.enable_javascript }));
        match self.eval(&script).await? {
            Value::String(html) => Ok(DomSnapshot { html }),
            other => Err(Error::Browser(format!(
                "DOM serialization returned {} instead of a string",
                other
            ))),
        }
    }

    /// Close the page; safe to call more than once
    async fn close(&mut self) -> Result<()>;
}

/// Browser access for story discovery and capture
#[async_trait]
pub trait DiscoveryBridge: Send + Sync {
    /// Fetch the catalog's preview document, waiting for it to come up
    async fn fetch_preview_document(&self, url: &str) -> Result<PreviewDocument>;

    /// Open a fresh page
    async fn page(&self, options: &PageOptions) -> Result<Box<dyn Page>>;
}

/// Read every story from the catalog's story store
///
/// The page is closed whether or not discovery succeeds.
pub async fn discover_stories(
    bridge: &dyn DiscoveryBridge,
    preview_url: &str,
) -> Result<Vec<Story>> {
    let mut page = bridge.page(&PageOptions::default()).await?;

    let result = read_story_store(page.as_mut(), preview_url).await;
    if let Err(e) = page.close().await {
        warn!("failed to close discovery page: {}", e);
    }

    let raw = result?;
    let stories = raw
        .iter()
        .map(Story::from_discovery)
        .collect::<Result<Vec<_>>>()?;
    debug!("discovered {} stories", stories.len());
    Ok(stories)
}

async fn read_story_store(page: &mut dyn Page, preview_url: &str) -> Result<Vec<Value>> {
    page.goto(preview_url).await?;
    let value = page
        .eval(&EvalScript::new(READ_STORY_STORE_JS).with_helper(SERIALIZE_VALUE_JS))
        .await?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(Error::Browser(format!(
            "story discovery returned {} instead of a list",
            other
        ))),
    }
}

/// Converts story parameters into JSON, marking what JSON cannot carry
pub const SERIALIZE_VALUE_JS: &str = r#"
function serializeStoryValue(value) {
  if (value === undefined) return { $undefined: true };
  if (value === null) return null;
  if (value instanceof Date) return { $date: value.toISOString() };
  if (value instanceof RegExp) return value.toString();
  if (typeof value === 'function') return { $unsupported: 'function' };
  if (typeof value === 'number' && !Number.isFinite(value)) return { $unsupported: 'number' };
  if (Array.isArray(value)) return value.map(serializeStoryValue);
  if (typeof value === 'object') {
    const proto = Object.getPrototypeOf(value);
    if (proto !== Object.prototype && proto !== null) {
      return { $unsupported: (value.constructor && value.constructor.name) || 'object' };
    }
    return Object.fromEntries(Object.entries(value).map(([k, v]) => [k, serializeStoryValue(v)]));
  }
  return value;
}
"#;

/// Waits for the story store and lists every story
pub const READ_STORY_STORE_JS: &str = r#"
async () => {
  const serializeStory = (story) => {
    const bag = story.parameters && story.parameters.storysnap;
    return {
      id: story.id,
      kind: story.kind || story.title,
      name: story.name || story.story,
      parameters: bag === undefined ? {} : { storysnap: serializeStoryValue(bag) },
    };
  };

  for (let attempt = 0; attempt < 100; attempt++) {
    const preview = window.__STORYBOOK_PREVIEW__;
    if (preview && typeof preview.extract === 'function') {
      if (typeof preview.ready === 'function') await preview.ready();
      return Object.values(await preview.extract()).map(serializeStory);
    }
    const store = window.__STORYBOOK_STORY_STORE__;
    if (store && typeof store.extract === 'function') {
      if (typeof store.cacheAllCSFFiles === 'function') await store.cacheAllCSFFiles();
      return Object.values(store.extract()).map(serializeStory);
    }
    const clientApi = window.__STORYBOOK_CLIENT_API__;
    if (clientApi && typeof clientApi.raw === 'function') {
      return clientApi.raw().map(serializeStory);
    }
    await new Promise((resolve) => setTimeout(resolve, 100));
  }
  throw new Error('storybook story store not found');
}
"#;

/// Replays decoded args and globals into the rendered story and waits for it
pub const PREPARE_STORY_JS: &str = r#"
async ({ id, args, globals }) => {
  const channel = window.__STORYBOOK_ADDONS_CHANNEL__;
  if (channel && args && Object.keys(args).length) {
    channel.emit('updateStoryArgs', { storyId: id, updatedArgs: decodeStoryArg(args) });
  }
  if (channel && globals && Object.keys(globals).length) {
    channel.emit('updateGlobals', { globals: decodeStoryArg(globals) });
  }
  for (let attempt = 0; attempt < 100; attempt++) {
    const root = document.querySelector('#storybook-root, #root');
    if (root && root.childElementCount > 0) return true;
    await new Promise((resolve) => setTimeout(resolve, 100));
  }
  return false;
}
"#;

/// Serializes the document, dropping scripts unless JavaScript is enabled
pub const SERIALIZE_DOM_JS: &str = r#"
({ enableJavaScript }) => {
  const doc = document.documentElement.cloneNode(true);
  if (!enableJavaScript) {
    doc.querySelectorAll('script, noscript').forEach((node) => node.remove());
  }
  document.querySelectorAll('input, textarea, select').forEach((live, i) => {
    const copy = doc.querySelectorAll('input, textarea, select')[i];
    if (!copy) return;
    if (live.type === 'checkbox' || live.type === 'radio') {
      if (live.checked) copy.setAttribute('checked', '');
    } else if (live.tagName === 'TEXTAREA') {
      copy.textContent = live.value;
    } else {
      copy.setAttribute('value', live.value);
    }
  });
  return '<!DOCTYPE html>' + doc.outerHTML;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct FakePage {
        stories: Value,
        closed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Page for FakePage {
        async fn goto(&mut self, _url: &str) -> Result<()> {
            Ok(())
        }

        async fn eval(&mut self, script: &EvalScript) -> Result<Value> {
            if script.function == SERIALIZE_DOM_JS {
                return Ok(Value::String("<!DOCTYPE html><html></html>".into()));
            }
            Ok(self.stories.clone())
        }

        async fn close(&mut self) -> Result<()> {
            *self.closed.lock() = true;
            Ok(())
        }
    }

    struct FakeBridge {
        stories: Value,
        closed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl DiscoveryBridge for FakeBridge {
        async fn fetch_preview_document(&self, url: &str) -> Result<PreviewDocument> {
            Err(Error::Browser(format!("not served: {}", url)))
        }

        async fn page(&self, _options: &PageOptions) -> Result<Box<dyn Page>> {
            Ok(Box::new(FakePage {
                stories: self.stories.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    #[test]
    fn test_render_includes_helpers_and_arg() {
        let script = EvalScript::new("(x) => x + 1")
            .with_helper("const one = 1;")
            .with_arg(json!(41));
        let rendered = script.render();
        assert!(rendered.contains("const one = 1;"));
        assert!(rendered.contains("((x) => x + 1)(41)"));
    }

    #[tokio::test]
    async fn test_discovery_closes_page() {
        let closed = Arc::new(Mutex::new(false));
        let bridge = FakeBridge {
            stories: json!([{ "id": "a--b", "title": "A", "name": "b" }]),
            closed: closed.clone(),
        };

        let stories = discover_stories(&bridge, "http://localhost/iframe.html").await.unwrap();
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].display_name(), "A: b");
        assert!(*closed.lock());
    }

    #[tokio::test]
    async fn test_discovery_failure_still_closes_page() {
        let closed = Arc::new(Mutex::new(false));
        let bridge = FakeBridge {
            stories: json!({ "not": "a list" }),
            closed: closed.clone(),
        };

        assert!(discover_stories(&bridge, "http://localhost/iframe.html").await.is_err());
        assert!(*closed.lock());
    }

    #[tokio::test]
    async fn test_default_snapshot_uses_dom_serializer() {
        let mut page = FakePage {
            stories: Value::Null,
            closed: Arc::new(Mutex::new(false)),
        };
        let dom = page.snapshot(&CaptureOptions::default()).await.unwrap();
        assert!(dom.html.starts_with("<!DOCTYPE html>"));
    }
}
