//! Build lifecycle and snapshot uploads
//!
//! A run creates one build, uploads the build resources the server lacks,
//! plans the snapshots and drains them through a fixed pool of page workers.
//! The build is finalized exactly once after it exists, whether or not
//! planning or any upload failed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::args::{encode_map, EncodedValue, ARG_CODEC_JS};
use crate::bridge::{
    CaptureOptions, DiscoveryBridge, EvalScript, Page, PageOptions, PREPARE_STORY_JS,
};
use crate::config::GlobalConfig;
use crate::error::{Error, Result};
use crate::planner::{plan, ShardOptions};
use crate::resources::{make_root_resource, missing_resources};
use crate::types::{Build, PlannedSnapshot, PreviewDocument, Resource, SnapshotRequest, Story};

/// Concurrent pages and concurrent build resource uploads
pub const UPLOAD_CONCURRENCY: usize = 5;

/// Pages opened for one unit before giving up on crashes
pub const MAX_PAGE_ATTEMPTS: usize = 3;

/// Lifecycle of the remote build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Created,
    ResourcesUploading,
    SnapshotsUploading,
    Finalized,
}

impl BuildState {
    pub fn can_transition_to(self, next: BuildState) -> bool {
        use BuildState::*;
        matches!(
            (self, next),
            (Created, ResourcesUploading)
                | (ResourcesUploading, SnapshotsUploading)
                | (Created | ResourcesUploading | SnapshotsUploading, Finalized)
        )
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BuildState::Created => "created",
            BuildState::ResourcesUploading => "resources-uploading",
            BuildState::SnapshotsUploading => "snapshots-uploading",
            BuildState::Finalized => "finalized",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
struct BuildLifecycle {
    state: BuildState,
}

impl BuildLifecycle {
    fn new() -> Self {
        Self {
            state: BuildState::Created,
        }
    }

    fn advance(&mut self, next: BuildState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("build {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }
}

/// Observer of upload progress
pub trait UploadProgress: Send + Sync {
    /// Number of snapshots planned for upload
    fn found(&self, _total: usize) {}

    fn uploaded(&self, _name: &str) {}

    fn skipped(&self, _name: &str) {}

    fn failed(&self, _name: &str, _error: &Error) {}
}

/// Progress observer that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl UploadProgress for NoProgress {}

/// Summary of a finished run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub build_id: String,
    pub web_url: Option<String>,
    pub planned: usize,
    pub uploaded: usize,
    /// Snapshots the server already had under the same name
    pub skipped: usize,
    pub resources_uploaded: usize,
}

/// An upload every caller needing the same sha awaits
type ResourceUpload = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

/// State shared by the workers of one run
struct RunContext<'a> {
    build_id: &'a str,
    queue: Mutex<VecDeque<Vec<PlannedSnapshot>>>,
    /// Started or finished uploads by sha; failed ones are removed
    uploads: Mutex<HashMap<String, ResourceUpload>>,
    failures: Mutex<Vec<Error>>,
    uploaded: AtomicUsize,
    skipped: AtomicUsize,
    resources_uploaded: AtomicUsize,
}

impl<'a> RunContext<'a> {
    fn new(build_id: &'a str) -> Self {
        Self {
            build_id,
            queue: Mutex::new(VecDeque::new()),
            uploads: Mutex::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
            uploaded: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            resources_uploaded: AtomicUsize::new(0),
        }
    }
}

/// Drives one storysnap run against the remote service
pub struct UploadOrchestrator {
    api: Arc<dyn ApiClient>,
    bridge: Arc<dyn DiscoveryBridge>,
    progress: Arc<dyn UploadProgress>,
    preview: PreviewDocument,
    resources: Vec<Resource>,
    shard: ShardOptions,
    page_options: PageOptions,
    concurrency: usize,
}

impl UploadOrchestrator {
    pub fn new(
        api: Arc<dyn ApiClient>,
        bridge: Arc<dyn DiscoveryBridge>,
        preview: PreviewDocument,
    ) -> Self {
        Self {
            api,
            bridge,
            progress: Arc::new(NoProgress),
            preview,
            resources: Vec::new(),
            shard: ShardOptions::default(),
            page_options: PageOptions::default(),
            concurrency: UPLOAD_CONCURRENCY,
        }
    }

    /// Build resources shared by every snapshot
    pub fn with_resources(mut self, resources: Vec<Resource>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_shard(mut self, shard: ShardOptions) -> Self {
        self.shard = shard;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn UploadProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_page_options(mut self, page_options: PageOptions) -> Self {
        self.page_options = page_options;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Plan and upload every snapshot of `stories`
    pub async fn run(&self, stories: &[Story], global: &GlobalConfig) -> Result<RunReport> {
        let mut lifecycle = BuildLifecycle::new();
        let build = self.api.create_build(&self.resources).await?;
        info!("created build {}", build.id);

        let outcome = self.upload_build(&build, &mut lifecycle, stories, global).await;

        lifecycle.advance(BuildState::Finalized)?;
        let finalized = self.api.finalize_build(&build.id).await;

        match (outcome, finalized) {
            (Ok(report), Ok(())) => {
                info!("finalized build {}", build.id);
                Ok(report)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => {
                info!("finalized build {} after failure", build.id);
                Err(e)
            }
            (Err(e), Err(finalize_error)) => {
                warn!("failed to finalize build {}: {}", build.id, finalize_error);
                Err(e)
            }
        }
    }

    async fn upload_build(
        &self,
        build: &Build,
        lifecycle: &mut BuildLifecycle,
        stories: &[Story],
        global: &GlobalConfig,
    ) -> Result<RunReport> {
        let ctx = RunContext::new(&build.id);

        lifecycle.advance(BuildState::ResourcesUploading)?;
        self.log_devices(&build.id).await;
        self.upload_build_resources(&ctx, build).await?;

        let snapshots = plan(stories, global, &self.preview.url, &self.shard)?;
        let planned = snapshots.len();
        info!("found {} snapshot(s)", planned);
        self.progress.found(planned);

        lifecycle.advance(BuildState::SnapshotsUploading)?;
        let units = page_units(snapshots);
        let workers = self.concurrency.min(units.len());
        ctx.queue.lock().extend(units);

        futures::future::join_all((0..workers).map(|_| self.worker(&ctx))).await;

        let mut failures = std::mem::take(&mut *ctx.failures.lock());
        if !failures.is_empty() {
            let failed = failures.len();
            return Err(Error::UploadFailed {
                failed,
                first: Box::new(failures.remove(0)),
            });
        }

        Ok(RunReport {
            build_id: build.id.clone(),
            web_url: build.web_url.clone(),
            planned,
            uploaded: ctx.uploaded.load(Ordering::SeqCst),
            skipped: ctx.skipped.load(Ordering::SeqCst),
            resources_uploaded: ctx.resources_uploaded.load(Ordering::SeqCst),
        })
    }

    async fn log_devices(&self, build_id: &str) {
        match self.api.device_details(build_id).await {
            Ok(devices) => {
                for device in devices {
                    debug!(
                        "rendering on {} ({}x{} @{}x)",
                        device.name, device.width, device.height, device.device_scale_factor
                    );
                }
            }
            Err(e) => warn!("could not fetch device details: {}", e),
        }
    }

    async fn upload_build_resources(&self, ctx: &RunContext<'_>, build: &Build) -> Result<()> {
        let missing = missing_resources(Some(build.missing_resources.as_slice()), &self.resources);
        if missing.is_empty() {
            return Ok(());
        }
        debug!("uploading {} build resource(s)", missing.len());

        let results: Vec<Result<bool>> = stream::iter(missing)
            .map(|resource| self.upload_once(ctx, resource))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    /// Upload a resource unless this run already did; true when this call
    /// performed the upload
    ///
    /// Callers arriving while the same sha is in flight wait for that upload
    /// and share its outcome.
    async fn upload_once(&self, ctx: &RunContext<'_>, resource: &Resource) -> Result<bool> {
        let (upload, started) = {
            let mut uploads = ctx.uploads.lock();
            match uploads.get(&resource.sha) {
                Some(upload) => (upload.clone(), false),
                None => {
                    let api = self.api.clone();
                    let build_id = ctx.build_id.to_string();
                    let owned = resource.clone();
                    let upload = async move {
                        api.upload_resource(&build_id, &owned).await.map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    uploads.insert(resource.sha.clone(), upload.clone());
                    (upload, true)
                }
            }
        };

        match upload.await {
            Ok(()) => {
                if started {
                    ctx.resources_uploaded.fetch_add(1, Ordering::SeqCst);
                }
                Ok(started)
            }
            Err(source) => {
                if started {
                    ctx.uploads.lock().remove(&resource.sha);
                }
                Err(Error::ResourceUpload {
                    sha: resource.sha.clone(),
                    source,
                })
            }
        }
    }

    async fn worker(&self, ctx: &RunContext<'_>) {
        loop {
            let unit = ctx.queue.lock().pop_front();
            let Some(unit) = unit else {
                break;
            };
            if let Err(e) = self.process_unit(ctx, &unit).await {
                error!("{}", e);
                let name = match &e {
                    Error::Snapshot { name, .. } => name.as_str(),
                    _ => unit[0].name.as_str(),
                };
                self.progress.failed(name, &e);
                ctx.failures.lock().push(e);
            }
        }
    }

    /// Upload one page unit, reopening the page after crashes
    async fn process_unit(&self, ctx: &RunContext<'_>, unit: &[PlannedSnapshot]) -> Result<()> {
        let mut next = 0;
        let mut attempts = 0;
        let mut last_remaining = None;

        loop {
            attempts += 1;
            let mut page = self
                .bridge
                .page(&self.page_options)
                .await
                .map_err(|e| e.for_snapshot(&unit[next].id, &unit[next].name))?;
            let result = self.upload_on_page(page.as_mut(), ctx, unit, &mut next).await;
            if let Err(e) = page.close().await {
                debug!("failed to close page: {}", e);
            }

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_page_crash() => {
                    let remaining = unit.len() - next;
                    if attempts >= MAX_PAGE_ATTEMPTS || last_remaining == Some(remaining) {
                        return Err(e);
                    }
                    warn!(
                        "page crashed, retrying {} remaining snapshot(s) of {}",
                        remaining, unit[next].id
                    );
                    last_remaining = Some(remaining);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upload_on_page(
        &self,
        page: &mut dyn Page,
        ctx: &RunContext<'_>,
        unit: &[PlannedSnapshot],
        next: &mut usize,
    ) -> Result<()> {
        while let Some(snapshot) = unit.get(*next) {
            match self.upload_snapshot(page, ctx, snapshot).await {
                Ok(()) => {
                    debug!("uploaded snapshot {}", snapshot.name);
                    ctx.uploaded.fetch_add(1, Ordering::SeqCst);
                    self.progress.uploaded(&snapshot.name);
                }
                Err(e) if e.is_duplicate_snapshot() => {
                    info!("skipping duplicate snapshot {}: {}", snapshot.name, e.root());
                    ctx.skipped.fetch_add(1, Ordering::SeqCst);
                    self.progress.skipped(&snapshot.name);
                }
                Err(e) => return Err(e.for_snapshot(&snapshot.id, &snapshot.name)),
            }
            *next += 1;
        }
        Ok(())
    }

    async fn upload_snapshot(
        &self,
        page: &mut dyn Page,
        ctx: &RunContext<'_>,
        snapshot: &PlannedSnapshot,
    ) -> Result<()> {
        let root = if snapshot.enable_javascript {
            make_root_resource(&snapshot.name, &self.preview.content, &snapshot.encoded_params)
        } else {
            let html = capture(page, snapshot).await?;
            make_root_resource(&snapshot.name, &html, &snapshot.encoded_params)
        };

        let resources: Vec<&Resource> = std::iter::once(&root)
            .chain(self.resources.iter())
            .collect();
        let remote = self
            .api
            .create_snapshot(ctx.build_id, &SnapshotRequest::from(snapshot), &resources)
            .await?;

        for resource in missing_resources(Some(remote.missing_resources.as_slice()), resources) {
            self.upload_once(ctx, resource).await?;
        }

        self.api.finalize_snapshot(&remote.id).await
    }
}

/// Render a snapshot's story and serialize its DOM
async fn capture(page: &mut dyn Page, snapshot: &PlannedSnapshot) -> Result<String> {
    page.goto(&snapshot.url).await?;

    let script = EvalScript::new(PREPARE_STORY_JS)
        .with_helper(ARG_CODEC_JS)
        .with_arg(json!({
            "id": snapshot.id,
            "args": EncodedValue::Map(encode_map(&snapshot.args)).to_json(),
            "globals": EncodedValue::Map(encode_map(&snapshot.globals)).to_json(),
        }));
    if page.eval(&script).await? == json!(false) {
        warn!("story {} did not render any content", snapshot.name);
    }

    let dom = page.snapshot(&CaptureOptions::default()).await?;
    Ok(dom.html)
}

/// Split a plan into runs of consecutive snapshots of the same story
pub fn page_units(snapshots: Vec<PlannedSnapshot>) -> Vec<Vec<PlannedSnapshot>> {
    let mut units: Vec<Vec<PlannedSnapshot>> = Vec::new();
    for snapshot in snapshots {
        if let Some(unit) = units.last_mut().filter(|unit| unit[0].id == snapshot.id) {
            unit.push(snapshot);
            continue;
        }
        units.push(vec![snapshot]);
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(id: &str, name: &str) -> PlannedSnapshot {
        PlannedSnapshot {
            id: id.to_string(),
            name: name.to_string(),
            url: format!("http://localhost/iframe.html?id={}", id),
            encoded_params: format!("id={}", id),
            widths: Vec::new(),
            minimum_height: None,
            enable_javascript: false,
            args: Default::default(),
            globals: Default::default(),
        }
    }

    #[test]
    fn test_lifecycle_order() {
        let mut lifecycle = BuildLifecycle::new();
        lifecycle.advance(BuildState::ResourcesUploading).unwrap();
        lifecycle.advance(BuildState::SnapshotsUploading).unwrap();
        lifecycle.advance(BuildState::Finalized).unwrap();
        assert!(lifecycle.advance(BuildState::Finalized).is_err());
    }

    #[test]
    fn test_lifecycle_rejects_skipping_ahead() {
        let mut lifecycle = BuildLifecycle::new();
        let err = lifecycle.advance(BuildState::SnapshotsUploading).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert!(lifecycle.advance(BuildState::Finalized).is_ok());
    }

    #[test]
    fn test_page_units_group_consecutive_stories() {
        let units = page_units(vec![
            planned("a", "A: one"),
            planned("a", "A: one (dark)"),
            planned("b", "B: two"),
            planned("a", "A: one [RTL]"),
        ]);
        let sizes: Vec<_> = units.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
        assert_eq!(units[2][0].name, "A: one [RTL]");
    }
}
