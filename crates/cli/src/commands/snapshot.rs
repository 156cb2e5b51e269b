//! Snapshot Command

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use storysnap_browser::{Browser, PlaywrightBridge, PlaywrightConfig, StaticServer};
use storysnap_common::config::{UrlStyle, DEFAULT_CONFIG_FILE};
use storysnap_common::resources::{collect_assets, make_resources};
use storysnap_common::{
    discover_stories, is_disabled, plan, ClientInfo, DiscoveryBridge, Error, GlobalConfig,
    OptionsLayer, Pattern, Resource, ShardOptions, UploadOrchestrator, UploadProgress, ENABLE_ENV,
    VERSION,
};

use crate::client::{RestClient, DEFAULT_API_URL};
use crate::output::{print_info, print_list, print_success, OutputFormat};

#[derive(Args, Debug, Default)]
pub struct SnapshotArgs {
    /// Storybook URL or built storybook directory
    pub target: String,

    /// Only snapshot stories matching these patterns (`/regex/flags` or substring)
    #[arg(short, long)]
    pub include: Vec<String>,

    /// Never snapshot stories matching these patterns
    #[arg(short, long)]
    pub exclude: Vec<String>,

    /// Print the planned snapshots without uploading
    #[arg(long)]
    pub dry_run: bool,

    /// Comma separated widths, e.g. 375,1280
    #[arg(long, value_delimiter = ',')]
    pub widths: Vec<u32>,

    #[arg(long)]
    pub minimum_height: Option<u32>,

    /// Number of snapshots per shard
    #[arg(long)]
    pub shard_size: Option<usize>,

    /// Number of shards to split snapshots into
    #[arg(long)]
    pub shard_count: Option<usize>,

    /// Zero based shard to snapshot
    #[arg(long)]
    pub shard_index: Option<usize>,

    /// Config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Stories whose names match also get an RTL snapshot
    #[arg(long)]
    pub rtl_regex: Option<String>,

    /// Address stories with selectedKind/selectedStory
    #[arg(long)]
    pub legacy_urls: bool,

    /// Preview document path relative to the catalog root
    #[arg(long)]
    pub preview_path: Option<String>,

    /// Browser used for discovery and capture
    #[arg(long, default_value = "chromium")]
    pub browser: Browser,

    /// Directory holding the playwright package
    #[arg(long, default_value = "node_modules")]
    pub node_modules: PathBuf,

    #[arg(long, env = "STORYSNAP_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    #[arg(long, env = "STORYSNAP_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Branch recorded on the build
    #[arg(long, env = "STORYSNAP_BRANCH")]
    pub branch: Option<String>,

    /// Commit recorded on the build
    #[arg(long, env = "STORYSNAP_COMMIT")]
    pub commit: Option<String>,
}

impl SnapshotArgs {
    fn shard_options(&self) -> ShardOptions {
        ShardOptions {
            shard_size: self.shard_size,
            shard_count: self.shard_count,
            shard_index: self.shard_index,
        }
    }

    /// Options given on the command line, layered over the config file
    fn overrides(&self) -> Result<OptionsLayer> {
        let patterns = |inputs: &[String]| -> Result<Option<Vec<Pattern>>> {
            if inputs.is_empty() {
                return Ok(None);
            }
            let parsed = inputs
                .iter()
                .map(|input| Pattern::parse(input))
                .collect::<storysnap_common::Result<Vec<_>>>()?;
            Ok(Some(parsed))
        };

        if self.widths.contains(&0) {
            anyhow::bail!("--widths must be positive integers");
        }

        Ok(OptionsLayer {
            include: patterns(&self.include)?,
            exclude: patterns(&self.exclude)?,
            widths: (!self.widths.is_empty()).then(|| self.widths.clone()),
            minimum_height: self.minimum_height,
            ..Default::default()
        })
    }

    /// Config file plus command line overrides
    pub fn global_config(&self) -> Result<GlobalConfig> {
        let (config, errors) = GlobalConfig::load(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        errors.log();

        let mut config = config.with_overrides(&self.overrides()?);
        if let Some(rtl_regex) = &self.rtl_regex {
            config.storybook.rtl_regex =
                Some(regex::Regex::new(rtl_regex).context("invalid --rtl-regex")?);
        }
        if self.legacy_urls {
            config.storybook.url_style = UrlStyle::Legacy;
        }
        if let Some(preview_path) = &self.preview_path {
            config.storybook.preview_path = preview_path.trim_start_matches('/').to_string();
        }
        Ok(config)
    }
}

/// Progress bar over uploaded snapshots
struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self { bar }
    }
}

impl UploadProgress for ProgressReporter {
    fn found(&self, total: usize) {
        self.bar.println(format!("Found {} snapshot(s)", total));
        self.bar.set_length(total as u64);
    }

    fn uploaded(&self, name: &str) {
        self.bar.set_message(name.to_string());
        self.bar.inc(1);
    }

    fn skipped(&self, name: &str) {
        self.bar.println(format!("Skipped {}: already uploaded", name));
        self.bar.inc(1);
    }

    fn failed(&self, name: &str, error: &Error) {
        self.bar.println(format!("❌ {}: {}", name, error));
    }
}

/// Where the catalog comes from
enum Target {
    Remote(String),
    Local { server: StaticServer, resources: Vec<Resource> },
}

impl Target {
    async fn open(target: &str) -> Result<Self> {
        if target.starts_with("http://") || target.starts_with("https://") {
            return Ok(Target::Remote(target.trim_end_matches('/').to_string()));
        }

        let root = Path::new(target);
        let assets = collect_assets(root)
            .with_context(|| format!("failed to read build directory {}", root.display()))?;
        let resources = make_resources(&assets);
        info!("collected {} build resource(s) from {}", resources.len(), root.display());

        let server = StaticServer::serve(root).await?;
        Ok(Target::Local { server, resources })
    }

    fn base_url(&self) -> &str {
        match self {
            Target::Remote(url) => url,
            Target::Local { server, .. } => server.base_url(),
        }
    }

    fn take_resources(&mut self) -> Vec<Resource> {
        match self {
            Target::Remote(_) => Vec::new(),
            Target::Local { resources, .. } => std::mem::take(resources),
        }
    }

    async fn close(self) {
        if let Target::Local { server, .. } = self {
            server.shutdown().await;
        }
    }
}

pub async fn execute(args: SnapshotArgs, format: OutputFormat, verbose: bool) -> Result<()> {
    if is_disabled(std::env::var(ENABLE_ENV).ok().as_deref()) {
        print_info("storysnap is disabled, skipping snapshots");
        return Ok(());
    }
    let token = match (&args.token, args.dry_run) {
        (Some(token), _) if !token.is_empty() => Some(token.clone()),
        (_, true) => None,
        _ => {
            warn!("skipping visual tests: STORYSNAP_TOKEN was not provided");
            return Ok(());
        }
    };

    let global = args.global_config()?;
    let mut target = Target::open(&args.target).await?;
    let preview_url = format!("{}/{}", target.base_url(), global.storybook.preview_path);

    let bridge = match PlaywrightBridge::launch(PlaywrightConfig {
        browser: args.browser,
        node_modules: args.node_modules.clone(),
        ..Default::default()
    })
    .await
    {
        Ok(bridge) => Arc::new(bridge),
        Err(e) => {
            target.close().await;
            return Err(e.into());
        }
    };

    let resources = target.take_resources();
    let outcome = run(
        &args,
        &global,
        bridge.clone(),
        &preview_url,
        resources,
        token,
        format,
        verbose,
    )
    .await;

    if let Err(e) = bridge.shutdown().await {
        warn!("failed to stop browser: {}", e);
    }
    target.close().await;
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn run(
    args: &SnapshotArgs,
    global: &GlobalConfig,
    bridge: Arc<PlaywrightBridge>,
    preview_url: &str,
    resources: Vec<Resource>,
    token: Option<String>,
    format: OutputFormat,
    verbose: bool,
) -> Result<()> {
    let preview = bridge.fetch_preview_document(preview_url).await?;
    let stories = discover_stories(bridge.as_ref(), &preview.url).await?;
    info!("discovered {} stor{}", stories.len(), if stories.len() == 1 { "y" } else { "ies" });

    let shard = args.shard_options();
    let Some(token) = token else {
        let planned = plan(&stories, global, &preview.url, &shard)?;
        print_list(&planned, format, verbose);
        print_success(&format!("Found {} snapshot(s)", planned.len()));
        return Ok(());
    };

    let info = ClientInfo::new(VERSION)
        .with_git(args.branch.clone(), args.commit.clone())
        .partial(shard.is_set());
    let api = RestClient::new(&args.api_url, &token, info)?;
    let progress = Arc::new(ProgressReporter::new());

    let orchestrator = UploadOrchestrator::new(Arc::new(api), bridge, preview)
        .with_resources(resources)
        .with_shard(shard)
        .with_progress(progress.clone());

    let outcome = orchestrator.run(&stories, global).await;
    progress.bar.finish_and_clear();
    let report = outcome?;

    print_success(&format!(
        "Uploaded {} snapshot(s), {} already present",
        report.uploaded, report.skipped
    ));
    if let Some(url) = &report.web_url {
        print_info(&format!("Build: {}", url));
    }
    Ok(())
}
