//! Snapshot option resolution
//!
//! Options come from three layers: the global `snapshot` section of the
//! config file, the story's `storysnap` parameters and, for additional
//! snapshots, the per-snapshot override. Each layer is parsed into an
//! [`OptionsLayer`] against a closed schema; problems are collected as
//! [`ValidationErrors`] and the offending field is dropped. Layers are then
//! merged into one [`SnapshotOptions`] per concrete snapshot.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::args::{args_from_json, validate, validate_key, ArgMap, ArgValue};
use crate::error::{Error, Result};
use crate::filter::{FilterOptions, Pattern};
use crate::types::Story;

/// Default config file name
pub const DEFAULT_CONFIG_FILE: &str = ".storysnap.yml";

/// Default preview document path relative to the catalog root
pub const DEFAULT_PREVIEW_PATH: &str = "iframe.html";

const CONFIG_VERSION: u64 = 1;

/// A single validation problem
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

/// Validation problems collected while parsing options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    /// Absorb another collection, scoping its paths under `scope`
    pub fn extend_scoped(&mut self, scope: &str, other: ValidationErrors) {
        for error in other.0 {
            self.push(join(scope, &error.path), error.message);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Errors ordered by path
    pub fn sorted(&self) -> Vec<&ValidationError> {
        let mut errors: Vec<_> = self.0.iter().collect();
        errors.sort();
        errors
    }

    /// Log the whole batch, ordered by path
    pub fn log(&self) {
        if self.is_empty() {
            return;
        }
        warn!("invalid snapshot options:");
        for error in self.sorted() {
            warn!("  {}: {}", error.path, error.message);
        }
    }

    /// `Err(ConfigValidation)` when anything was collected
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigValidation(self))
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lines: Vec<String> = self
            .sorted()
            .into_iter()
            .map(|e| format!("  {}: {}", e.path, e.message))
            .collect();
        write!(f, "{}", lines.join("\n"))
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Which layer is being parsed; decides the allowed keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Global,
    Story,
    Additional,
}

/// A malformed `widths` value; fatal for its layer
#[derive(Debug, Clone, PartialEq)]
struct InvalidWidths {
    path: String,
    message: String,
}

/// One parsed layer of snapshot options; `None` means "not set here"
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionsLayer {
    pub name: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub widths: Option<Vec<u32>>,
    pub minimum_height: Option<u32>,
    pub enable_javascript: Option<bool>,
    pub rtl: Option<bool>,
    pub skip: Option<bool>,
    pub include: Option<Vec<Pattern>>,
    pub exclude: Option<Vec<Pattern>>,
    pub args: Option<ArgMap>,
    pub globals: Option<ArgMap>,
    pub query_params: Option<BTreeMap<String, String>>,
    pub additional_snapshots: Vec<OptionsLayer>,
}

impl OptionsLayer {
    fn parse(
        value: &Value,
        kind: LayerKind,
        prefix: &str,
        errors: &mut ValidationErrors,
    ) -> std::result::Result<Self, InvalidWidths> {
        let mut layer = OptionsLayer::default();
        let map = match value {
            Value::Null => return Ok(layer),
            Value::Object(map) => migrate_snapshots(map, prefix, errors),
            other => {
                errors.push(
                    if prefix.is_empty() { "(root)" } else { prefix },
                    format!("must be an object, got {}", describe(other)),
                );
                return Ok(layer);
            }
        };

        for (key, value) in &map {
            let path = join(prefix, key);
            match key.as_str() {
                "name" | "prefix" | "suffix" if kind == LayerKind::Additional => {
                    let Some(text) = value.as_str() else {
                        errors.push(path, format!("must be a string, got {}", describe(value)));
                        continue;
                    };
                    let slot = match key.as_str() {
                        "name" => &mut layer.name,
                        "prefix" => &mut layer.prefix,
                        _ => &mut layer.suffix,
                    };
                    *slot = Some(text.to_string());
                }
                "widths" => {
                    let widths = parse_widths(value).map_err(|message| InvalidWidths {
                        path: path.clone(),
                        message,
                    })?;
                    layer.widths = Some(widths);
                }
                "minimumHeight" | "minHeight" => match positive_integer(value) {
                    Some(height) => layer.minimum_height = Some(height),
                    None => errors.push(path, format!("must be a positive integer, got {}", value)),
                },
                "enableJavaScript" => layer.enable_javascript = boolean(value, &path, errors),
                "rtl" => layer.rtl = boolean(value, &path, errors),
                "skip" => layer.skip = boolean(value, &path, errors),
                "include" => layer.include = patterns(value, &path, errors),
                "exclude" => layer.exclude = patterns(value, &path, errors),
                "args" => layer.args = arg_map(value, &path, "args", errors),
                "globals" => layer.globals = arg_map(value, &path, "global", errors),
                "queryParams" => layer.query_params = query_params(value, &path, errors),
                "additionalSnapshots" if kind != LayerKind::Additional => {
                    let Some(items) = value.as_array() else {
                        errors.push(path, format!("must be an array, got {}", describe(value)));
                        continue;
                    };
                    for (i, item) in items.iter().enumerate() {
                        let item_path = format!("{}[{}]", path, i);
                        if !item.is_object() {
                            errors.push(
                                item_path,
                                format!("must be an object, got {}", describe(item)),
                            );
                            continue;
                        }
                        let additional =
                            OptionsLayer::parse(item, LayerKind::Additional, &item_path, errors)?;
                        layer.additional_snapshots.push(additional);
                    }
                }
                _ => errors.push(path, "unknown option"),
            }
        }

        Ok(layer)
    }

    /// Parse a story's parameter bag
    pub fn from_story(story: &Story, errors: &mut ValidationErrors) -> Result<Self> {
        OptionsLayer::parse(&story.parameters, LayerKind::Story, "", errors).map_err(|invalid| {
            Error::InvalidOption {
                story: story.display_name(),
                path: invalid.path,
                message: invalid.message,
            }
        })
    }

    /// Overlay `over` on top of `self`
    ///
    /// Include and exclude are replaced wholesale, args, globals and query
    /// params merge key by key, everything else is replaced when set.
    pub fn merge(&self, over: &OptionsLayer) -> OptionsLayer {
        OptionsLayer {
            name: over.name.clone().or_else(|| self.name.clone()),
            prefix: over.prefix.clone().or_else(|| self.prefix.clone()),
            suffix: over.suffix.clone().or_else(|| self.suffix.clone()),
            widths: over.widths.clone().or_else(|| self.widths.clone()),
            minimum_height: over.minimum_height.or(self.minimum_height),
            enable_javascript: over.enable_javascript.or(self.enable_javascript),
            rtl: over.rtl.or(self.rtl),
            skip: over.skip.or(self.skip),
            include: over.include.clone().or_else(|| self.include.clone()),
            exclude: over.exclude.clone().or_else(|| self.exclude.clone()),
            args: merge_optional(&self.args, &over.args, merge_arg_maps),
            globals: merge_optional(&self.globals, &over.globals, merge_arg_maps),
            query_params: merge_optional(&self.query_params, &over.query_params, |a, b| {
                let mut merged = a.clone();
                merged.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
                merged
            }),
            additional_snapshots: if over.additional_snapshots.is_empty() {
                self.additional_snapshots.clone()
            } else {
                over.additional_snapshots.clone()
            },
        }
    }
}

fn merge_optional<T: Clone>(
    base: &Option<T>,
    over: &Option<T>,
    merge: impl Fn(&T, &T) -> T,
) -> Option<T> {
    match (base, over) {
        (Some(a), Some(b)) => Some(merge(a, b)),
        (a, b) => b.clone().or_else(|| a.clone()),
    }
}

fn merge_arg_maps(base: &ArgMap, over: &ArgMap) -> ArgMap {
    let mut merged = base.clone();
    for (key, value) in over {
        let value = match (merged.get(key), value) {
            (Some(ArgValue::Object(a)), ArgValue::Object(b)) => {
                ArgValue::Object(merge_arg_maps(a, b))
            }
            _ => value.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}

/// Rename the deprecated `snapshots` key
fn migrate_snapshots(
    map: &Map<String, Value>,
    prefix: &str,
    errors: &mut ValidationErrors,
) -> Map<String, Value> {
    let mut map = map.clone();
    if let Some(snapshots) = map.remove("snapshots") {
        if map.contains_key("additionalSnapshots") {
            errors.push(
                join(prefix, "snapshots"),
                "ignored because additionalSnapshots is also set",
            );
        } else {
            warn!("the `snapshots` option is deprecated, use `additionalSnapshots` instead");
            map.insert("additionalSnapshots".to_string(), snapshots);
        }
    }
    map
}

fn parse_widths(value: &Value) -> std::result::Result<Vec<u32>, String> {
    let items = value
        .as_array()
        .ok_or_else(|| format!("must be an array of widths, got {}", value))?;
    if items.is_empty() {
        return Err("must contain at least one width".to_string());
    }

    let mut widths = Vec::with_capacity(items.len());
    for item in items {
        let width = positive_integer(item)
            .ok_or_else(|| format!("invalid width {}: must be a positive integer", item))?;
        if !widths.contains(&width) {
            widths.push(width);
        }
    }
    Ok(widths)
}

fn positive_integer(value: &Value) -> Option<u32> {
    let n = value.as_f64()?;
    if n.is_finite() && n.trunc() == n && n >= 1.0 && n <= u32::MAX as f64 {
        Some(n as u32)
    } else {
        None
    }
}

fn boolean(value: &Value, path: &str, errors: &mut ValidationErrors) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        other => {
            errors.push(path, format!("must be a boolean, got {}", describe(other)));
            None
        }
    }
}

fn patterns(value: &Value, path: &str, errors: &mut ValidationErrors) -> Option<Vec<Pattern>> {
    let raw: Vec<&Value> = match value {
        Value::String(_) => vec![value],
        Value::Array(items) => items.iter().collect(),
        other => {
            errors.push(
                path,
                format!("must be a pattern or list of patterns, got {}", describe(other)),
            );
            return None;
        }
    };

    let mut parsed = Vec::with_capacity(raw.len());
    for (i, item) in raw.into_iter().enumerate() {
        match item.as_str().map(Pattern::parse) {
            Some(Ok(pattern)) => parsed.push(pattern),
            Some(Err(e)) => errors.push(format!("{}[{}]", path, i), e.to_string()),
            None => errors.push(
                format!("{}[{}]", path, i),
                format!("must be a string, got {}", describe(item)),
            ),
        }
    }
    Some(parsed)
}

fn arg_map(
    value: &Value,
    path: &str,
    label: &str,
    errors: &mut ValidationErrors,
) -> Option<ArgMap> {
    match args_from_json(value) {
        Some(map) => Some(prune_unsafe(map, path, label, errors)),
        None => {
            errors.push(path, format!("must be an object, got {}", describe(value)));
            None
        }
    }
}

/// Drop every entry the arg codec would refuse to put in a URL
fn prune_unsafe(map: ArgMap, path: &str, label: &str, errors: &mut ValidationErrors) -> ArgMap {
    let mut kept = ArgMap::new();
    for (key, value) in map {
        let entry_path = join(path, &key);
        match value {
            ArgValue::Object(children) if validate_key(&key) => {
                let children = prune_unsafe(children, &entry_path, label, errors);
                kept.insert(key, ArgValue::Object(children));
            }
            value if validate(&key, &value) => {
                kept.insert(key, value);
            }
            _ => errors.push(entry_path, format!("omitted potentially unsafe {}", label)),
        }
    }
    kept
}

fn query_params(
    value: &Value,
    path: &str,
    errors: &mut ValidationErrors,
) -> Option<BTreeMap<String, String>> {
    let Some(map) = value.as_object() else {
        errors.push(path, format!("must be an object, got {}", describe(value)));
        return None;
    };

    let mut params = BTreeMap::new();
    for (key, value) in map {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                errors.push(
                    join(path, key),
                    format!("must be a string, number or boolean, got {}", describe(other)),
                );
                continue;
            }
        };
        params.insert(key.clone(), text);
    }
    Some(params)
}

/// Right-to-left handling of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rtl {
    /// Not set; the global `rtlRegex` decides
    #[default]
    Inherit,
    Enabled,
    Disabled,
}

impl From<Option<bool>> for Rtl {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => Rtl::Inherit,
            Some(true) => Rtl::Enabled,
            Some(false) => Rtl::Disabled,
        }
    }
}

/// Fully resolved options of one concrete snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotOptions {
    pub name: String,
    /// Empty means the service's default widths
    pub widths: Vec<u32>,
    pub minimum_height: Option<u32>,
    pub enable_javascript: bool,
    pub rtl: Rtl,
    pub skip: bool,
    pub include: Option<Vec<Pattern>>,
    pub exclude: Option<Vec<Pattern>>,
    pub args: ArgMap,
    pub globals: ArgMap,
    pub query_params: BTreeMap<String, String>,
}

impl SnapshotOptions {
    fn from_layer(name: String, layer: &OptionsLayer) -> Self {
        Self {
            name,
            widths: layer.widths.clone().unwrap_or_default(),
            minimum_height: layer.minimum_height,
            enable_javascript: layer.enable_javascript.unwrap_or(false),
            rtl: layer.rtl.into(),
            skip: layer.skip.unwrap_or(false),
            include: layer.include.clone(),
            exclude: layer.exclude.clone(),
            args: layer.args.clone().unwrap_or_default(),
            globals: layer.globals.clone().unwrap_or_default(),
            query_params: layer.query_params.clone().unwrap_or_default(),
        }
    }

    pub fn filter(&self) -> FilterOptions<'_> {
        FilterOptions {
            skip: self.skip,
            include: self.include.as_deref(),
            exclude: self.exclude.as_deref(),
        }
    }
}

/// How preview URLs select a story
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrlStyle {
    /// `id={story id}`
    #[default]
    Id,
    /// `selectedKind={kind}&selectedStory={name}`
    Legacy,
}

/// Catalog-level settings
#[derive(Debug, Clone)]
pub struct StorybookConfig {
    pub rtl_regex: Option<Regex>,
    pub preview_path: String,
    pub url_style: UrlStyle,
}

impl Default for StorybookConfig {
    fn default() -> Self {
        Self {
            rtl_regex: None,
            preview_path: DEFAULT_PREVIEW_PATH.to_string(),
            url_style: UrlStyle::Id,
        }
    }
}

/// Run-wide configuration: the config file plus CLI overrides
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    /// Defaults applied under every story
    pub snapshot: OptionsLayer,
    pub storybook: StorybookConfig,
}

impl GlobalConfig {
    /// Build from a parsed config document
    ///
    /// Returns the non-fatal problems alongside the config. A malformed
    /// global `widths` is fatal.
    pub fn from_value(value: &Value) -> Result<(Self, ValidationErrors)> {
        let mut errors = ValidationErrors::default();
        let mut config = GlobalConfig::default();

        let map = match value {
            Value::Null => return Ok((config, errors)),
            Value::Object(map) => map,
            other => {
                errors.push("(root)", format!("must be an object, got {}", describe(other)));
                return Ok((config, errors));
            }
        };

        for (key, value) in map {
            match key.as_str() {
                "version" => {
                    if value.as_u64() != Some(CONFIG_VERSION) {
                        errors.push("version", format!("unsupported config version {}", value));
                    }
                }
                "snapshot" => {
                    config.snapshot =
                        OptionsLayer::parse(value, LayerKind::Global, "snapshot", &mut errors)
                            .map_err(|invalid| {
                                Error::Config(format!("{}: {}", invalid.path, invalid.message))
                            })?;
                }
                "storybook" => config.storybook = parse_storybook(value, &mut errors),
                _ => errors.push(key.as_str(), "unknown option"),
            }
        }

        Ok((config, errors))
    }

    pub fn from_yaml(content: &str) -> Result<(Self, ValidationErrors)> {
        let value: Value = serde_yaml::from_str(content)?;
        Self::from_value(&value)
    }

    /// Load a config file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<(Self, ValidationErrors)> {
        if !path.exists() {
            debug!("no config file at {}, using defaults", path.display());
            return Ok((GlobalConfig::default(), ValidationErrors::default()));
        }
        let content = std::fs::read_to_string(path)?;
        debug!("loaded config from {}", path.display());
        Self::from_yaml(&content)
    }

    /// Layer command line options over the file's snapshot defaults
    pub fn with_overrides(mut self, overrides: &OptionsLayer) -> Self {
        self.snapshot = self.snapshot.merge(overrides);
        self
    }

    /// The run-wide include/exclude pair
    pub fn filter(&self) -> FilterOptions<'_> {
        FilterOptions {
            skip: false,
            include: self.snapshot.include.as_deref(),
            exclude: self.snapshot.exclude.as_deref(),
        }
    }
}

fn parse_storybook(value: &Value, errors: &mut ValidationErrors) -> StorybookConfig {
    let mut storybook = StorybookConfig::default();
    let Some(map) = value.as_object() else {
        errors.push("storybook", format!("must be an object, got {}", describe(value)));
        return storybook;
    };

    for (key, value) in map {
        let path = join("storybook", key);
        match key.as_str() {
            "rtlRegex" => match value.as_str().map(Regex::new) {
                Some(Ok(regex)) => storybook.rtl_regex = Some(regex),
                Some(Err(e)) => errors.push(path, format!("invalid regex: {}", e)),
                None => errors.push(path, format!("must be a string, got {}", describe(value))),
            },
            "previewPath" => match value.as_str() {
                Some(preview) => {
                    storybook.preview_path = preview.trim_start_matches('/').to_string()
                }
                None => errors.push(path, format!("must be a string, got {}", describe(value))),
            },
            "legacyUrls" => {
                if let Some(legacy) = boolean(value, &path, errors) {
                    storybook.url_style = if legacy { UrlStyle::Legacy } else { UrlStyle::Id };
                }
            }
            _ => errors.push(path, "unknown option"),
        }
    }
    storybook
}

/// Options of one story and its additional snapshots
#[derive(Debug, Clone)]
pub struct ResolvedStory {
    pub base: SnapshotOptions,
    /// In declaration order, names already computed
    pub additional: Vec<SnapshotOptions>,
    pub errors: ValidationErrors,
}

/// Resolve every snapshot option of a story
///
/// Fails with `InvalidOption` when the story (or one of its additional
/// snapshots) declares malformed widths.
pub fn resolve(story: &Story, global: &GlobalConfig) -> Result<ResolvedStory> {
    let mut errors = ValidationErrors::default();
    let layer = OptionsLayer::from_story(story, &mut errors)?;
    let merged = global.snapshot.merge(&layer);

    let base_name = story.display_name();
    let base = SnapshotOptions::from_layer(base_name.clone(), &merged);

    let additional = merged
        .additional_snapshots
        .iter()
        .map(|over| {
            let name = over.name.clone().unwrap_or_else(|| {
                format!(
                    "{}{}{}",
                    over.prefix.as_deref().unwrap_or(""),
                    base_name,
                    over.suffix.as_deref().unwrap_or("")
                )
            });
            SnapshotOptions::from_layer(name, &merged.merge(over))
        })
        .collect();

    Ok(ResolvedStory {
        base,
        additional,
        errors,
    })
}
