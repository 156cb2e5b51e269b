//! Snapshot planning
//!
//! Turns discovered stories into the flat, ordered list of snapshots a run
//! uploads: base snapshots and additional snapshots in discovery order,
//! followed by their right-to-left mirrors.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::args::stringify_args;
use crate::config::{resolve, GlobalConfig, Rtl, SnapshotOptions, UrlStyle, ValidationErrors};
use crate::error::{Error, NoSnapshotsReason, Result};
use crate::filter::should_skip;
use crate::types::{PlannedSnapshot, Story};

/// Suffix appended to mirrored snapshot names
pub const RTL_SUFFIX: &str = " [RTL]";

/// Shard selection; all `None` disables sharding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardOptions {
    pub shard_size: Option<usize>,
    pub shard_count: Option<usize>,
    pub shard_index: Option<usize>,
}

impl ShardOptions {
    pub fn is_set(&self) -> bool {
        self.shard_size.is_some() || self.shard_count.is_some() || self.shard_index.is_some()
    }
}

/// Plan every snapshot of a run
///
/// `preview_url` is the absolute URL of the preview document every snapshot
/// URL is built on.
pub fn plan(
    stories: &[Story],
    global: &GlobalConfig,
    preview_url: &str,
    shard_options: &ShardOptions,
) -> Result<Vec<PlannedSnapshot>> {
    if stories.is_empty() {
        return Err(Error::NoSnapshots(NoSnapshotsReason::NoStories));
    }

    let global_filter = global.filter();
    let mut errors = ValidationErrors::default();
    let mut planned = Vec::new();
    let mut mirrors = Vec::new();

    for story in stories {
        let resolved = match resolve(story, global) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("dropping story {}: {}", story.display_name(), e);
                continue;
            }
        };
        errors.extend_scoped(&story.id, resolved.errors);

        let base_name = resolved.base.name.clone();
        if should_skip(&base_name, resolved.base.filter(), global_filter) {
            debug!("skipping story {}", base_name);
            continue;
        }

        let additional = resolved.additional.iter().filter(|options| {
            let skipped = should_skip(&base_name, options.filter(), global_filter);
            if skipped {
                debug!("skipping additional snapshot {}", options.name);
            }
            !skipped
        });

        for options in std::iter::once(&resolved.base).chain(additional) {
            planned.push(planned_snapshot(story, options, global, preview_url, false));
            if wants_rtl(options, &base_name, global) {
                mirrors.push(planned_snapshot(story, options, global, preview_url, true));
            }
        }
    }

    errors.log();
    planned.extend(mirrors);

    if planned.is_empty() {
        return Err(Error::NoSnapshots(NoSnapshotsReason::AllFiltered {
            discovered: stories.len(),
        }));
    }

    warn_duplicates(&planned);

    if shard_options.is_set() {
        shard(planned, shard_options)
    } else {
        Ok(planned)
    }
}

fn wants_rtl(options: &SnapshotOptions, base_name: &str, global: &GlobalConfig) -> bool {
    match options.rtl {
        Rtl::Enabled => true,
        Rtl::Disabled => false,
        Rtl::Inherit => global
            .storybook
            .rtl_regex
            .as_ref()
            .map(|regex| regex.is_match(base_name))
            .unwrap_or(false),
    }
}

fn planned_snapshot(
    story: &Story,
    options: &SnapshotOptions,
    global: &GlobalConfig,
    preview_url: &str,
    rtl: bool,
) -> PlannedSnapshot {
    let mut encoded_params = encode_params(story, options, global.storybook.url_style);
    if rtl {
        encoded_params.push_str("&direction=rtl");
    }
    let name = if rtl {
        format!("{}{}", options.name, RTL_SUFFIX)
    } else {
        options.name.clone()
    };

    PlannedSnapshot {
        id: story.id.clone(),
        name,
        url: format!("{}?{}", preview_url, encoded_params),
        encoded_params,
        widths: options.widths.clone(),
        minimum_height: options.minimum_height,
        enable_javascript: options.enable_javascript,
        args: options.args.clone(),
        globals: options.globals.clone(),
    }
}

/// Query string selecting a story with its args, globals and extra params
pub fn encode_params(story: &Story, options: &SnapshotOptions, style: UrlStyle) -> String {
    let mut params = match style {
        UrlStyle::Id => vec![format!("id={}", urlencoding::encode(&story.id))],
        UrlStyle::Legacy => vec![
            format!("selectedKind={}", urlencoding::encode(&story.kind)),
            format!("selectedStory={}", urlencoding::encode(&story.name)),
        ],
    };

    // Validated args only contain URL-safe characters once stringified
    if !options.args.is_empty() {
        params.push(format!("args={}", stringify_args(&options.args)));
    }
    if !options.globals.is_empty() {
        params.push(format!("globals={}", stringify_args(&options.globals)));
    }
    for (key, value) in &options.query_params {
        params.push(format!(
            "{}={}",
            urlencoding::encode(key),
            urlencoding::encode(value)
        ));
    }

    params.join("&")
}

fn warn_duplicates(planned: &[PlannedSnapshot]) {
    let mut seen = HashSet::new();
    for snapshot in planned {
        if !seen.insert(snapshot.name.as_str()) {
            warn!("duplicate snapshot name in plan: {}", snapshot.name);
        }
    }
}

fn shard_error(
    message: &str,
    count: Option<usize>,
    size: Option<usize>,
    total: usize,
) -> Error {
    let show = |v: Option<usize>| v.map(|n| n.to_string()).unwrap_or_else(|| "unset".to_string());
    Error::ShardConfiguration {
        message: message.to_string(),
        count: show(count),
        size: show(size),
        total,
    }
}

/// Select one shard of a plan
pub fn shard<T>(items: Vec<T>, options: &ShardOptions) -> Result<Vec<T>> {
    let total = items.len();
    let ShardOptions {
        shard_size,
        shard_count,
        shard_index,
    } = *options;

    if shard_size.is_some() && shard_count.is_some() {
        return Err(shard_error(
            "set either a shard size or a shard count, not both",
            shard_count,
            shard_size,
            total,
        ));
    }
    if shard_size == Some(0) || shard_count == Some(0) {
        return Err(shard_error(
            "shard size and count must be positive",
            shard_count,
            shard_size,
            total,
        ));
    }

    let count = shard_count.or_else(|| shard_size.map(|size| total.div_ceil(size)));
    let size = shard_size.or_else(|| shard_count.map(|count| total.div_ceil(count)));

    let (Some(count), Some(size)) = (count, size) else {
        return Err(shard_error(
            "a shard size or a shard count is required with a shard index",
            count,
            size,
            total,
        ));
    };
    let Some(index) = shard_index else {
        return Err(shard_error(
            "a shard index is required",
            Some(count),
            Some(size),
            total,
        ));
    };
    if index >= count {
        return Err(shard_error(
            &format!("shard index {} is out of range", index),
            Some(count),
            Some(size),
            total,
        ));
    }

    let start = (size * index).min(total);
    let end = (start + size).min(total);
    if start == end {
        return Err(Error::NoSnapshots(NoSnapshotsReason::EmptyShard { index, total }));
    }

    debug!("selected shard {} of {} ({}..{} of {})", index, count, start, end, total);
    Ok(items.into_iter().skip(start).take(end - start).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use test_case::test_case;

    const PREVIEW: &str = "http://localhost:6006/iframe.html";

    fn image_posts() -> Vec<Story> {
        vec![
            Story::new("imagepost--a", "ImagePost", "a"),
            Story::new("imagepost--b", "ImagePost", "b"),
        ]
    }

    fn names(planned: &[PlannedSnapshot]) -> Vec<&str> {
        planned.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_legacy_urls() {
        let (mut global, _) = GlobalConfig::from_value(&json!(null)).unwrap();
        global.storybook.url_style = UrlStyle::Legacy;

        let planned = plan(&image_posts(), &global, PREVIEW, &ShardOptions::default()).unwrap();

        assert_eq!(names(&planned), vec!["ImagePost: a", "ImagePost: b"]);
        assert_eq!(planned[0].encoded_params, "selectedKind=ImagePost&selectedStory=a");
        assert_eq!(planned[1].encoded_params, "selectedKind=ImagePost&selectedStory=b");
        assert_eq!(
            planned[0].url,
            "http://localhost:6006/iframe.html?selectedKind=ImagePost&selectedStory=a"
        );
    }

    #[test]
    fn test_rtl_mirror() {
        let stories = vec![Story::new("imagepost--a", "ImagePost", "a")
            .with_parameters(json!({ "rtl": true }))];
        let planned = plan(&stories, &GlobalConfig::default(), PREVIEW, &ShardOptions::default())
            .unwrap();

        assert_eq!(names(&planned), vec!["ImagePost: a", "ImagePost: a [RTL]"]);
        assert!(planned[1].encoded_params.ends_with("&direction=rtl"));
        assert!(!planned[0].encoded_params.contains("direction"));
    }

    #[test]
    fn test_skipped_rtl_story_plans_nothing() {
        let stories = vec![Story::new("imagepost--a", "ImagePost", "a")
            .with_parameters(json!({ "skip": true, "rtl": true }))];
        let err = plan(&stories, &GlobalConfig::default(), PREVIEW, &ShardOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NoSnapshots(NoSnapshotsReason::AllFiltered { discovered: 1 })
        ));
    }

    #[test]
    fn test_no_stories() {
        let err =
            plan(&[], &GlobalConfig::default(), PREVIEW, &ShardOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NoSnapshots(NoSnapshotsReason::NoStories)));
    }

    #[test]
    fn test_mirrors_follow_all_base_entries() {
        let (global, _) =
            GlobalConfig::from_yaml("storybook:\n  rtlRegex: 'Arabic'\n").unwrap();
        let stories = vec![
            Story::new("text--arabic", "Text", "Arabic").with_parameters(json!({
                "additionalSnapshots": [{ "suffix": " (bold)", "args": { "bold": true } }]
            })),
            Story::new("text--english", "Text", "English"),
            Story::new("text--arabic-ltr", "Text", "Arabic LTR")
                .with_parameters(json!({ "rtl": false })),
        ];

        let planned = plan(&stories, &global, PREVIEW, &ShardOptions::default()).unwrap();
        assert_eq!(
            names(&planned),
            vec![
                "Text: Arabic",
                "Text: Arabic (bold)",
                "Text: English",
                "Text: Arabic LTR",
                "Text: Arabic [RTL]",
                "Text: Arabic (bold) [RTL]",
            ]
        );
        assert_eq!(planned[1].encoded_params, "id=text--arabic&args=bold:!true");
    }

    #[test]
    fn test_additional_snapshots_use_their_own_filters() {
        let stories = vec![Story::new("card--default", "Card", "Default").with_parameters(json!({
            "additionalSnapshots": [
                { "suffix": " hidden", "skip": true },
                { "suffix": " excluded", "exclude": ["/^Card/"] },
                { "prefix": "Dark ", "globals": { "theme": "dark" } }
            ]
        }))];

        let planned = plan(&stories, &GlobalConfig::default(), PREVIEW, &ShardOptions::default())
            .unwrap();
        assert_eq!(names(&planned), vec!["Card: Default", "Dark Card: Default"]);
        assert_eq!(planned[1].encoded_params, "id=card--default&globals=theme:dark");
    }

    #[test]
    fn test_invalid_story_is_dropped() {
        let stories = vec![
            Story::new("a--one", "A", "one").with_parameters(json!({ "widths": [1.5] })),
            Story::new("a--two", "A", "two"),
        ];
        let planned = plan(&stories, &GlobalConfig::default(), PREVIEW, &ShardOptions::default())
            .unwrap();
        assert_eq!(names(&planned), vec!["A: two"]);
    }

    #[test]
    fn test_query_params_are_encoded_last() {
        let story = Story::new("button--primary", "Button", "Primary").with_parameters(json!({
            "args": { "label": "Hello world" },
            "queryParams": { "locale": "en US" }
        }));
        let planned = plan(&[story], &GlobalConfig::default(), PREVIEW, &ShardOptions::default())
            .unwrap();
        assert_eq!(
            planned[0].encoded_params,
            "id=button--primary&args=label:Hello+world&locale=en%20US"
        );
    }

    #[test]
    fn test_duplicate_names_are_kept() {
        let stories = vec![
            Story::new("a--one", "A", "one"),
            Story::new("a--one-copy", "A", "one"),
        ];
        let planned = plan(&stories, &GlobalConfig::default(), PREVIEW, &ShardOptions::default())
            .unwrap();
        assert_eq!(planned.len(), 2);
    }

    #[test_case(Some(2), Some(2), Some(0) ; "size and count")]
    #[test_case(None, None, Some(0) ; "index without size or count")]
    #[test_case(Some(2), None, None ; "missing index")]
    #[test_case(None, Some(0), Some(0) ; "zero count")]
    #[test_case(None, Some(3), Some(3) ; "index out of range")]
    fn test_invalid_shard_options(size: Option<usize>, count: Option<usize>, index: Option<usize>) {
        let options = ShardOptions {
            shard_size: size,
            shard_count: count,
            shard_index: index,
        };
        let err = shard((0..10).collect::<Vec<_>>(), &options).unwrap_err();
        match err {
            Error::ShardConfiguration { total, .. } => assert_eq!(total, 10),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_shard_error_reports_computed_bounds() {
        let options = ShardOptions {
            shard_count: Some(4),
            shard_index: Some(9),
            ..Default::default()
        };
        let message = shard((0..10).collect::<Vec<_>>(), &options).unwrap_err().to_string();
        assert!(message.contains("count: 4"));
        assert!(message.contains("size: 3"));
        assert!(message.contains("total: 10"));
    }

    #[test]
    fn test_empty_shard() {
        let options = ShardOptions {
            shard_count: Some(5),
            shard_index: Some(4),
            ..Default::default()
        };
        let err = shard(vec![1, 2, 3], &options).unwrap_err();
        assert!(matches!(
            err,
            Error::NoSnapshots(NoSnapshotsReason::EmptyShard { index: 4, total: 3 })
        ));
    }

    fn concat_shards(total: usize, by_count: bool, n: usize) -> Vec<usize> {
        let items: Vec<usize> = (0..total).collect();
        let count = if by_count { n } else { total.div_ceil(n) };
        (0..count)
            .flat_map(|index| {
                let options = ShardOptions {
                    shard_size: (!by_count).then_some(n),
                    shard_count: by_count.then_some(n),
                    shard_index: Some(index),
                };
                match shard(items.clone(), &options) {
                    Ok(part) => part,
                    Err(Error::NoSnapshots(NoSnapshotsReason::EmptyShard { .. })) => Vec::new(),
                    Err(e) => panic!("unexpected error: {e}"),
                }
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_shards_by_count_partition_the_plan(total in 1usize..60, count in 1usize..20) {
            prop_assert_eq!(concat_shards(total, true, count), (0..total).collect::<Vec<_>>());
        }

        #[test]
        fn prop_shards_by_size_partition_the_plan(total in 1usize..60, size in 1usize..20) {
            prop_assert_eq!(concat_shards(total, false, size), (0..total).collect::<Vec<_>>());
        }
    }
}
