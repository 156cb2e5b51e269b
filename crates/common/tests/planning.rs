//! Planning tests driven by config files

use serde_json::json;

use storysnap_common::config::UrlStyle;
use storysnap_common::{
    plan, Error, GlobalConfig, NoSnapshotsReason, OptionsLayer, Pattern, ShardOptions, Story,
};

const PREVIEW: &str = "http://localhost:6006/iframe.html";

fn catalog() -> Vec<Story> {
    vec![
        Story::new("foo--bar", "Foo", "bar").with_parameters(json!({ "skip": true })),
        Story::new("foo--baz", "Foo", "baz"),
        Story::new("card--default", "Card", "Default").with_parameters(json!({
            "widths": [375, 1280],
            "snapshots": [{ "name": "Card compact", "minimumHeight": 300 }]
        })),
    ]
}

fn names(global: &GlobalConfig) -> Vec<String> {
    plan(&catalog(), global, PREVIEW, &ShardOptions::default())
        .expect("plan")
        .into_iter()
        .map(|s| s.name)
        .collect()
}

#[test]
fn global_include_overrides_story_skip() {
    let (global, errors) = GlobalConfig::from_yaml("version: 1\nsnapshot:\n  include: ['Foo']\n")
        .expect("valid config");
    assert!(errors.is_empty());

    assert_eq!(names(&global), vec!["Foo: bar", "Foo: baz"]);
}

#[test]
fn global_exclude_wins_over_include() {
    let (global, _) = GlobalConfig::from_yaml(
        "snapshot:\n  include: ['Foo']\n  exclude: ['/: bar$/']\n",
    )
    .expect("valid config");

    assert_eq!(names(&global), vec!["Foo: baz"]);
}

#[test]
fn command_line_filters_replace_file_filters() {
    let (global, _) =
        GlobalConfig::from_yaml("snapshot:\n  include: ['Foo']\n").expect("valid config");
    let overrides = OptionsLayer {
        include: Some(vec![Pattern::parse("/^card/i").expect("pattern")]),
        ..Default::default()
    };

    assert_eq!(
        names(&global.with_overrides(&overrides)),
        vec!["Card: Default", "Card compact"]
    );
}

#[test]
fn migrated_snapshots_inherit_story_options() {
    let planned = plan(&catalog(), &GlobalConfig::default(), PREVIEW, &ShardOptions::default())
        .expect("plan");

    let compact = planned.iter().find(|s| s.name == "Card compact").expect("compact snapshot");
    assert_eq!(compact.widths, vec![375, 1280]);
    assert_eq!(compact.minimum_height, Some(300));
    assert_eq!(compact.url, "http://localhost:6006/iframe.html?id=card--default");
}

#[test]
fn global_widths_apply_to_every_story() {
    let (global, _) =
        GlobalConfig::from_yaml("snapshot:\n  widths: [320]\n").expect("valid config");
    let planned = plan(&catalog(), &global, PREVIEW, &ShardOptions::default()).expect("plan");

    let baz = planned.iter().find(|s| s.name == "Foo: baz").expect("baz");
    assert_eq!(baz.widths, vec![320]);
    let card = planned.iter().find(|s| s.name == "Card: Default").expect("card");
    assert_eq!(card.widths, vec![375, 1280]);
}

#[test]
fn legacy_urls_from_config() {
    let (global, _) =
        GlobalConfig::from_yaml("storybook:\n  legacyUrls: true\n").expect("valid config");
    assert_eq!(global.storybook.url_style, UrlStyle::Legacy);

    let planned = plan(&catalog(), &global, PREVIEW, &ShardOptions::default()).expect("plan");
    assert_eq!(planned[0].encoded_params, "selectedKind=Foo&selectedStory=baz");
}

#[test]
fn sharded_plans_cover_the_catalog() {
    let total = plan(&catalog(), &GlobalConfig::default(), PREVIEW, &ShardOptions::default())
        .expect("plan")
        .len();

    let mut seen = Vec::new();
    for index in 0..2 {
        let options = ShardOptions {
            shard_count: Some(2),
            shard_index: Some(index),
            ..Default::default()
        };
        let shard = plan(&catalog(), &GlobalConfig::default(), PREVIEW, &options).expect("shard");
        seen.extend(shard.into_iter().map(|s| s.name));
    }
    assert_eq!(seen.len(), total);
}

#[test]
fn fully_filtered_catalog_is_an_error() {
    let (global, _) =
        GlobalConfig::from_yaml("snapshot:\n  exclude: ['.*']\n").expect("valid config");
    let err = plan(&catalog(), &global, PREVIEW, &ShardOptions::default()).expect_err("empty plan");
    assert!(matches!(
        err,
        Error::NoSnapshots(NoSnapshotsReason::AllFiltered { discovered: 3 })
    ));
}
