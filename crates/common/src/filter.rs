//! Include/exclude/skip story filtering

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// A story name pattern
///
/// Accepts `/source/flags` strings, plain strings (compiled as a regular
/// expression when possible, compared literally otherwise) and compiled
/// regular expressions.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Option<Regex>,
}

impl Pattern {
    /// Parse a pattern string
    pub fn parse(input: &str) -> Result<Self> {
        if let Some((source, flags)) = split_regex_literal(input) {
            let mut builder = RegexBuilder::new(source);
            for flag in flags.chars() {
                match flag {
                    'i' => builder.case_insensitive(true),
                    'm' => builder.multi_line(true),
                    's' => builder.dot_matches_new_line(true),
                    'x' => builder.ignore_whitespace(true),
                    // Global, unicode and sticky have no meaning for a single test
                    'g' | 'u' | 'y' => &mut builder,
                    other => {
                        return Err(Error::Config(format!(
                            "unsupported pattern flag '{}' in {}",
                            other, input
                        )))
                    }
                };
            }
            let regex = builder
                .build()
                .map_err(|e| Error::Config(format!("invalid pattern {}: {}", input, e)))?;
            return Ok(Self {
                source: input.to_string(),
                regex: Some(regex),
            });
        }

        Ok(Self {
            source: input.to_string(),
            regex: Regex::new(input).ok(),
        })
    }

    /// Source text the pattern was built from
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Test a story name
    pub fn matches(&self, name: &str) -> bool {
        self.regex.as_ref().map(|r| r.is_match(name)).unwrap_or(false) || name == self.source
    }
}

impl From<Regex> for Pattern {
    fn from(regex: Regex) -> Self {
        Self {
            source: regex.as_str().to_string(),
            regex: Some(regex),
        }
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl std::str::FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Pattern::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Split `/source/flags` into its parts
fn split_regex_literal(input: &str) -> Option<(&str, &str)> {
    let rest = input.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let (source, flags) = (&rest[..end], &rest[end + 1..]);
    if source.is_empty() || !flags.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((source, flags))
}

/// The filtering subset of a snapshot's options
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterOptions<'a> {
    pub skip: bool,
    pub include: Option<&'a [Pattern]>,
    pub exclude: Option<&'a [Pattern]>,
}

/// Decide whether a story is skipped
///
/// Global include/exclude replace story-level filters when either is set. A
/// non-empty include list decides on its own, overriding `skip` both ways;
/// any exclude match always skips.
pub fn should_skip(name: &str, story: FilterOptions<'_>, global: FilterOptions<'_>) -> bool {
    let (include, exclude) = if global.include.is_some() || global.exclude.is_some() {
        (global.include, global.exclude)
    } else {
        (story.include, story.exclude)
    };

    let matches = |patterns: Option<&[Pattern]>| {
        patterns
            .map(|list| list.iter().any(|p| p.matches(name)))
            .unwrap_or(false)
    };

    let skipped = match include {
        Some(list) if !list.is_empty() => !matches(Some(list)),
        _ => story.skip,
    };

    skipped || matches(exclude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn patterns(list: &[&str]) -> Vec<Pattern> {
        list.iter().map(|p| Pattern::parse(p).unwrap()).collect()
    }

    #[test_case("/^button/i", "Button: Primary", true ; "flagged literal")]
    #[test_case("/^button/", "Button: Primary", false ; "case sensitive literal")]
    #[test_case("Primary$", "Button: Primary", true ; "plain regex source")]
    #[test_case("Button: (", "Button: (", true ; "invalid regex falls back to equality")]
    #[test_case("Card", "Button: Primary", false ; "no match")]
    fn test_pattern_matching(pattern: &str, name: &str, expected: bool) {
        assert_eq!(Pattern::parse(pattern).unwrap().matches(name), expected);
    }

    #[test]
    fn test_compiled_patterns_are_supported() {
        let pattern = Pattern::from(Regex::new("Dark").unwrap());
        assert!(pattern.matches("Theme: Dark"));
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(Pattern::parse("/foo/q").is_err());
    }

    #[test]
    fn test_global_include_overrides_skip() {
        let include = patterns(&["Foo"]);
        let story = FilterOptions {
            skip: true,
            ..Default::default()
        };
        let global = FilterOptions {
            include: Some(&include),
            ..Default::default()
        };
        assert!(!should_skip("Foo: bar", story, global));
    }

    #[test]
    fn test_global_exclude_always_wins() {
        let include = patterns(&["Foo"]);
        let exclude = patterns(&["Foo"]);
        let story = FilterOptions {
            skip: true,
            ..Default::default()
        };
        let global = FilterOptions {
            include: Some(&include),
            exclude: Some(&exclude),
            ..Default::default()
        };
        assert!(should_skip("Foo: bar", story, global));

        let only_exclude = FilterOptions {
            exclude: Some(&exclude),
            ..Default::default()
        };
        assert!(should_skip("Foo: bar", FilterOptions::default(), only_exclude));
    }

    #[test]
    fn test_global_include_beats_explicit_skip_false() {
        let include = patterns(&["Card"]);
        let story = FilterOptions {
            skip: false,
            ..Default::default()
        };
        let global = FilterOptions {
            include: Some(&include),
            ..Default::default()
        };
        assert!(should_skip("Foo: bar", story, global));
    }

    #[test]
    fn test_global_filters_replace_story_filters() {
        let story_exclude = patterns(&["bar"]);
        let global_include = patterns(&["Foo"]);
        let story = FilterOptions {
            exclude: Some(&story_exclude),
            ..Default::default()
        };
        let global = FilterOptions {
            include: Some(&global_include),
            ..Default::default()
        };
        assert!(!should_skip("Foo: bar", story, global));
    }

    #[test]
    fn test_story_level_filters_apply_without_globals() {
        let include = patterns(&["/^Foo/"]);
        let story = FilterOptions {
            include: Some(&include),
            ..Default::default()
        };
        assert!(!should_skip("Foo: bar", story, FilterOptions::default()));
        assert!(should_skip("Bar: foo", story, FilterOptions::default()));
    }

    #[test]
    fn test_skip_flag_without_filters() {
        let story = FilterOptions {
            skip: true,
            ..Default::default()
        };
        assert!(should_skip("Foo: bar", story, FilterOptions::default()));
        assert!(!should_skip("Foo: bar", FilterOptions::default(), FilterOptions::default()));
    }

    #[test]
    fn test_empty_include_falls_back_to_skip() {
        let include: Vec<Pattern> = Vec::new();
        let story = FilterOptions {
            skip: false,
            include: Some(&include),
            ..Default::default()
        };
        assert!(!should_skip("Foo: bar", story, FilterOptions::default()));
    }
}
