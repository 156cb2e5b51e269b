//! Story args and globals codec
//!
//! Storybook only accepts a conservative subset of values in the `args` and
//! `globals` query parameters. This module validates values against that
//! whitelist, encodes special values (null, dates, colors, booleans) into
//! sentinel strings and renders the positional `key:value;key:value` form the
//! preview iframe parses. The decoder is mirrored in [`ARG_CODEC_JS`] so the
//! capture side can replay the original values inside a live page.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

/// A story arg or global value as discovered from the catalog
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<ArgValue>),
    Object(ArgMap),
    /// Functions, class instances and anything else discovery could not represent
    Unsupported(String),
}

/// Args or globals keyed by name
pub type ArgMap = BTreeMap<String, ArgValue>;

/// Encoded form of an [`ArgValue`]: every leaf is a string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedValue {
    Leaf(String),
    List(Vec<EncodedValue>),
    Map(BTreeMap<String, EncodedValue>),
}

// Markers the discovery script uses for values JSON cannot carry.
const UNDEFINED_MARKER: &str = "$undefined";
const DATE_MARKER: &str = "$date";
const UNSUPPORTED_MARKER: &str = "$unsupported";

fn safe_string_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9 _-]*$").expect("static regex"))
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-?[0-9]+(\.[0-9]+)?$").expect("static regex"))
}

fn hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^#([a-f0-9]{3,4}|[a-f0-9]{6}|[a-f0-9]{8})$").expect("static regex")
    })
}

fn color_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(rgba?|hsla?)\(([0-9]{1,3}),\s?([0-9]{1,3})%?,\s?([0-9]{1,3})%?,?\s?([0-9](\.[0-9]{1,2})?)?\)$",
        )
        .expect("static regex")
    })
}

impl ArgValue {
    /// Convert a JSON value produced by story discovery
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ArgValue::Null,
            Value::Bool(b) => ArgValue::Bool(*b),
            Value::Number(n) => match n.as_f64() {
                Some(f) => ArgValue::Number(f),
                None => ArgValue::Unsupported(n.to_string()),
            },
            Value::String(s) => ArgValue::String(s.clone()),
            Value::Array(items) => ArgValue::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => {
                if map.len() == 1 {
                    if map.contains_key(UNDEFINED_MARKER) {
                        return ArgValue::Undefined;
                    }
                    if let Some(Value::String(iso)) = map.get(DATE_MARKER) {
                        return match DateTime::parse_from_rfc3339(iso) {
                            Ok(date) => ArgValue::Date(date.with_timezone(&Utc)),
                            Err(_) => ArgValue::Unsupported(format!("invalid date {}", iso)),
                        };
                    }
                    if let Some(kind) = map.get(UNSUPPORTED_MARKER) {
                        let kind = kind.as_str().unwrap_or("unknown");
                        return ArgValue::Unsupported(kind.to_string());
                    }
                }
                ArgValue::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Self::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Short type name used in validation messages
    pub fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Undefined => "undefined",
            ArgValue::Null => "null",
            ArgValue::Bool(_) => "boolean",
            ArgValue::Number(_) => "number",
            ArgValue::String(_) => "string",
            ArgValue::Date(_) => "date",
            ArgValue::Array(_) => "array",
            ArgValue::Object(_) => "object",
            ArgValue::Unsupported(_) => "unsupported",
        }
    }
}

/// Convert a JSON object into an arg map
pub fn args_from_json(value: &Value) -> Option<ArgMap> {
    match ArgValue::from_json(value) {
        ArgValue::Object(map) => Some(map),
        _ => None,
    }
}

/// Whether a key may appear in the args/globals query parameter
pub fn validate_key(key: &str) -> bool {
    !key.is_empty() && safe_string_re().is_match(key)
}

/// Check a key/value pair against the whitelist
pub fn validate(key: &str, value: &ArgValue) -> bool {
    if !validate_key(key) {
        return false;
    }
    match value {
        ArgValue::Undefined | ArgValue::Null | ArgValue::Date(_) | ArgValue::Bool(_) => true,
        ArgValue::Number(n) => n.is_finite(),
        ArgValue::String(s) => {
            safe_string_re().is_match(s)
                || number_re().is_match(s)
                || hex_re().is_match(s)
                || color_re().is_match(s)
        }
        ArgValue::Array(items) => items.iter().all(|item| validate(key, item)),
        ArgValue::Object(map) => map.iter().all(|(k, v)| validate(k, v)),
        ArgValue::Unsupported(_) => false,
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Encode a validated value into its sentinel form
pub fn encode(value: &ArgValue) -> EncodedValue {
    match value {
        ArgValue::Undefined => EncodedValue::Leaf("!undefined".into()),
        ArgValue::Null => EncodedValue::Leaf("!null".into()),
        ArgValue::Bool(b) => EncodedValue::Leaf(format!("!{}", b)),
        ArgValue::Number(n) => EncodedValue::Leaf(format_number(*n)),
        ArgValue::Date(date) => EncodedValue::Leaf(format!(
            "!date({})",
            date.to_rfc3339_opts(SecondsFormat::Millis, true)
        )),
        ArgValue::String(s) => {
            if hex_re().is_match(s) {
                EncodedValue::Leaf(format!("!hex({})", &s[1..]))
            } else if color_re().is_match(s) {
                let stripped: String = s
                    .chars()
                    .filter(|c| !c.is_whitespace() && *c != '%')
                    .collect();
                EncodedValue::Leaf(format!("!{}", stripped))
            } else {
                EncodedValue::Leaf(s.clone())
            }
        }
        ArgValue::Array(items) => EncodedValue::List(items.iter().map(encode).collect()),
        ArgValue::Object(map) => {
            EncodedValue::Map(map.iter().map(|(k, v)| (k.clone(), encode(v))).collect())
        }
        // Never valid; encoded verbatim so the codec stays total
        ArgValue::Unsupported(kind) => EncodedValue::Leaf(kind.clone()),
    }
}

/// Encode every entry of an arg map
pub fn encode_map(args: &ArgMap) -> BTreeMap<String, EncodedValue> {
    args.iter().map(|(k, v)| (k.clone(), encode(v))).collect()
}

fn decode_color(color: &str) -> Option<String> {
    let caps = color_re().captures(color)?;
    let function = caps.get(1)?.as_str();
    let percent = if function.to_ascii_lowercase().starts_with("hsl") { "%" } else { "" };
    let mut parts = vec![
        caps.get(2)?.as_str().to_string(),
        format!("{}{}", caps.get(3)?.as_str(), percent),
        format!("{}{}", caps.get(4)?.as_str(), percent),
    ];
    if let Some(alpha) = caps.get(5) {
        parts.push(alpha.as_str().to_string());
    }
    Some(format!("{}({})", function, parts.join(", ")))
}

fn decode_leaf(s: &str) -> ArgValue {
    match s {
        "!undefined" => return ArgValue::Undefined,
        "!null" => return ArgValue::Null,
        "!true" => return ArgValue::Bool(true),
        "!false" => return ArgValue::Bool(false),
        _ => {}
    }
    if let Some(iso) = s.strip_prefix("!date(").and_then(|rest| rest.strip_suffix(')')) {
        if let Ok(date) = DateTime::parse_from_rfc3339(iso) {
            return ArgValue::Date(date.with_timezone(&Utc));
        }
    }
    if let Some(digits) = s.strip_prefix("!hex(").and_then(|rest| rest.strip_suffix(')')) {
        return ArgValue::String(format!("#{}", digits));
    }
    if let Some(color) = s.strip_prefix('!').and_then(decode_color) {
        return ArgValue::String(color);
    }
    if number_re().is_match(s) {
        if let Ok(n) = s.parse::<f64>() {
            return ArgValue::Number(n);
        }
    }
    ArgValue::String(s.to_string())
}

/// Reverse [`encode`]
pub fn decode(value: &EncodedValue) -> ArgValue {
    match value {
        EncodedValue::Leaf(s) => decode_leaf(s),
        EncodedValue::List(items) => ArgValue::Array(items.iter().map(decode).collect()),
        EncodedValue::Map(map) => {
            ArgValue::Object(map.iter().map(|(k, v)| (k.clone(), decode(v))).collect())
        }
    }
}

/// Decode every entry of an encoded map
pub fn decode_map(encoded: &BTreeMap<String, EncodedValue>) -> ArgMap {
    encoded.iter().map(|(k, v)| (k.clone(), decode(v))).collect()
}

impl EncodedValue {
    /// JSON form handed to page evaluation
    pub fn to_json(&self) -> Value {
        match self {
            EncodedValue::Leaf(s) => Value::String(s.clone()),
            EncodedValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            EncodedValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn flatten(prefix: &str, value: &EncodedValue, out: &mut Vec<(String, String)>) {
    match value {
        EncodedValue::Leaf(s) => out.push((prefix.to_string(), s.clone())),
        EncodedValue::List(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten(&format!("{}[{}]", prefix, i), item, out);
            }
        }
        EncodedValue::Map(map) => {
            for (key, item) in map {
                flatten(&format!("{}.{}", prefix, key), item, out);
            }
        }
    }
}

/// Render args in the preview's positional syntax, e.g. `label:Hello+world;size:!null`
pub fn stringify_args(args: &ArgMap) -> String {
    let mut pairs = Vec::new();
    for (key, value) in encode_map(args) {
        flatten(&key, &value, &mut pairs);
    }
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}:{}", key, value).replace(' ', "+"))
        .collect::<Vec<_>>()
        .join(";")
}

enum Node {
    Leaf(String),
    List(BTreeMap<usize, Node>),
    Map(BTreeMap<String, Node>),
}

impl Node {
    fn into_encoded(self) -> EncodedValue {
        match self {
            Node::Leaf(s) => EncodedValue::Leaf(s),
            // Sparse indices collapse in order
            Node::List(items) => {
                EncodedValue::List(items.into_values().map(Node::into_encoded).collect())
            }
            Node::Map(map) => EncodedValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, v.into_encoded()))
                    .collect(),
            ),
        }
    }
}

enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<Segment>> {
    let invalid = || Error::Config(format!("invalid args path '{}'", path));
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if key.is_empty() {
            return Err(invalid());
        }
        segments.push(Segment::Key(key.to_string()));
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(invalid)?;
            let index = rest[1..close].parse::<usize>().map_err(|_| invalid())?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid());
            }
        }
    }
    Ok(segments)
}

fn insert(node: &mut Node, segments: &[Segment], value: String) -> Result<()> {
    let Some((head, tail)) = segments.split_first() else {
        return Ok(());
    };
    let child = match (head, &mut *node) {
        (Segment::Key(key), Node::Map(map)) => map
            .entry(key.clone())
            .or_insert_with(|| new_node(tail)),
        (Segment::Index(index), Node::List(items)) => {
            items.entry(*index).or_insert_with(|| new_node(tail))
        }
        _ => return Err(Error::Config("conflicting args paths".into())),
    };
    if tail.is_empty() {
        *child = Node::Leaf(value);
        Ok(())
    } else {
        insert(child, tail, value)
    }
}

fn new_node(tail: &[Segment]) -> Node {
    match tail.first() {
        Some(Segment::Index(_)) => Node::List(BTreeMap::new()),
        Some(Segment::Key(_)) => Node::Map(BTreeMap::new()),
        None => Node::Leaf(String::new()),
    }
}

/// Parse the positional syntax back into encoded values
pub fn parse_args(input: &str) -> Result<BTreeMap<String, EncodedValue>> {
    let mut root = Node::Map(BTreeMap::new());
    for pair in input.split(';').filter(|p| !p.is_empty()) {
        let (path, value) = pair
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("invalid args pair '{}'", pair)))?;
        let segments = parse_path(&path.replace('+', " "))?;
        insert(&mut root, &segments, value.replace('+', " "))?;
    }
    match root.into_encoded() {
        EncodedValue::Map(map) => Ok(map),
        _ => Err(Error::Internal("args root is not a map".into())),
    }
}

/// In-page mirror of [`decode`], injected into page evaluation scope
pub const ARG_CODEC_JS: &str = r#"
const STORYSNAP_NUMBER_RE = /^-?[0-9]+(\.[0-9]+)?$/;
const STORYSNAP_COLOR_RE = /^(rgba?|hsla?)\(([0-9]{1,3}),\s?([0-9]{1,3})%?,\s?([0-9]{1,3})%?,?\s?([0-9](\.[0-9]{1,2})?)?\)$/i;

function decodeStoryArg(value) {
  if (Array.isArray(value)) return value.map(decodeStoryArg);
  if (value && typeof value === 'object') {
    return Object.fromEntries(Object.entries(value).map(([k, v]) => [k, decodeStoryArg(v)]));
  }
  if (typeof value !== 'string') return value;
  if (value === '!undefined') return undefined;
  if (value === '!null') return null;
  if (value === '!true') return true;
  if (value === '!false') return false;
  if (value.startsWith('!date(') && value.endsWith(')')) return new Date(value.slice(6, -1));
  if (value.startsWith('!hex(') && value.endsWith(')')) return `#${value.slice(5, -1)}`;
  if (value.startsWith('!')) {
    const color = value.slice(1).match(STORYSNAP_COLOR_RE);
    if (color) {
      const pct = color[1].toLowerCase().startsWith('hsl') ? '%' : '';
      const parts = [color[2], color[3] + pct, color[4] + pct];
      if (color[5] !== undefined) parts.push(color[5]);
      return `${color[1]}(${parts.join(', ')})`;
    }
  }
  if (STORYSNAP_NUMBER_RE.test(value)) return Number(value);
  return value;
}
"#;
