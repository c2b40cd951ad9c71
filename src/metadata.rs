use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub type Metadata = BTreeMap<String, MetadataValue>;

pub mod key {
    pub const FILENAME: &str = "filename";
    pub const DATA_PRODUCT: &str = "data_product";
    pub const NAMESPACE: &str = "namespace";
    pub const COMPONENT: &str = "component";
    pub const EXTENSION: &str = "extension";
    pub const RUN_ID: &str = "run_id";
    pub const VERSION: &str = "version";
    pub const VERIFIED_HASH: &str = "verified_hash";
    pub const CALCULATED_HASH: &str = "calculated_hash";
    pub const ACCESSIBILITY: &str = "accessibility";
    pub const DOI_OR_UNIQUE_NAME: &str = "doi_or_unique_name";
    pub const TITLE: &str = "title";
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    String(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(value) => write!(f, "{value}"),
            MetadataValue::Integer(value) => write!(f, "{value}"),
            MetadataValue::String(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

pub fn value_matches(value: &MetadataValue, pattern: &MetadataValue) -> bool {
    match (value, pattern) {
        (MetadataValue::String(value), MetadataValue::String(pattern)) => {
            glob_matches(value, pattern)
        }
        _ => value == pattern,
    }
}

pub fn matches(metadata: &Metadata, pattern: &Metadata) -> bool {
    pattern.iter().all(|(patkey, pattern_value)| {
        metadata
            .get(patkey)
            .map(|value| value_matches(value, pattern_value))
            .unwrap_or(false)
    })
}

pub fn glob_matches(value: &str, pattern: &str) -> bool {
    Regex::new(&translate_glob(pattern))
        .map(|regex| regex.is_match(value))
        .unwrap_or(false)
}

// fnmatch-style translation: `*` and `?` wildcards plus `[...]` classes with
// `!` negation; everything else matches literally.
pub fn translate_glob(pattern: &str) -> String {
    let mut regex = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' => {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '!' || chars[j] == ']') {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    regex.push_str("\\[");
                } else {
                    let inner: String = chars[i + 1..j].iter().collect();
                    regex.push('[');
                    if let Some(rest) = inner.strip_prefix('!') {
                        regex.push('^');
                        regex.push_str(&escape_class(rest));
                    } else {
                        regex.push_str(&escape_class(&inner));
                    }
                    regex.push(']');
                    i = j;
                }
            }
            ch => regex.push_str(&regex::escape(&ch.to_string())),
        }
        i += 1;
    }
    regex.push('$');
    regex
}

fn escape_class(inner: &str) -> String {
    inner.replace('\\', "\\\\").replace('^', "\\^")
}

pub fn log_format_metadata(metadata: &Metadata) -> String {
    metadata
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}
