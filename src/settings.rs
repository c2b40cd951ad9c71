use std::collections::BTreeMap;

pub const DATA_REGISTRY_URL: &str = "DATA_REGISTRY_URL";
pub const DATA_REGISTRY_ACCESS_TOKEN: &str = "DATA_REGISTRY_ACCESS_TOKEN";
pub const DEFAULT_DATA_REGISTRY_URL: &str = "https://data.scrc.uk/api/";

const DATA_PIPELINE_PREFIX: &str = "DATA_PIPELINE_";

pub fn registry_url(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(DATA_REGISTRY_URL).ok())
        .unwrap_or_else(|| DEFAULT_DATA_REGISTRY_URL.to_string())
}

pub fn access_token(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(DATA_REGISTRY_ACCESS_TOKEN).ok())
        .filter(|token| !token.trim().is_empty())
}

// Every DATA_PIPELINE_<KEY> variable is forwarded as a lower-cased remote
// transport option, e.g. DATA_PIPELINE_USERNAME -> username.
pub fn remote_options() -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    for (name, value) in std::env::vars() {
        if let Some(stripped) = name.strip_prefix(DATA_PIPELINE_PREFIX) {
            options.insert(stripped.to_lowercase(), value);
        }
    }
    options
}
