use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::PipelineError;

pub type Entity = serde_json::Map<String, Value>;

pub mod target {
    pub const NAMESPACE: &str = "namespace";
    pub const DATA_PRODUCT: &str = "data_product";
    pub const EXTERNAL_OBJECT: &str = "external_object";
    pub const OBJECT: &str = "object";
    pub const OBJECT_COMPONENT: &str = "object_component";
    pub const STORAGE_LOCATION: &str = "storage_location";
    pub const STORAGE_ROOT: &str = "storage_root";
    pub const CODE_RUN: &str = "code_run";
}

pub mod field {
    pub const NAME: &str = "name";
    pub const URL: &str = "url";
    pub const VERSION: &str = "version";
    pub const NAMESPACE: &str = "namespace";
    pub const OBJECT: &str = "object";
    pub const COMPONENTS: &str = "components";
    pub const STORAGE_LOCATION: &str = "storage_location";
    pub const STORAGE_ROOT: &str = "storage_root";
    pub const PATH: &str = "path";
    pub const HASH: &str = "hash";
    pub const ROOT: &str = "root";
    pub const ACCESSIBILITY: &str = "accessibility";
    pub const DOI_OR_UNIQUE_NAME: &str = "doi_or_unique_name";
    pub const TITLE: &str = "title";
    pub const DESCRIPTION: &str = "description";
    pub const RUN_DATE: &str = "run_date";
    pub const INPUTS: &str = "inputs";
    pub const OUTPUTS: &str = "outputs";
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Text(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Text(value)
    }
}

impl From<DateTime<Utc>> for QueryValue {
    fn from(value: DateTime<Utc>) -> Self {
        QueryValue::Timestamp(value)
    }
}

pub type Query = BTreeMap<String, QueryValue>;

pub fn format_query(query: &Query) -> String {
    query
        .iter()
        .map(|(name, value)| match value {
            QueryValue::Text(text) => format!("{name}={text}"),
            QueryValue::Timestamp(ts) => format!("{name}={}", encode_timestamp(ts)),
        })
        .collect::<Vec<_>>()
        .join("&")
}

// ISO-8601 with a trailing Z, fractional seconds only when present.
pub(crate) fn encode_timestamp(value: &DateTime<Utc>) -> String {
    format!("{}Z", value.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f"))
}

pub fn endpoint(base_url: &str, target: &str) -> String {
    format!("{}/{}/", base_url.trim_end_matches('/'), target.trim_matches('/'))
}

// A value that is itself a reference URL collapses to its trailing numeric id;
// non-numeric tails pass through untouched.
fn reference_to_id<'a>(value: &'a str, base_url: &str) -> &'a str {
    if value.starts_with(base_url) {
        let tail = value.trim_end_matches('/').rsplit('/').next().unwrap_or(value);
        if !tail.is_empty() && tail.chars().all(|ch| ch.is_ascii_digit()) {
            return tail;
        }
    }
    value
}

pub fn unique<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut result: Vec<T> = Vec::new();
    for item in items {
        if !result.contains(&item) {
            result.push(item);
        }
    }
    result
}

// Memoized GET responses plus the per-target filterable-field sets. Mutating
// requests must invalidate the affected target's endpoint prefix.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<String, Value>>,
    filter_fields: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, url: &str) -> Option<Value> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    fn store(&self, url: &str, value: Value) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), value);
    }

    fn lookup_fields(&self, target: &str) -> Option<BTreeSet<String>> {
        self.filter_fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned()
    }

    fn store_fields(&self, target: &str, fields: BTreeSet<String>) {
        self.filter_fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.to_string(), fields);
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|url, _| !url.starts_with(prefix));
    }
}

pub trait RegistryClient {
    fn base_url(&self) -> &str;
    fn filter_fields(&self, target: &str) -> Result<BTreeSet<String>, PipelineError>;
    fn get_filtered(&self, target: &str, query: &Query) -> Result<Vec<Entity>, PipelineError>;
    fn get_url(&self, url: &str) -> Result<Entity, PipelineError>;
    fn post(&self, target: &str, data: &ResolvedData) -> Result<(), PipelineError>;
    fn patch(&self, url: &str, data: &ResolvedData) -> Result<(), PipelineError>;
    fn invalidate(&self, target: &str);

    fn get_exact(&self, target: &str, query: &Query) -> Result<Option<Entity>, PipelineError> {
        let results = self.get_filtered(target, query)?;
        match results.len() {
            0 => Ok(None),
            1 => Ok(results.into_iter().next()),
            count => Err(PipelineError::AmbiguousResult {
                target: target.to_string(),
                query: format_query(query),
                count,
            }),
        }
    }
}

pub struct HttpRegistryClient {
    http: Client,
    base_url: String,
    token: Option<String>,
    cache: QueryCache,
}

impl HttpRegistryClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        cache: QueryCache,
    ) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("pdm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PipelineError::RegistryHttp(err.to_string()))?,
        );
        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| PipelineError::RegistryHttp(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token,
            cache,
        })
    }

    fn request(&self, method: Method, url: &str) -> reqwest::blocking::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("token {token}"));
        }
        builder
    }

    fn send(&self, method: Method, url: &str) -> Result<reqwest::blocking::Response, PipelineError> {
        let response = self
            .request(method, url)
            .send()
            .map_err(|err| PipelineError::RegistryHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "registry request failed".to_string());
            return Err(PipelineError::RegistryStatus { status, message });
        }
        Ok(response)
    }

    fn get_json(&self, url: &str) -> Result<Value, PipelineError> {
        info!("GET {url}");
        let response = self.send(Method::GET, url)?;
        debug!("GET successful: {}", response.status());
        response
            .json()
            .map_err(|err| PipelineError::RegistryHttp(err.to_string()))
    }

    // Follows `next` links transparently; a paginated response is returned as
    // the concatenation of every page's `results`.
    fn get_following_pagination(&self, url: &str) -> Result<Value, PipelineError> {
        let json = self.get_json(url)?;
        let Some(page) = json.as_object() else {
            return Ok(json);
        };
        if !(page.contains_key("next") && page.contains_key("results")) {
            return Ok(json);
        }
        let mut results = page
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if let Some(count) = page.get("count").and_then(Value::as_u64) {
            if !results.is_empty() {
                info!("{} page(s) of results", count.div_ceil(results.len() as u64));
            }
        }
        let mut next = page
            .get("next")
            .and_then(Value::as_str)
            .map(str::to_string);
        while let Some(next_url) = next {
            let page = self.get_json(&next_url)?;
            next = page
                .get("next")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(items) = page.get("results").and_then(Value::as_array) {
                results.extend(items.iter().cloned());
            }
        }
        Ok(Value::Array(results))
    }

    fn get_cached(&self, url: &str) -> Result<Value, PipelineError> {
        if let Some(hit) = self.cache.lookup(url) {
            debug!("cache hit for {url}");
            return Ok(hit);
        }
        let value = self.get_following_pagination(url)?;
        self.cache.store(url, value.clone());
        Ok(value)
    }

    fn build_query_pairs(&self, query: &Query, fields: &BTreeSet<String>) -> Vec<(String, String)> {
        query
            .iter()
            .filter(|(name, _)| fields.contains(*name))
            .map(|(name, value)| {
                let encoded = match value {
                    QueryValue::Text(text) => reference_to_id(text, &self.base_url).to_string(),
                    QueryValue::Timestamp(ts) => encode_timestamp(ts),
                };
                (name.clone(), encoded)
            })
            .collect()
    }
}

impl RegistryClient for HttpRegistryClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn filter_fields(&self, target: &str) -> Result<BTreeSet<String>, PipelineError> {
        if let Some(fields) = self.cache.lookup_fields(target) {
            return Ok(fields);
        }
        let url = endpoint(&self.base_url, target);
        info!("OPTIONS {url}");
        let response = self.send(Method::OPTIONS, &url)?;
        let options: Value = response
            .json()
            .map_err(|err| PipelineError::RegistryHttp(err.to_string()))?;
        let fields: BTreeSet<String> = options
            .get("filter_fields")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.cache.store_fields(target, fields.clone());
        Ok(fields)
    }

    fn get_filtered(&self, target: &str, query: &Query) -> Result<Vec<Entity>, PipelineError> {
        let fields = self.filter_fields(target)?;
        let pairs = self.build_query_pairs(query, &fields);
        let base = endpoint(&self.base_url, target);
        let url = if pairs.is_empty() {
            base
        } else {
            reqwest::Url::parse_with_params(&base, &pairs)
                .map_err(|err| PipelineError::RegistryHttp(err.to_string()))?
                .to_string()
        };
        let value = self.get_cached(&url)?;
        let results = as_entities(value)?;
        if results.is_empty() {
            info!(
                "no matching data found for query '{}' on target '{target}'",
                format_query(query)
            );
        } else {
            info!(
                "{} matching data item(s) found for query '{}' on target '{target}'",
                results.len(),
                format_query(query)
            );
        }
        Ok(results)
    }

    fn get_url(&self, url: &str) -> Result<Entity, PipelineError> {
        match self.get_cached(url)? {
            Value::Object(entity) => Ok(entity),
            other => Err(PipelineError::RegistryData(format!(
                "expected an entity at {url}, got {other}"
            ))),
        }
    }

    fn post(&self, target: &str, data: &ResolvedData) -> Result<(), PipelineError> {
        let url = endpoint(&self.base_url, target);
        info!("POST {url}");
        let form = resolved_to_form(data);
        let response = self
            .request(Method::POST, &url)
            .form(&form)
            .send()
            .map_err(|err| PipelineError::RegistryHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "registry request failed".to_string());
            return Err(PipelineError::RegistryStatus { status, message });
        }
        info!("POST successful: {url}");
        Ok(())
    }

    fn patch(&self, url: &str, data: &ResolvedData) -> Result<(), PipelineError> {
        info!("PATCH {url}");
        let form = resolved_to_form(data);
        let response = self
            .request(Method::PATCH, url)
            .form(&form)
            .send()
            .map_err(|err| PipelineError::RegistryHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "registry request failed".to_string());
            return Err(PipelineError::RegistryStatus { status, message });
        }
        info!("PATCH successful: {url}");
        Ok(())
    }

    fn invalidate(&self, target: &str) {
        self.cache.invalidate_prefix(&endpoint(&self.base_url, target));
    }
}

fn as_entities(value: Value) -> Result<Vec<Entity>, PipelineError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(entity) => Ok(entity),
                other => Err(PipelineError::RegistryData(format!(
                    "expected an entity, got {other}"
                ))),
            })
            .collect(),
        Value::Object(entity) => Ok(vec![entity]),
        other => Err(PipelineError::RegistryData(format!(
            "expected a list of entities, got {other}"
        ))),
    }
}

pub fn entity_field<'a>(entity: &'a Entity, name: &str) -> Result<&'a str, PipelineError> {
    entity
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| PipelineError::RegistryData(format!("entity has no '{name}' field")))
}

// An upload definition is a closed tree: scalars, lists of values, or a nested
// {target, data} definition resolved bottom-up to its reference URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UploadValue {
    Nested(UploadDefinition),
    List(Vec<UploadValue>),
    Integer(i64),
    Scalar(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadDefinition {
    pub target: String,
    pub data: BTreeMap<String, UploadValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    One(String),
    Many(Vec<String>),
}

pub type ResolvedData = BTreeMap<String, ResolvedValue>;

pub fn resolved_to_form(data: &ResolvedData) -> Vec<(String, String)> {
    let mut form = Vec::new();
    for (name, value) in data {
        match value {
            ResolvedValue::One(text) => form.push((name.clone(), text.clone())),
            ResolvedValue::Many(items) => {
                for item in items {
                    form.push((name.clone(), item.clone()));
                }
            }
        }
    }
    form
}

pub fn resolved_to_query(data: &ResolvedData) -> Query {
    data.iter()
        .filter_map(|(name, value)| match value {
            ResolvedValue::One(text) => Some((name.clone(), QueryValue::Text(text.clone()))),
            ResolvedValue::Many(_) => None,
        })
        .collect()
}

pub fn get_reference<R: RegistryClient + ?Sized>(
    client: &R,
    target: &str,
    query: &Query,
) -> Result<Option<String>, PipelineError> {
    match client.get_exact(target, query)? {
        Some(entity) => {
            let url = entity_field(&entity, field::URL)?;
            info!("found reference: {url} from target '{target}'");
            Ok(Some(url.to_string()))
        }
        None => {
            info!("no reference found from target '{target}'");
            Ok(None)
        }
    }
}

pub fn resolve_references<R: RegistryClient + ?Sized>(
    client: &R,
    data: &BTreeMap<String, UploadValue>,
) -> Result<ResolvedData, PipelineError> {
    let mut resolved = ResolvedData::new();
    for (name, value) in data {
        match resolve_value(client, value)? {
            Some(value) => {
                resolved.insert(name.clone(), value);
            }
            None => debug!("dropping unresolved reference for field '{name}'"),
        }
    }
    Ok(resolved)
}

fn resolve_value<R: RegistryClient + ?Sized>(
    client: &R,
    value: &UploadValue,
) -> Result<Option<ResolvedValue>, PipelineError> {
    match value {
        UploadValue::Scalar(text) => Ok(Some(ResolvedValue::One(text.trim().to_string()))),
        UploadValue::Integer(number) => Ok(Some(ResolvedValue::One(number.to_string()))),
        UploadValue::Nested(definition) => {
            let nested = resolve_references(client, &definition.data)?;
            let reference =
                get_reference(client, &definition.target, &resolved_to_query(&nested))?;
            Ok(reference.map(ResolvedValue::One))
        }
        UploadValue::List(items) => {
            let mut urls = Vec::new();
            for item in items {
                if let Some(ResolvedValue::One(url)) = resolve_value(client, item)? {
                    urls.push(url);
                }
            }
            Ok(Some(ResolvedValue::Many(urls)))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    Post,
    Patch,
}

pub fn upsert<R: RegistryClient + ?Sized>(
    client: &R,
    method: WriteMethod,
    target: &str,
    data: &BTreeMap<String, UploadValue>,
    fail_fast: bool,
) -> Result<(), PipelineError> {
    let resolved = resolve_references(client, data)?;
    if let Some(ResolvedValue::One(version)) = resolved.get(field::VERSION) {
        Version::parse(version).map_err(|_| PipelineError::VersionFormat(version.clone()))?;
    }
    let reference = get_reference(client, target, &resolved_to_query(&resolved))?;
    match method {
        WriteMethod::Post => match reference {
            Some(reference) if fail_fast => Err(PipelineError::AlreadyExists(format!(
                "{target} ({reference})"
            ))),
            Some(_) => {
                info!("nothing to do for POST on target '{target}'");
                Ok(())
            }
            None => {
                client.post(target, &resolved)?;
                client.invalidate(target);
                Ok(())
            }
        },
        WriteMethod::Patch => match reference {
            Some(reference) => {
                client.patch(&reference, &resolved)?;
                client.invalidate(target);
                Ok(())
            }
            None if fail_fast => Err(PipelineError::Lookup(format!(
                "no existing entity to PATCH on target '{target}' for {}",
                format_query(&resolved_to_query(&resolved))
            ))),
            None => {
                info!("nothing to do for PATCH on target '{target}'");
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_with_one_trailing_slash() {
        assert_eq!(
            endpoint("https://registry/api/", "namespace"),
            "https://registry/api/namespace/"
        );
        assert_eq!(
            endpoint("https://registry/api", "namespace/"),
            "https://registry/api/namespace/"
        );
    }

    #[test]
    fn reference_urls_collapse_to_ids() {
        let base = "https://registry/api/";
        assert_eq!(
            reference_to_id("https://registry/api/namespace/42/", base),
            "42"
        );
        assert_eq!(
            reference_to_id("https://registry/api/namespace/latest/", base),
            "https://registry/api/namespace/latest/"
        );
        assert_eq!(reference_to_id("plain-value", base), "plain-value");
    }

    #[test]
    fn unique_preserves_first_occurrence_order() {
        let items = vec![
            BTreeMap::from([("a".to_string(), 1)]),
            BTreeMap::from([("b".to_string(), 2)]),
            BTreeMap::from([("a".to_string(), 1)]),
        ];
        let result = unique(items);
        assert_eq!(result.len(), 2);
        assert!(result[0].contains_key("a"));
        assert!(result[1].contains_key("b"));
    }

    #[test]
    fn timestamps_encode_with_trailing_z() {
        let ts: DateTime<Utc> = "2020-06-29T13:05:22.096348Z".parse().unwrap();
        assert_eq!(encode_timestamp(&ts), "2020-06-29T13:05:22.096348Z");
    }

    #[test]
    fn cache_invalidation_is_by_prefix() {
        let cache = QueryCache::new();
        cache.store("https://registry/api/namespace/?name=a", Value::Array(vec![]));
        cache.store("https://registry/api/object/1/", Value::Array(vec![]));
        cache.invalidate_prefix("https://registry/api/namespace/");
        assert!(cache.lookup("https://registry/api/namespace/?name=a").is_none());
        assert!(cache.lookup("https://registry/api/object/1/").is_some());
    }

    #[test]
    fn resolved_form_repeats_list_fields() {
        let data = ResolvedData::from([
            (
                "inputs".to_string(),
                ResolvedValue::Many(vec!["u1".to_string(), "u2".to_string()]),
            ),
            ("name".to_string(), ResolvedValue::One("run".to_string())),
        ]);
        let form = resolved_to_form(&data);
        assert_eq!(
            form,
            vec![
                ("inputs".to_string(), "u1".to_string()),
                ("inputs".to_string(), "u2".to_string()),
                ("name".to_string(), "run".to_string()),
            ]
        );
    }

    #[test]
    fn upload_definitions_deserialize_from_yaml() {
        let yaml = r#"
target: data_product
data:
  name: human/mortality
  version: 1.0.0
  namespace:
    target: namespace
    data:
      name: example
"#;
        let definition: UploadDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(definition.target, "data_product");
        assert!(matches!(
            definition.data.get("namespace"),
            Some(UploadValue::Nested(_))
        ));
    }
}
