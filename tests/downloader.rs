use std::collections::{BTreeSet, HashMap};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::{Value, json};

use pipeline_data_manager::downloader::{Downloader, METADATA_FILENAME};
use pipeline_data_manager::error::PipelineError;
use pipeline_data_manager::metadata::{Metadata, MetadataValue};
use pipeline_data_manager::registry::{Entity, Query, QueryValue, RegistryClient, ResolvedData};
use pipeline_data_manager::remote::RemoteOptions;

const BASE: &str = "https://registry.test/api/";

struct MockRegistry {
    tables: HashMap<String, Vec<Entity>>,
    by_url: HashMap<String, Entity>,
}

impl MockRegistry {
    fn new() -> Self {
        Self {
            tables: HashMap::new(),
            by_url: HashMap::new(),
        }
    }

    fn insert(&mut self, target: &str, entity: Value) {
        let entity = entity.as_object().unwrap().clone();
        if let Some(url) = entity.get("url").and_then(Value::as_str) {
            self.by_url.insert(url.to_string(), entity.clone());
        }
        self.tables
            .entry(target.to_string())
            .or_default()
            .push(entity);
    }
}

impl RegistryClient for MockRegistry {
    fn base_url(&self) -> &str {
        BASE
    }

    fn filter_fields(&self, _target: &str) -> Result<BTreeSet<String>, PipelineError> {
        Ok(["name", "namespace", "version", "object", "doi_or_unique_name", "title"]
            .iter()
            .map(|field| field.to_string())
            .collect())
    }

    fn get_filtered(&self, target: &str, query: &Query) -> Result<Vec<Entity>, PipelineError> {
        let rows = self.tables.get(target).cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter(|row| {
                query.iter().all(|(name, value)| match value {
                    QueryValue::Text(text) => row
                        .get(name)
                        .and_then(Value::as_str)
                        .map(|field| field == text)
                        .unwrap_or(false),
                    QueryValue::Timestamp(_) => false,
                })
            })
            .collect())
    }

    fn get_url(&self, url: &str) -> Result<Entity, PipelineError> {
        self.by_url
            .get(url)
            .cloned()
            .ok_or_else(|| PipelineError::RegistryData(format!("no entity at {url}")))
    }

    fn post(&self, _target: &str, _data: &ResolvedData) -> Result<(), PipelineError> {
        unimplemented!("downloads never POST")
    }

    fn patch(&self, _url: &str, _data: &ResolvedData) -> Result<(), PipelineError> {
        unimplemented!("downloads never PATCH")
    }

    fn invalidate(&self, _target: &str) {}
}

fn url(target: &str, id: u32) -> String {
    format!("{BASE}{target}/{id}/")
}

// Two versions of one data product: 0.1.0 carries c1/c2, 0.2.0 carries c3/c4.
fn seed_versions(registry: &mut MockRegistry, accessibility: Value, root: &str) {
    registry.insert(
        "namespace",
        json!({"name": "ns", "url": url("namespace", 1)}),
    );
    registry.insert(
        "data_product",
        json!({
            "name": "data", "version": "0.1.0",
            "namespace": url("namespace", 1),
            "object": url("object", 1),
            "url": url("data_product", 1)
        }),
    );
    registry.insert(
        "data_product",
        json!({
            "name": "data", "version": "0.2.0",
            "namespace": url("namespace", 1),
            "object": url("object", 2),
            "url": url("data_product", 2)
        }),
    );
    registry.insert(
        "object",
        json!({
            "url": url("object", 1),
            "components": [url("object_component", 1), url("object_component", 2)],
            "storage_location": url("storage_location", 1)
        }),
    );
    registry.insert(
        "object",
        json!({
            "url": url("object", 2),
            "components": [url("object_component", 3), url("object_component", 4)],
            "storage_location": url("storage_location", 2)
        }),
    );
    for (id, (name, object)) in [(1, ("c1", 1)), (2, ("c2", 1)), (3, ("c3", 2)), (4, ("c4", 2))] {
        registry.insert(
            "object_component",
            json!({
                "name": name,
                "object": url("object", object),
                "url": url("object_component", id)
            }),
        );
    }
    registry.insert(
        "storage_location",
        json!({
            "path": "store/data_0.1.0.csv", "hash": "hash-1",
            "storage_root": url("storage_root", 1),
            "url": url("storage_location", 1)
        }),
    );
    registry.insert(
        "storage_location",
        json!({
            "path": "store/data_0.2.0.csv", "hash": "hash-2",
            "storage_root": url("storage_root", 1),
            "url": url("storage_location", 2)
        }),
    );
    registry.insert(
        "storage_root",
        json!({
            "root": root,
            "accessibility": accessibility,
            "url": url("storage_root", 1)
        }),
    );
}

fn component_names(blocks: &[pipeline_data_manager::downloader::DataProductBlock]) -> Vec<String> {
    let mut names: Vec<String> = blocks
        .iter()
        .map(|block| {
            block
                .component
                .as_ref()
                .unwrap()
                .get("name")
                .unwrap()
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    names.sort();
    names
}

#[test]
fn newest_version_wins_without_filters() {
    let mut registry = MockRegistry::new();
    seed_versions(&mut registry, json!(1), "file:///nowhere");
    let mut downloader = Downloader::new(registry, "/tmp/unused", RemoteOptions::new());
    downloader.add_data_product("ns", "data", None, None);
    downloader.resolve().unwrap();

    let blocks = downloader.resolved_data_products();
    assert_eq!(blocks.len(), 2);
    for block in blocks {
        assert_eq!(
            block
                .data_product
                .as_ref()
                .unwrap()
                .get("version")
                .and_then(Value::as_str),
            Some("0.2.0")
        );
    }
    assert_eq!(component_names(blocks), vec!["c3", "c4"]);
}

#[test]
fn component_filter_selects_the_version_that_carries_it() {
    let mut registry = MockRegistry::new();
    seed_versions(&mut registry, json!(1), "file:///nowhere");
    let mut downloader = Downloader::new(registry, "/tmp/unused", RemoteOptions::new());
    downloader.add_data_product("ns", "data", Some("c2"), None);
    downloader.resolve().unwrap();

    let blocks = downloader.resolved_data_products();
    assert_eq!(blocks.len(), 1);
    assert_eq!(
        blocks[0]
            .data_product
            .as_ref()
            .unwrap()
            .get("version")
            .and_then(Value::as_str),
        Some("0.1.0")
    );
    assert_eq!(component_names(blocks), vec!["c2"]);
}

#[test]
fn explicit_version_is_respected() {
    let mut registry = MockRegistry::new();
    seed_versions(&mut registry, json!(1), "file:///nowhere");
    let mut downloader = Downloader::new(registry, "/tmp/unused", RemoteOptions::new());
    downloader.add_data_product("ns", "data", None, Some("0.1.0"));
    downloader.resolve().unwrap();

    let blocks = downloader.resolved_data_products();
    assert_eq!(blocks.len(), 2);
    assert_eq!(component_names(blocks), vec!["c1", "c2"]);
}

#[test]
fn unresolvable_request_errors_and_is_reenqueued() {
    let mut registry = MockRegistry::new();
    seed_versions(&mut registry, json!(1), "file:///nowhere");
    let mut downloader = Downloader::new(registry, "/tmp/unused", RemoteOptions::new());
    downloader.add_data_product("ns", "no-such-product", None, None);

    let result = downloader.resolve();
    assert_matches!(result, Err(PipelineError::Lookup(_)));
    assert_eq!(downloader.pending_data_products().len(), 1);
    assert_eq!(
        downloader.pending_data_products()[0].data_product_name,
        "no-such-product"
    );
}

#[test]
fn output_paths_are_product_version_basename() {
    let mut registry = MockRegistry::new();
    seed_versions(&mut registry, json!(1), "file:///nowhere");
    let mut downloader = Downloader::new(registry, "/tmp/unused", RemoteOptions::new());
    downloader.add_data_product("ns", "data", None, None);
    downloader.resolve().unwrap();

    for block in downloader.resolved_data_products() {
        assert_eq!(
            block.output_filename.as_ref().map(|path| path.as_str()),
            Some("data/0.2.0/data_0.2.0.csv")
        );
    }
}

#[test]
fn metadata_catalog_is_written_per_component() {
    let temp = tempfile::tempdir().unwrap();
    let data_dir = Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap();

    let mut registry = MockRegistry::new();
    seed_versions(&mut registry, json!(1), "file:///nowhere");
    let mut downloader = Downloader::new(registry, data_dir.clone(), RemoteOptions::new());
    downloader.add_data_product("ns", "data", None, None);
    // accessibility 1 is not public, so nothing is fetched but the catalog is
    // still written.
    downloader.download(true).unwrap();

    let content = std::fs::read_to_string(data_dir.join(METADATA_FILENAME).as_std_path()).unwrap();
    let records: Vec<Metadata> = serde_yaml::from_str(&content).unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(
            record.get("data_product"),
            Some(&MetadataValue::from("data"))
        );
        assert_eq!(record.get("namespace"), Some(&MetadataValue::from("ns")));
        assert_eq!(record.get("version"), Some(&MetadataValue::from("0.2.0")));
        assert_eq!(
            record.get("verified_hash"),
            Some(&MetadataValue::from("hash-2"))
        );
        assert_eq!(record.get("extension"), Some(&MetadataValue::from("csv")));
        assert_eq!(record.get("accessibility"), Some(&MetadataValue::Integer(1)));
    }
    let components: BTreeSet<String> = records
        .iter()
        .map(|record| record.get("component").unwrap().to_string())
        .collect();
    assert_eq!(
        components,
        BTreeSet::from(["c3".to_string(), "c4".to_string()])
    );
}

#[test]
fn public_file_storage_is_downloaded_once_per_hash() {
    let temp = tempfile::tempdir().unwrap();
    let remote_dir = temp.path().join("remote");
    std::fs::create_dir_all(remote_dir.join("store")).unwrap();
    std::fs::write(remote_dir.join("store/data_0.2.0.csv"), b"deaths,42\n").unwrap();
    std::fs::write(remote_dir.join("store/data_0.1.0.csv"), b"deaths,41\n").unwrap();
    let data_dir = Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap();

    let mut registry = MockRegistry::new();
    let root = format!("file://{}", remote_dir.display());
    seed_versions(&mut registry, json!(0), &root);
    let mut downloader = Downloader::new(registry, data_dir.clone(), RemoteOptions::new());
    downloader.add_data_product("ns", "data", None, None);
    downloader.download(true).unwrap();

    let downloaded = data_dir.join("data/0.2.0/data_0.2.0.csv");
    assert_eq!(
        std::fs::read(downloaded.as_std_path()).unwrap(),
        b"deaths,42\n"
    );
    // The 0.1.0 file belongs to blocks that lost the version selection.
    assert!(!data_dir.join("data/0.1.0/data_0.1.0.csv").as_std_path().exists());
}
