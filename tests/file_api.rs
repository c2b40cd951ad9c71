use std::io::{Read, Write};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use pipeline_data_manager::error::PipelineError;
use pipeline_data_manager::file_api::{AccessLog, AccessType, FileApi, hash_bytes};
use pipeline_data_manager::metadata::{Metadata, MetadataValue};

fn meta(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), MetadataValue::from(*v)))
        .collect()
}

struct Fixture {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new(config: &str) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::write(root.join("config.yaml").as_std_path(), config).unwrap();
        Self { _temp: temp, root }
    }

    fn config_path(&self) -> Utf8PathBuf {
        self.root.join("config.yaml")
    }

    fn write_data_file(&self, relative: &str, content: &[u8]) {
        let path = self.root.join("data").join(relative);
        std::fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
        std::fs::write(path.as_std_path(), content).unwrap();
    }

    fn write_catalog(&self, records: &[Metadata]) {
        let path = self.root.join("data/metadata.yaml");
        std::fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
        std::fs::write(
            path.as_std_path(),
            serde_yaml::to_string(&records.to_vec()).unwrap(),
        )
        .unwrap();
    }

    fn open(&self) -> FileApi {
        FileApi::from_config(&self.config_path()).unwrap()
    }
}

fn catalog_entry(content: &[u8]) -> Metadata {
    let mut record = meta(&[
        ("data_product", "human/mortality"),
        ("version", "1.0.0"),
        ("filename", "human/mortality/1.0.0/mortality.csv"),
        ("extension", "csv"),
    ]);
    record.insert(
        "verified_hash".to_string(),
        MetadataValue::String(hash_bytes(content)),
    );
    record
}

const BASE_CONFIG: &str = "data_directory: data\nrun_id: test-run\n";

#[test]
fn read_with_matching_hash_succeeds_and_is_recorded() {
    let fixture = Fixture::new(BASE_CONFIG);
    let content = b"deaths,10\n";
    fixture.write_data_file("human/mortality/1.0.0/mortality.csv", content);
    fixture.write_catalog(&[catalog_entry(content)]);

    let api = fixture.open();
    let mut file = api
        .open_for_read(meta(&[("data_product", "human/mortality")]))
        .unwrap();
    let mut read_back = Vec::new();
    file.read_to_end(&mut read_back).unwrap();
    assert_eq!(read_back, content);

    api.close().unwrap();
    let log: AccessLog = serde_yaml::from_str(
        &std::fs::read_to_string(fixture.root.join("access-test-run.yaml").as_std_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(log.io.len(), 1);
    assert_eq!(log.io[0].access_type, AccessType::Read);
    assert_eq!(
        log.io[0].access_metadata.get("calculated_hash"),
        Some(&MetadataValue::String(hash_bytes(content)))
    );
}

#[test]
fn read_with_mismatched_hash_fails() {
    let fixture = Fixture::new(BASE_CONFIG);
    fixture.write_data_file("human/mortality/1.0.0/mortality.csv", b"tampered");
    fixture.write_catalog(&[catalog_entry(b"original")]);

    let api = fixture.open();
    let result = api.open_for_read(meta(&[("data_product", "human/mortality")]));
    assert_matches!(result, Err(PipelineError::HashMismatch { .. }));
}

#[test]
fn hash_verification_can_be_disabled() {
    let fixture = Fixture::new("data_directory: data\nrun_id: test-run\nfail_on_hash_mismatch: false\n");
    fixture.write_data_file("human/mortality/1.0.0/mortality.csv", b"tampered");
    fixture.write_catalog(&[catalog_entry(b"original")]);

    let api = fixture.open();
    assert!(api
        .open_for_read(meta(&[("data_product", "human/mortality")]))
        .is_ok());
}

#[test]
fn missing_catalog_entry_is_a_lookup_error() {
    let fixture = Fixture::new(BASE_CONFIG);
    fixture.write_catalog(&[]);

    let api = fixture.open();
    let result = api.open_for_read(meta(&[("data_product", "no-such-product")]));
    assert_matches!(result, Err(PipelineError::Lookup(_)));
}

#[test]
fn read_overrides_rewrite_the_lookup() {
    let config = "\
data_directory: data
run_id: test-run
read:
  - where:
      data_product: alias
    use:
      data_product: human/mortality
";
    let fixture = Fixture::new(config);
    let content = b"deaths,10\n";
    fixture.write_data_file("human/mortality/1.0.0/mortality.csv", content);
    fixture.write_catalog(&[catalog_entry(content)]);

    let api = fixture.open();
    assert!(api.open_for_read(meta(&[("data_product", "alias")])).is_ok());
}

#[test]
fn write_hash_reflects_final_contents() {
    let fixture = Fixture::new(BASE_CONFIG);
    let api = fixture.open();

    let mut handle = api
        .open_for_write(meta(&[("data_product", "output"), ("extension", "txt")]))
        .unwrap();
    handle.write_all(b"hello ").unwrap();
    handle.write_all(b"world").unwrap();
    handle.close().unwrap();
    api.close().unwrap();

    let log: AccessLog = serde_yaml::from_str(
        &std::fs::read_to_string(fixture.root.join("access-test-run.yaml").as_std_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(log.io.len(), 1);
    let record = &log.io[0];
    assert_eq!(record.access_type, AccessType::Write);
    assert_eq!(
        record.access_metadata.get("calculated_hash"),
        Some(&MetadataValue::String(hash_bytes(b"hello world")))
    );
    assert_eq!(
        record.access_metadata.get("filename"),
        Some(&MetadataValue::from("output/test-run.txt"))
    );
}

#[test]
fn dropped_handle_still_records_the_write() {
    let fixture = Fixture::new(BASE_CONFIG);
    let api = fixture.open();

    {
        let mut handle = api
            .open_for_write(meta(&[("data_product", "output"), ("extension", "txt")]))
            .unwrap();
        handle.write_all(b"dropped, not closed").unwrap();
    }
    api.close().unwrap();

    let log: AccessLog = serde_yaml::from_str(
        &std::fs::read_to_string(fixture.root.join("access-test-run.yaml").as_std_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(log.io.len(), 1);
    assert_eq!(
        log.io[0].access_metadata.get("calculated_hash"),
        Some(&MetadataValue::String(hash_bytes(b"dropped, not closed")))
    );
}

#[test]
fn existing_bytes_are_preserved_on_open_for_write() {
    let fixture = Fixture::new(BASE_CONFIG);
    fixture.write_data_file("output/test-run.txt", b"0123456789");

    let api = fixture.open();
    let mut handle = api
        .open_for_write(meta(&[("data_product", "output"), ("extension", "txt")]))
        .unwrap();
    handle.write_all(b"ab").unwrap();
    handle.close().unwrap();
    api.close().unwrap();

    let content = std::fs::read(
        fixture
            .root
            .join("data/output/test-run.txt")
            .as_std_path(),
    )
    .unwrap();
    assert_eq!(content, b"ab23456789");
}

#[test]
fn run_metadata_reserved_keys_are_rejected() {
    let fixture = Fixture::new(BASE_CONFIG);
    let mut api = fixture.open();
    assert_matches!(
        api.set_run_metadata("run_id", "other"),
        Err(PipelineError::ReservedRunMetadata(_))
    );
    api.set_run_metadata("description", "a test run").unwrap();
    assert_eq!(
        api.get_run_metadata("description"),
        Some(&serde_yaml::Value::String("a test run".to_string()))
    );
}

#[test]
fn access_log_carries_run_metadata_and_config() {
    let config = "\
data_directory: data
run_id: test-run
run_metadata:
  description: example
";
    let fixture = Fixture::new(config);
    let api = fixture.open();
    api.close().unwrap();

    let log: AccessLog = serde_yaml::from_str(
        &std::fs::read_to_string(fixture.root.join("access-test-run.yaml").as_std_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(
        log.run_metadata.get("run_id"),
        Some(&serde_yaml::Value::String("test-run".to_string()))
    );
    assert_eq!(
        log.run_metadata.get("data_directory"),
        Some(&serde_yaml::Value::String("data".to_string()))
    );
    assert!(log.run_metadata.contains_key("open_timestamp"));
    assert!(log.run_metadata.contains_key("close_timestamp"));
    assert_eq!(
        log.run_metadata.get("description"),
        Some(&serde_yaml::Value::String("example".to_string()))
    );
    assert!(log.config.get("data_directory").is_some());
    assert!(log.io.is_empty());
}

#[test]
fn access_log_false_disables_logging() {
    let fixture = Fixture::new("data_directory: data\nrun_id: test-run\naccess_log: false\n");
    let api = fixture.open();
    assert_eq!(api.access_log_path(), None);
    api.close().unwrap();
    assert!(!fixture.root.join("access-test-run.yaml").as_std_path().exists());
}

#[test]
fn generated_run_ids_are_unique_per_session() {
    let fixture = Fixture::new("data_directory: data\n");
    let api = fixture.open();
    assert_eq!(api.run_id().len(), 40);
}

#[test]
fn relative_paths_resolve_against_the_config_directory() {
    let fixture = Fixture::new(BASE_CONFIG);
    let api = fixture.open();
    assert_eq!(api.data_directory(), fixture.root.join("data"));
    let expected = fixture.root.join("access-test-run.yaml");
    assert_eq!(api.access_log_path(), Some(expected.as_path()));
}
