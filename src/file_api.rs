use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::config::{AccessLogSetting, LoadedConfig, is_reserved_run_metadata};
use crate::error::PipelineError;
use crate::metadata::{Metadata, MetadataValue, key, log_format_metadata};
use crate::metadata_store::MetadataStore;
use crate::overrides::Overrides;

pub const DEFAULT_ACCESS_LOG: &str = "access-{run_id}.yaml";

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn hash_file(path: &Path) -> Result<String, PipelineError> {
    let bytes = fs::read(path)
        .map_err(|err| PipelineError::Filesystem(format!("{}: {err}", path.display())))?;
    Ok(hash_bytes(&bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAccess {
    #[serde(rename = "type")]
    pub access_type: AccessType,
    pub timestamp: DateTime<Utc>,
    pub call_metadata: Metadata,
    pub access_metadata: Metadata,
    // Kept for deferred hashing of writes, not part of the log format.
    #[serde(skip)]
    pub path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLog {
    pub run_metadata: BTreeMap<String, serde_yaml::Value>,
    pub config: serde_yaml::Value,
    pub io: Vec<FileAccess>,
}

#[derive(Debug, Default)]
struct SessionState {
    accesses: Vec<FileAccess>,
}

// Write handle that owns the underlying file; the access record is appended
// exactly once when the handle is closed or dropped.
pub struct WriteHandle {
    file: Option<fs::File>,
    path: Utf8PathBuf,
    call_metadata: Metadata,
    write_metadata: Metadata,
    state: Arc<Mutex<SessionState>>,
    recorded: bool,
}

impl WriteHandle {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn close(mut self) -> Result<(), PipelineError> {
        self.finish()
            .map_err(|err| PipelineError::Filesystem(err.to_string()))
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.recorded {
            return Ok(());
        }
        self.recorded = true;
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.accesses.push(FileAccess {
            access_type: AccessType::Write,
            timestamp: Utc::now(),
            call_metadata: self.call_metadata.clone(),
            access_metadata: self.write_metadata.clone(),
            path: Some(self.path.clone()),
        });
        Ok(())
    }

    fn file_mut(&mut self) -> io::Result<&mut fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "write handle already closed"))
    }
}

impl Write for WriteHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl Read for WriteHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file_mut()?.read(buf)
    }
}

impl Seek for WriteHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file_mut()?.seek(pos)
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

// A tracked file access session: reads and writes are resolved through the
// local catalog and recorded, and close() emits the access log.
pub struct FileApi {
    run_id: String,
    open_timestamp: DateTime<Utc>,
    raw_config: serde_yaml::Value,
    data_directory: Utf8PathBuf,
    normalised_data_directory: Utf8PathBuf,
    access_log_path: Option<Utf8PathBuf>,
    fail_on_hash_mismatch: bool,
    read_overrides: Overrides,
    write_overrides: Overrides,
    metadata_store: MetadataStore,
    run_metadata: BTreeMap<String, serde_yaml::Value>,
    state: Arc<Mutex<SessionState>>,
}

impl FileApi {
    pub fn from_config(config_path: &Utf8Path) -> Result<Self, PipelineError> {
        let loaded = LoadedConfig::load(config_path)?;
        Self::from_loaded(loaded)
    }

    pub fn from_loaded(loaded: LoadedConfig) -> Result<Self, PipelineError> {
        let open_timestamp = Utc::now();
        let run_id = match &loaded.config.run_id {
            Some(run_id) => run_id.clone(),
            None => {
                let mut hasher = Sha1::new();
                hasher.update(&loaded.bytes);
                hasher.update(open_timestamp.to_string().as_bytes());
                hex::encode(hasher.finalize())
            }
        };

        let data_directory = loaded.data_directory();
        let normalised_data_directory = loaded.normalised_data_directory();

        let access_log_path = match &loaded.config.access_log {
            Some(AccessLogSetting::Enabled(false)) => None,
            Some(AccessLogSetting::Template(template)) => Some(template.clone()),
            Some(AccessLogSetting::Enabled(true)) | None => Some(DEFAULT_ACCESS_LOG.to_string()),
        }
        .map(|template| {
            let path = Utf8PathBuf::from(template.replace("{run_id}", &run_id));
            if path.is_absolute() {
                path
            } else {
                loaded.root.join(path)
            }
        });

        let metadata_path = normalised_data_directory.join(crate::downloader::METADATA_FILENAME);
        let metadata_store = if metadata_path.as_std_path().exists() {
            let content = fs::read_to_string(metadata_path.as_std_path())
                .map_err(|err| PipelineError::Catalog(err.to_string()))?;
            let records: Vec<Metadata> = if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_yaml::from_str(&content)
                    .map_err(|err| PipelineError::Catalog(err.to_string()))?
            };
            MetadataStore::new(records)?
        } else {
            debug!("no metadata catalog at {metadata_path}");
            MetadataStore::default()
        };

        info!("opened session {run_id} on {normalised_data_directory}");
        Ok(Self {
            run_id,
            open_timestamp,
            raw_config: loaded.raw.clone(),
            data_directory,
            normalised_data_directory,
            access_log_path,
            fail_on_hash_mismatch: loaded.config.fail_on_hash_mismatch.unwrap_or(true),
            read_overrides: Overrides::new(loaded.config.read.clone()),
            write_overrides: Overrides::new(loaded.config.write.clone()),
            metadata_store,
            run_metadata: loaded.config.run_metadata.clone(),
            state: Arc::new(Mutex::new(SessionState::default())),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn data_directory(&self) -> &Utf8Path {
        &self.normalised_data_directory
    }

    pub fn access_log_path(&self) -> Option<&Utf8Path> {
        self.access_log_path.as_deref()
    }

    pub fn set_run_metadata(
        &mut self,
        name: &str,
        value: impl Into<serde_yaml::Value>,
    ) -> Result<(), PipelineError> {
        if is_reserved_run_metadata(name) {
            return Err(PipelineError::ReservedRunMetadata(name.to_string()));
        }
        self.run_metadata.insert(name.to_string(), value.into());
        Ok(())
    }

    pub fn get_run_metadata(&self, name: &str) -> Option<&serde_yaml::Value> {
        self.run_metadata.get(name)
    }

    pub fn open_for_read(&self, call_metadata: Metadata) -> Result<fs::File, PipelineError> {
        let mut read_metadata = call_metadata.clone();
        self.read_overrides.apply(&mut read_metadata);
        let mut access_metadata = self
            .metadata_store
            .find(&read_metadata)
            .cloned()
            .unwrap_or(read_metadata);

        let filename = access_metadata
            .get(key::FILENAME)
            .and_then(MetadataValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::Lookup(format!(
                    "could not find {} in {}",
                    key::FILENAME,
                    log_format_metadata(&access_metadata)
                ))
            })?;
        let path = self.normalised_data_directory.join(filename);

        let calculated = hash_file(path.as_std_path())?;
        access_metadata.insert(
            key::CALCULATED_HASH.to_string(),
            MetadataValue::String(calculated.clone()),
        );
        if self.fail_on_hash_mismatch {
            let verified = access_metadata
                .get(key::VERIFIED_HASH)
                .and_then(MetadataValue::as_str)
                .ok_or_else(|| {
                    PipelineError::Lookup(format!(
                        "could not find {} in {}",
                        key::VERIFIED_HASH,
                        log_format_metadata(&access_metadata)
                    ))
                })?;
            if calculated != verified {
                return Err(PipelineError::HashMismatch {
                    calculated,
                    verified: verified.to_string(),
                });
            }
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.accesses.push(FileAccess {
            access_type: AccessType::Read,
            timestamp: Utc::now(),
            call_metadata,
            access_metadata,
            path: Some(path.clone()),
        });
        drop(state);

        fs::File::open(path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("{path}: {err}")))
    }

    pub fn open_for_write(&self, call_metadata: Metadata) -> Result<WriteHandle, PipelineError> {
        let mut write_metadata = call_metadata.clone();
        self.write_overrides.apply(&mut write_metadata);
        if !write_metadata.contains_key(key::FILENAME) {
            let data_product = write_metadata
                .get(key::DATA_PRODUCT)
                .and_then(MetadataValue::as_str)
                .ok_or_else(|| {
                    PipelineError::Lookup(format!(
                        "could not find {} in {}",
                        key::DATA_PRODUCT,
                        log_format_metadata(&write_metadata)
                    ))
                })?;
            let extension = write_metadata
                .get(key::EXTENSION)
                .and_then(MetadataValue::as_str)
                .ok_or_else(|| {
                    PipelineError::Lookup(format!(
                        "could not find {} in {}",
                        key::EXTENSION,
                        log_format_metadata(&write_metadata)
                    ))
                })?;
            let filename = format!("{data_product}/{}.{extension}", self.run_id);
            write_metadata.insert(key::FILENAME.to_string(), MetadataValue::String(filename));
        }

        let filename = write_metadata
            .get(key::FILENAME)
            .and_then(MetadataValue::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        let path = self.normalised_data_directory.join(filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        // Open for update so existing bytes are preserved.
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("{path}: {err}")))?;

        Ok(WriteHandle {
            file: Some(file),
            path,
            call_metadata,
            write_metadata,
            state: Arc::clone(&self.state),
            recorded: false,
        })
    }

    // Deferred write hashes are computed here, memoized per resolved path, so
    // they reflect final file contents.
    pub fn close(self) -> Result<(), PipelineError> {
        let close_timestamp = Utc::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut hash_cache: BTreeMap<Utf8PathBuf, String> = BTreeMap::new();
        for access in state.accesses.iter_mut() {
            if access.access_metadata.contains_key(key::CALCULATED_HASH) {
                continue;
            }
            let Some(path) = access.path.clone() else {
                continue;
            };
            let calculated = match hash_cache.get(&path) {
                Some(hash) => hash.clone(),
                None => {
                    let hash = hash_file(path.as_std_path())?;
                    hash_cache.insert(path, hash.clone());
                    hash
                }
            };
            access
                .access_metadata
                .insert(key::CALCULATED_HASH.to_string(), MetadataValue::String(calculated));
        }

        let Some(log_path) = &self.access_log_path else {
            info!("access log disabled, closing session {}", self.run_id);
            return Ok(());
        };

        let mut run_metadata = self.run_metadata.clone();
        run_metadata.insert(
            "run_id".to_string(),
            serde_yaml::Value::String(self.run_id.clone()),
        );
        run_metadata.insert(
            "open_timestamp".to_string(),
            serde_yaml::Value::String(self.open_timestamp.to_rfc3339()),
        );
        run_metadata.insert(
            "close_timestamp".to_string(),
            serde_yaml::Value::String(close_timestamp.to_rfc3339()),
        );
        run_metadata.insert(
            "data_directory".to_string(),
            serde_yaml::Value::String(self.data_directory.to_string()),
        );

        let log = AccessLog {
            run_metadata,
            config: self.raw_config.clone(),
            io: state.accesses.clone(),
        };
        let content = serde_yaml::to_string(&log)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        fs::write(log_path.as_std_path(), content)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        info!("wrote access log to {log_path}");
        Ok(())
    }
}
