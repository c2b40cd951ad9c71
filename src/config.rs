use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PipelineError;
use crate::metadata::{Metadata, key};
use crate::overrides::Override;

pub const RESERVED_RUN_METADATA: [&str; 4] = [
    "run_id",
    "open_timestamp",
    "close_timestamp",
    "data_directory",
];

pub fn is_reserved_run_metadata(name: &str) -> bool {
    RESERVED_RUN_METADATA.contains(&name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccessLogSetting {
    Enabled(bool),
    Template(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub data_directory: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub fail_on_hash_mismatch: Option<bool>,
    #[serde(default)]
    pub access_log: Option<AccessLogSetting>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub read: Vec<Override>,
    #[serde(default)]
    pub write: Vec<Override>,
    #[serde(default)]
    pub run_metadata: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: RunConfig,
    pub raw: serde_yaml::Value,
    pub bytes: Vec<u8>,
    pub path: Utf8PathBuf,
    pub root: Utf8PathBuf,
}

impl LoadedConfig {
    pub fn load(config_path: &Utf8Path) -> Result<Self, PipelineError> {
        let bytes = fs::read(config_path)
            .map_err(|_| PipelineError::ConfigRead(config_path.as_std_path().to_path_buf()))?;
        let config: RunConfig = serde_yaml::from_slice(&bytes)
            .map_err(|err| PipelineError::ConfigParse(err.to_string()))?;
        let raw: serde_yaml::Value = serde_yaml::from_slice(&bytes)
            .map_err(|err| PipelineError::ConfigParse(err.to_string()))?;
        for name in config.run_metadata.keys() {
            if is_reserved_run_metadata(name) {
                return Err(PipelineError::ReservedRunMetadata(name.clone()));
            }
        }
        let root = config_path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        Ok(Self {
            config,
            raw,
            bytes,
            path: config_path.to_path_buf(),
            root,
        })
    }

    pub fn data_directory(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.config.data_directory.as_deref().unwrap_or("."))
    }

    pub fn normalised_data_directory(&self) -> Utf8PathBuf {
        let data_directory = self.data_directory();
        if data_directory.is_absolute() {
            data_directory
        } else {
            self.root.join(data_directory)
        }
    }

    pub fn read_requests(&self) -> Result<Vec<ReadRequest>, PipelineError> {
        self.config
            .read
            .iter()
            .map(|block| parse_read_request(block, self.config.namespace.as_deref()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadRequest {
    DataProduct {
        namespace: String,
        data_product: String,
        component: Option<String>,
        version: Option<String>,
    },
    ExternalObject {
        doi_or_unique_name: String,
        title: Option<String>,
        component: Option<String>,
        version: Option<String>,
    },
}

fn parse_read_request(
    block: &Override,
    default_namespace: Option<&str>,
) -> Result<ReadRequest, PipelineError> {
    // The use block overrides the where block before parsing.
    let mut merged: Metadata = block.where_.clone();
    for (name, value) in &block.use_ {
        merged.insert(name.clone(), value.clone());
    }

    let field = |name: &str| -> Result<Option<String>, PipelineError> {
        match merged.get(name) {
            None => Ok(None),
            Some(value) => value.as_str().map(|text| Some(text.to_string())).ok_or_else(|| {
                PipelineError::ConfigParse(format!("expected a string for '{name}' in read block"))
            }),
        }
    };

    if block.where_.contains_key(key::DOI_OR_UNIQUE_NAME) {
        let doi_or_unique_name = field(key::DOI_OR_UNIQUE_NAME)?.ok_or_else(|| {
            PipelineError::ConfigParse("no doi_or_unique_name specified in read block".to_string())
        })?;
        return Ok(ReadRequest::ExternalObject {
            doi_or_unique_name,
            title: field(key::TITLE)?,
            component: field(key::COMPONENT)?,
            version: field(key::VERSION)?,
        });
    }

    if !block.where_.contains_key(key::DATA_PRODUCT) {
        return Err(PipelineError::ConfigParse(
            "no data_product specified in where clause of read block".to_string(),
        ));
    }
    let data_product = field(key::DATA_PRODUCT)?.ok_or_else(|| {
        PipelineError::ConfigParse("no data_product specified in read block".to_string())
    })?;
    let namespace = field(key::NAMESPACE)?
        .or_else(|| default_namespace.map(str::to_string))
        .ok_or_else(|| {
            PipelineError::ConfigParse(format!(
                "no namespace specified for read block with data_product '{data_product}'"
            ))
        })?;
    let component = field(key::COMPONENT)?;
    let version = field(key::VERSION)?;
    info!(
        "read config for data_product: {data_product}, namespace: {namespace}, \
         component: {component:?}, version: {version:?}"
    );
    Ok(ReadRequest::DataProduct {
        namespace,
        data_product,
        component,
        version,
    })
}
