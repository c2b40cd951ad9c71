use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PipelineError;
use crate::file_api::{AccessLog, AccessType, hash_file};
use crate::metadata::{Metadata, MetadataValue, key, log_format_metadata};
use crate::registry::{
    Query, QueryValue, RegistryClient, UploadDefinition, UploadValue, WriteMethod,
    encode_timestamp, entity_field, field, get_reference, target, unique, upsert,
};
use crate::remote::{RemoteOptions, remote_filesystem_and_path, split_scheme};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub post: Vec<UploadDefinition>,
    #[serde(default)]
    pub patch: Vec<UploadDefinition>,
}

pub fn upload_from_config<R: RegistryClient>(
    client: &R,
    config: &UploadConfig,
) -> Result<(), PipelineError> {
    for definition in &config.patch {
        info!("working on PATCH for target '{}'", definition.target);
        upsert(
            client,
            WriteMethod::Patch,
            &definition.target,
            &definition.data,
            false,
        )?;
    }
    for definition in &config.post {
        info!("working on POST for target '{}'", definition.target);
        upsert(
            client,
            WriteMethod::Post,
            &definition.target,
            &definition.data,
            false,
        )?;
    }
    Ok(())
}

pub fn upload_from_config_file<R: RegistryClient>(
    client: &R,
    config_path: &Utf8Path,
) -> Result<(), PipelineError> {
    let content = fs::read_to_string(config_path)
        .map_err(|_| PipelineError::ConfigRead(config_path.as_std_path().to_path_buf()))?;
    let config: UploadConfig =
        serde_yaml::from_str(&content).map_err(|err| PipelineError::ConfigParse(err.to_string()))?;
    upload_from_config(client, &config)
}

// Uploads a local file to the remote storage root and returns the path the
// registry should record, relative to that root. The remote name carries the
// content hash before the extension.
pub fn upload_to_storage(
    remote_uri: &str,
    options: &RemoteOptions,
    data_directory: &Utf8Path,
    filename: &Utf8Path,
    upload_path: Option<&str>,
    path_prefix: Option<&str>,
) -> Result<String, PipelineError> {
    let (protocol, _) = split_scheme(remote_uri);
    let relative = match upload_path {
        Some(path) => Utf8PathBuf::from(path),
        None => filename
            .strip_prefix(data_directory)
            .map(Utf8Path::to_path_buf)
            .map_err(|_| {
                PipelineError::Filesystem(format!("{filename} is not under {data_directory}"))
            })?,
    };
    let upload_path = match path_prefix {
        Some(prefix) => format!("{prefix}/{relative}"),
        None => relative.to_string(),
    };
    let (mut filesystem, path) =
        remote_filesystem_and_path(protocol, remote_uri, &upload_path, options)?;
    if matches!(protocol, "file" | "ssh" | "sftp") {
        if let Some(parent) = Path::new(&path).parent() {
            filesystem.makedirs(&parent.to_string_lossy())?;
        }
    }
    let hash = hash_file(filename.as_std_path())?;
    let path = insert_hash_suffix(&path, &hash);
    info!("uploading {filename} to {path} on {remote_uri}");
    filesystem.put(filename.as_std_path(), &path)?;

    if let Some(stripped) = path.strip_prefix(remote_uri) {
        return Ok(stripped.trim_start_matches('/').to_string());
    }
    if let Ok(url) = Url::parse(remote_uri) {
        let root_path = url.path();
        if !root_path.is_empty() {
            if let Some(stripped) = path.strip_prefix(root_path) {
                return Ok(stripped.trim_start_matches('/').to_string());
            }
        }
    }
    Ok(path)
}

fn insert_hash_suffix(path: &str, hash: &str) -> String {
    let (directory, name) = match path.rfind('/') {
        Some(index) => (&path[..=index], &path[index + 1..]),
        None => ("", path),
    };
    match name.rfind('.') {
        Some(dot) => format!("{directory}{}_{hash}{}", &name[..dot], &name[dot..]),
        None => format!("{directory}{name}_{hash}"),
    }
}

// Pushes an access log back to the registry as a new run: reads resolve to
// existing component references, writes are uploaded and registered.
pub fn push_run<R: RegistryClient>(
    client: &R,
    access_log_path: &Utf8Path,
    remote_uri: &str,
    remote_options: &RemoteOptions,
    accessibility: &str,
) -> Result<(), PipelineError> {
    let content = fs::read_to_string(access_log_path)
        .map_err(|_| PipelineError::ConfigRead(access_log_path.as_std_path().to_path_buf()))?;
    let log: AccessLog =
        serde_yaml::from_str(&content).map_err(|err| PipelineError::ConfigParse(err.to_string()))?;

    let run_id = log
        .run_metadata
        .get("run_id")
        .and_then(serde_yaml::Value::as_str)
        .ok_or_else(|| PipelineError::ConfigParse("access log has no run_id".to_string()))?
        .to_string();
    let data_directory = log
        .run_metadata
        .get("data_directory")
        .and_then(serde_yaml::Value::as_str)
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| Utf8PathBuf::from("."));
    let data_directory = if data_directory.is_absolute() {
        data_directory
    } else {
        access_log_path
            .parent()
            .map(|parent| parent.join(&data_directory))
            .unwrap_or(data_directory)
    };
    let default_namespace = log
        .config
        .get("namespace")
        .and_then(serde_yaml::Value::as_str)
        .map(str::to_string);

    let storage_root_def = UploadDefinition {
        target: target::STORAGE_ROOT.to_string(),
        data: BTreeMap::from([
            (
                field::ROOT.to_string(),
                UploadValue::Scalar(remote_uri.to_string()),
            ),
            (
                field::ACCESSIBILITY.to_string(),
                UploadValue::Scalar(accessibility.to_string()),
            ),
        ]),
    };
    upsert(
        client,
        WriteMethod::Post,
        target::STORAGE_ROOT,
        &storage_root_def.data,
        false,
    )?;

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut posts: Vec<UploadDefinition> = Vec::new();

    for access in &log.io {
        match access.access_type {
            AccessType::Read => {
                inputs.push(input_reference(client, &access.access_metadata)?);
            }
            AccessType::Write => {
                let metadata = &access.access_metadata;
                let filename = required(metadata, key::FILENAME)?;
                let local_file = data_directory.join(&filename);
                let recorded_hash = required(metadata, key::CALCULATED_HASH)?;
                let calculated = hash_file(local_file.as_std_path())?;
                if calculated != recorded_hash {
                    return Err(PipelineError::HashMismatch {
                        calculated,
                        verified: recorded_hash,
                    });
                }

                let namespace_name = metadata
                    .get(key::NAMESPACE)
                    .and_then(MetadataValue::as_str)
                    .map(str::to_string)
                    .or_else(|| default_namespace.clone())
                    .ok_or_else(|| {
                        PipelineError::Lookup(format!(
                            "no namespace for write record {}",
                            log_format_metadata(metadata)
                        ))
                    })?;
                let data_product_name = required(metadata, key::DATA_PRODUCT)?;
                let component_name = metadata
                    .get(key::COMPONENT)
                    .and_then(MetadataValue::as_str)
                    .unwrap_or(&data_product_name)
                    .to_string();
                let version = metadata
                    .get(key::VERSION)
                    .and_then(MetadataValue::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("0.1.0+{run_id}"));

                let remote_path = upload_to_storage(
                    remote_uri,
                    remote_options,
                    &data_directory,
                    &local_file,
                    None,
                    Some(&namespace_name),
                )?;

                let namespace_def = UploadDefinition {
                    target: target::NAMESPACE.to_string(),
                    data: BTreeMap::from([(
                        field::NAME.to_string(),
                        UploadValue::Scalar(namespace_name),
                    )]),
                };
                let storage_location_def = UploadDefinition {
                    target: target::STORAGE_LOCATION.to_string(),
                    data: BTreeMap::from([
                        (field::PATH.to_string(), UploadValue::Scalar(remote_path)),
                        (
                            field::HASH.to_string(),
                            UploadValue::Scalar(recorded_hash.clone()),
                        ),
                        (
                            field::STORAGE_ROOT.to_string(),
                            UploadValue::Nested(storage_root_def.clone()),
                        ),
                    ]),
                };
                let object_def = UploadDefinition {
                    target: target::OBJECT.to_string(),
                    data: BTreeMap::from([(
                        field::STORAGE_LOCATION.to_string(),
                        UploadValue::Nested(storage_location_def.clone()),
                    )]),
                };
                let component_def = UploadDefinition {
                    target: target::OBJECT_COMPONENT.to_string(),
                    data: BTreeMap::from([
                        (
                            field::OBJECT.to_string(),
                            UploadValue::Nested(object_def.clone()),
                        ),
                        (
                            field::NAME.to_string(),
                            UploadValue::Scalar(component_name),
                        ),
                    ]),
                };
                let data_product_def = UploadDefinition {
                    target: target::DATA_PRODUCT.to_string(),
                    data: BTreeMap::from([
                        (
                            field::NAME.to_string(),
                            UploadValue::Scalar(data_product_name),
                        ),
                        (field::VERSION.to_string(), UploadValue::Scalar(version)),
                        (
                            field::NAMESPACE.to_string(),
                            UploadValue::Nested(namespace_def.clone()),
                        ),
                        (
                            field::OBJECT.to_string(),
                            UploadValue::Nested(object_def.clone()),
                        ),
                    ]),
                };

                posts.extend([
                    namespace_def,
                    storage_location_def,
                    object_def,
                    component_def.clone(),
                    data_product_def,
                ]);
                outputs.push(UploadValue::Nested(component_def));
            }
        }
    }

    let posts = unique(posts);
    for definition in &posts {
        upsert(
            client,
            WriteMethod::Post,
            &definition.target,
            &definition.data,
            false,
        )?;
    }

    let run_data = BTreeMap::from([
        (
            field::RUN_DATE.to_string(),
            UploadValue::Scalar(encode_timestamp(&Utc::now())),
        ),
        (
            field::DESCRIPTION.to_string(),
            UploadValue::Scalar(run_id.clone()),
        ),
        (
            field::INPUTS.to_string(),
            UploadValue::List(inputs.into_iter().map(UploadValue::Scalar).collect()),
        ),
        (field::OUTPUTS.to_string(), UploadValue::List(outputs)),
    ]);
    info!("posting run {run_id}");
    upsert(client, WriteMethod::Post, target::CODE_RUN, &run_data, false)
}

fn required(metadata: &Metadata, name: &str) -> Result<String, PipelineError> {
    metadata
        .get(name)
        .and_then(MetadataValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            PipelineError::Lookup(format!(
                "could not find {name} in {}",
                log_format_metadata(metadata)
            ))
        })
}

// Resolves a read record to the registry reference of its object component.
fn input_reference<R: RegistryClient>(
    client: &R,
    metadata: &Metadata,
) -> Result<String, PipelineError> {
    let object_url = if metadata.contains_key(key::DOI_OR_UNIQUE_NAME) {
        let doi = required(metadata, key::DOI_OR_UNIQUE_NAME)?;
        let mut query = Query::from([(
            field::DOI_OR_UNIQUE_NAME.to_string(),
            QueryValue::from(doi.as_str()),
        )]);
        if let Some(version) = metadata.get(key::VERSION).and_then(MetadataValue::as_str) {
            query.insert(field::VERSION.to_string(), QueryValue::from(version));
        }
        let external_object = client
            .get_exact(target::EXTERNAL_OBJECT, &query)?
            .ok_or_else(|| {
                PipelineError::Lookup(format!(
                    "no external object on the registry for {}",
                    log_format_metadata(metadata)
                ))
            })?;
        entity_field(&external_object, field::OBJECT)?.to_string()
    } else {
        let namespace_name = required(metadata, key::NAMESPACE)?;
        let namespace_url = get_reference(
            client,
            target::NAMESPACE,
            &Query::from([(
                field::NAME.to_string(),
                QueryValue::from(namespace_name.as_str()),
            )]),
        )?
        .ok_or_else(|| {
            PipelineError::Lookup(format!("no namespace '{namespace_name}' on the registry"))
        })?;

        let data_product_name = required(metadata, key::DATA_PRODUCT)?;
        let mut query = Query::from([
            (
                field::NAME.to_string(),
                QueryValue::from(data_product_name.as_str()),
            ),
            (
                field::NAMESPACE.to_string(),
                QueryValue::from(namespace_url.as_str()),
            ),
        ]);
        if let Some(version) = metadata.get(key::VERSION).and_then(MetadataValue::as_str) {
            query.insert(field::VERSION.to_string(), QueryValue::from(version));
        }
        let data_product = client.get_exact(target::DATA_PRODUCT, &query)?.ok_or_else(|| {
            PipelineError::Lookup(format!(
                "no data product on the registry for {}",
                log_format_metadata(metadata)
            ))
        })?;
        entity_field(&data_product, field::OBJECT)?.to_string()
    };

    let component_name = metadata
        .get(key::COMPONENT)
        .and_then(MetadataValue::as_str)
        .map(str::to_string)
        .or_else(|| {
            metadata
                .get(key::DATA_PRODUCT)
                .and_then(MetadataValue::as_str)
                .map(str::to_string)
        })
        .ok_or_else(|| {
            PipelineError::Lookup(format!(
                "no component name for read record {}",
                log_format_metadata(metadata)
            ))
        })?;
    let query = Query::from([
        (
            field::OBJECT.to_string(),
            QueryValue::from(object_url.as_str()),
        ),
        (
            field::NAME.to_string(),
            QueryValue::from(component_name.as_str()),
        ),
    ]);
    get_reference(client, target::OBJECT_COMPONENT, &query)?.ok_or_else(|| {
        PipelineError::Lookup(format!(
            "no object component on the registry for {}",
            log_format_metadata(metadata)
        ))
    })
}
