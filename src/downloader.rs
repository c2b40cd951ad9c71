use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use semver::Version;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ReadRequest;
use crate::error::PipelineError;
use crate::metadata::{Metadata, MetadataValue, glob_matches, key};
use crate::registry::{
    Entity, Query, QueryValue, RegistryClient, entity_field, field, target, unique,
};
use crate::remote::{RemoteOptions, remote_filesystem_and_path, split_scheme};

pub const METADATA_FILENAME: &str = "metadata.yaml";

// One pending or resolved data product request; registry entities are filled
// in stage by stage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataProductBlock {
    pub namespace_name: String,
    pub data_product_name: String,
    pub requested_component: Option<String>,
    pub requested_version: Option<String>,
    pub namespace: Option<Entity>,
    pub data_product: Option<Entity>,
    pub object: Option<Entity>,
    pub storage_location: Option<Entity>,
    pub storage_root: Option<Entity>,
    pub component: Option<Entity>,
    pub output_filename: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExternalObjectBlock {
    pub doi_or_unique_name: String,
    pub title: Option<String>,
    pub requested_component: Option<String>,
    pub requested_version: Option<String>,
    pub external_object: Option<Entity>,
    pub object: Option<Entity>,
    pub storage_location: Option<Entity>,
    pub storage_root: Option<Entity>,
    pub component: Option<Entity>,
    pub output_filename: Option<Utf8PathBuf>,
}

type GroupKey = (String, Option<String>, Option<String>);

// Stage contract shared by both request kinds: the object, storage and
// component stages only need these accessors.
trait ResolutionBlock {
    fn requested_component(&self) -> Option<&str>;
    fn object_reference(&self) -> Result<String, PipelineError>;
    fn object(&self) -> Result<&Entity, PipelineError>;
    fn set_object(&mut self, object: Entity);
    fn storage_location(&self) -> Result<&Entity, PipelineError>;
    fn set_storage_location(&mut self, storage_location: Entity);
    fn storage_root(&self) -> Result<&Entity, PipelineError>;
    fn set_storage_root(&mut self, storage_root: Entity);
    fn set_component(&mut self, component: Entity);
    fn set_output_filename(&mut self, output_filename: Utf8PathBuf);
    fn output_name_parts(&self) -> Result<Vec<String>, PipelineError>;
    fn group_key(&self) -> Result<GroupKey, PipelineError>;
    fn source_version(&self) -> Result<Version, PipelineError>;
}

fn resolved_entity<'a>(entity: &'a Option<Entity>, what: &str) -> Result<&'a Entity, PipelineError> {
    entity
        .as_ref()
        .ok_or_else(|| PipelineError::RegistryData(format!("block has no resolved {what}")))
}

fn parse_version(text: &str) -> Result<Version, PipelineError> {
    Version::parse(text).map_err(|_| PipelineError::VersionFormat(text.to_string()))
}

impl ResolutionBlock for DataProductBlock {
    fn requested_component(&self) -> Option<&str> {
        self.requested_component.as_deref()
    }

    fn object_reference(&self) -> Result<String, PipelineError> {
        let data_product = resolved_entity(&self.data_product, "data product")?;
        Ok(entity_field(data_product, field::OBJECT)?.to_string())
    }

    fn object(&self) -> Result<&Entity, PipelineError> {
        resolved_entity(&self.object, "object")
    }

    fn set_object(&mut self, object: Entity) {
        self.object = Some(object);
    }

    fn storage_location(&self) -> Result<&Entity, PipelineError> {
        resolved_entity(&self.storage_location, "storage location")
    }

    fn set_storage_location(&mut self, storage_location: Entity) {
        self.storage_location = Some(storage_location);
    }

    fn storage_root(&self) -> Result<&Entity, PipelineError> {
        resolved_entity(&self.storage_root, "storage root")
    }

    fn set_storage_root(&mut self, storage_root: Entity) {
        self.storage_root = Some(storage_root);
    }

    fn set_component(&mut self, component: Entity) {
        self.component = Some(component);
    }

    fn set_output_filename(&mut self, output_filename: Utf8PathBuf) {
        self.output_filename = Some(output_filename);
    }

    fn output_name_parts(&self) -> Result<Vec<String>, PipelineError> {
        let data_product = resolved_entity(&self.data_product, "data product")?;
        Ok(vec![
            entity_field(data_product, field::NAME)?.to_string(),
            entity_field(data_product, field::VERSION)?.to_string(),
        ])
    }

    fn group_key(&self) -> Result<GroupKey, PipelineError> {
        let namespace = resolved_entity(&self.namespace, "namespace")?;
        let data_product = resolved_entity(&self.data_product, "data product")?;
        Ok((
            entity_field(namespace, field::NAME)?.to_string(),
            Some(entity_field(data_product, field::NAME)?.to_string()),
            self.requested_component.clone(),
        ))
    }

    fn source_version(&self) -> Result<Version, PipelineError> {
        let data_product = resolved_entity(&self.data_product, "data product")?;
        parse_version(entity_field(data_product, field::VERSION)?)
    }
}

impl ResolutionBlock for ExternalObjectBlock {
    fn requested_component(&self) -> Option<&str> {
        self.requested_component.as_deref()
    }

    fn object_reference(&self) -> Result<String, PipelineError> {
        let external_object = resolved_entity(&self.external_object, "external object")?;
        Ok(entity_field(external_object, field::OBJECT)?.to_string())
    }

    fn object(&self) -> Result<&Entity, PipelineError> {
        resolved_entity(&self.object, "object")
    }

    fn set_object(&mut self, object: Entity) {
        self.object = Some(object);
    }

    fn storage_location(&self) -> Result<&Entity, PipelineError> {
        resolved_entity(&self.storage_location, "storage location")
    }

    fn set_storage_location(&mut self, storage_location: Entity) {
        self.storage_location = Some(storage_location);
    }

    fn storage_root(&self) -> Result<&Entity, PipelineError> {
        resolved_entity(&self.storage_root, "storage root")
    }

    fn set_storage_root(&mut self, storage_root: Entity) {
        self.storage_root = Some(storage_root);
    }

    fn set_component(&mut self, component: Entity) {
        self.component = Some(component);
    }

    fn set_output_filename(&mut self, output_filename: Utf8PathBuf) {
        self.output_filename = Some(output_filename);
    }

    fn output_name_parts(&self) -> Result<Vec<String>, PipelineError> {
        let external_object = resolved_entity(&self.external_object, "external object")?;
        let mut parts = vec![entity_field(external_object, field::DOI_OR_UNIQUE_NAME)?.to_string()];
        if let Some(title) = external_object.get(field::TITLE).and_then(Value::as_str) {
            parts.push(title.to_string());
        }
        parts.push(entity_field(external_object, field::VERSION)?.to_string());
        Ok(parts)
    }

    fn group_key(&self) -> Result<GroupKey, PipelineError> {
        let external_object = resolved_entity(&self.external_object, "external object")?;
        Ok((
            entity_field(external_object, field::DOI_OR_UNIQUE_NAME)?.to_string(),
            external_object
                .get(field::TITLE)
                .and_then(Value::as_str)
                .map(str::to_string),
            self.requested_component.clone(),
        ))
    }

    fn source_version(&self) -> Result<Version, PipelineError> {
        let external_object = resolved_entity(&self.external_object, "external object")?;
        parse_version(entity_field(external_object, field::VERSION)?)
    }
}

// Resolves registered data product and external object references against the
// registry and downloads the public storage they point at.
pub struct Downloader<R: RegistryClient> {
    registry: R,
    data_directory: Utf8PathBuf,
    remote_options: RemoteOptions,
    pending_data_products: Vec<DataProductBlock>,
    pending_external_objects: Vec<ExternalObjectBlock>,
    resolved_data_products: Vec<DataProductBlock>,
    resolved_external_objects: Vec<ExternalObjectBlock>,
}

impl<R: RegistryClient> Downloader<R> {
    pub fn new(registry: R, data_directory: impl Into<Utf8PathBuf>, remote_options: RemoteOptions) -> Self {
        Self {
            registry,
            data_directory: data_directory.into(),
            remote_options,
            pending_data_products: Vec::new(),
            pending_external_objects: Vec::new(),
            resolved_data_products: Vec::new(),
            resolved_external_objects: Vec::new(),
        }
    }

    pub fn add_data_product(
        &mut self,
        namespace: &str,
        data_product: &str,
        component: Option<&str>,
        version: Option<&str>,
    ) {
        self.pending_data_products.push(DataProductBlock {
            namespace_name: namespace.to_string(),
            data_product_name: data_product.to_string(),
            requested_component: component.map(str::to_string),
            requested_version: version.map(str::to_string),
            ..DataProductBlock::default()
        });
    }

    pub fn add_external_object(
        &mut self,
        doi_or_unique_name: &str,
        title: Option<&str>,
        component: Option<&str>,
        version: Option<&str>,
    ) {
        self.pending_external_objects.push(ExternalObjectBlock {
            doi_or_unique_name: doi_or_unique_name.to_string(),
            title: title.map(str::to_string),
            requested_component: component.map(str::to_string),
            requested_version: version.map(str::to_string),
            ..ExternalObjectBlock::default()
        });
    }

    pub fn add_request(&mut self, request: ReadRequest) {
        match request {
            ReadRequest::DataProduct {
                namespace,
                data_product,
                component,
                version,
            } => self.add_data_product(
                &namespace,
                &data_product,
                component.as_deref(),
                version.as_deref(),
            ),
            ReadRequest::ExternalObject {
                doi_or_unique_name,
                title,
                component,
                version,
            } => self.add_external_object(
                &doi_or_unique_name,
                title.as_deref(),
                component.as_deref(),
                version.as_deref(),
            ),
        }
    }

    fn resolve_namespaces(
        &self,
        blocks: Vec<DataProductBlock>,
    ) -> Result<Vec<DataProductBlock>, PipelineError> {
        let mut resolved = Vec::new();
        for block in blocks {
            let query = Query::from([(
                field::NAME.to_string(),
                QueryValue::from(block.namespace_name.as_str()),
            )]);
            for namespace in self.registry.get_filtered(target::NAMESPACE, &query)? {
                let mut next = block.clone();
                next.namespace = Some(namespace);
                resolved.push(next);
            }
        }
        Ok(resolved)
    }

    fn resolve_data_products(
        &self,
        blocks: Vec<DataProductBlock>,
    ) -> Result<Vec<DataProductBlock>, PipelineError> {
        let mut resolved = Vec::new();
        for block in blocks {
            let namespace = resolved_entity(&block.namespace, "namespace")?;
            let mut query = Query::from([
                (
                    field::NAME.to_string(),
                    QueryValue::from(block.data_product_name.as_str()),
                ),
                (
                    field::NAMESPACE.to_string(),
                    QueryValue::from(entity_field(namespace, field::URL)?),
                ),
            ]);
            if let Some(version) = &block.requested_version {
                query.insert(field::VERSION.to_string(), QueryValue::from(version.as_str()));
            }
            let mut data_products = self.registry.get_filtered(target::DATA_PRODUCT, &query)?;
            if data_products.is_empty() {
                continue;
            }
            sort_by_semver_desc(&mut data_products, field::VERSION)?;
            if block.requested_component.is_none() {
                // A glob product name can match several products; keep only the
                // newest version of each.
                let mut seen = BTreeSet::new();
                data_products.retain(|data_product| {
                    data_product
                        .get(field::NAME)
                        .and_then(Value::as_str)
                        .map(|name| seen.insert(name.to_string()))
                        .unwrap_or(false)
                });
            }
            for data_product in data_products {
                let mut next = block.clone();
                next.data_product = Some(data_product);
                resolved.push(next);
            }
        }
        Ok(resolved)
    }

    fn resolve_external_objects(
        &self,
        blocks: Vec<ExternalObjectBlock>,
    ) -> Result<Vec<ExternalObjectBlock>, PipelineError> {
        let mut resolved = Vec::new();
        for block in blocks {
            let mut query = Query::from([(
                field::DOI_OR_UNIQUE_NAME.to_string(),
                QueryValue::from(block.doi_or_unique_name.as_str()),
            )]);
            if let Some(title) = &block.title {
                query.insert(field::TITLE.to_string(), QueryValue::from(title.as_str()));
            }
            if let Some(version) = &block.requested_version {
                query.insert(field::VERSION.to_string(), QueryValue::from(version.as_str()));
            }
            let mut external_objects =
                self.registry.get_filtered(target::EXTERNAL_OBJECT, &query)?;
            if external_objects.is_empty() {
                continue;
            }
            sort_by_semver_desc(&mut external_objects, field::VERSION)?;
            if block.requested_component.is_none() {
                let mut seen = BTreeSet::new();
                external_objects.retain(|external_object| {
                    let name = external_object
                        .get(field::DOI_OR_UNIQUE_NAME)
                        .and_then(Value::as_str);
                    let title = external_object.get(field::TITLE).and_then(Value::as_str);
                    match name {
                        Some(name) => {
                            seen.insert((name.to_string(), title.map(str::to_string)))
                        }
                        None => false,
                    }
                });
            }
            for external_object in external_objects {
                let mut next = block.clone();
                next.external_object = Some(external_object);
                resolved.push(next);
            }
        }
        Ok(resolved)
    }

    fn resolve_objects<B: ResolutionBlock>(&self, blocks: Vec<B>) -> Result<Vec<B>, PipelineError> {
        let mut resolved = Vec::new();
        for mut block in blocks {
            let object_reference = block.object_reference()?;
            let object = if let Some(component) = block.requested_component() {
                // Only resolve objects that carry the requested component.
                let query = Query::from([
                    (field::NAME.to_string(), QueryValue::from(component)),
                    (
                        field::OBJECT.to_string(),
                        QueryValue::from(object_reference.as_str()),
                    ),
                ]);
                let components = self.registry.get_filtered(target::OBJECT_COMPONENT, &query)?;
                if components.is_empty() {
                    None
                } else {
                    Some(self.registry.get_url(&object_reference)?)
                }
            } else {
                let object = self.registry.get_url(&object_reference)?;
                let has_components = object
                    .get(field::COMPONENTS)
                    .and_then(Value::as_array)
                    .map(|components| !components.is_empty())
                    .unwrap_or(false);
                has_components.then_some(object)
            };
            if let Some(object) = object {
                block.set_object(object);
                resolved.push(block);
            }
        }
        Ok(resolved)
    }

    fn resolve_storage_locations<B: ResolutionBlock>(
        &self,
        blocks: Vec<B>,
    ) -> Result<Vec<B>, PipelineError> {
        let mut resolved = Vec::new();
        for mut block in blocks {
            let reference = entity_field(block.object()?, field::STORAGE_LOCATION)?.to_string();
            let storage_location = self.registry.get_url(&reference)?;
            let remote_path = entity_field(&storage_location, field::PATH)?;
            let basename = remote_path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(remote_path);
            let mut output = Utf8PathBuf::new();
            for part in block.output_name_parts()? {
                output.push(part);
            }
            output.push(basename);
            block.set_storage_location(storage_location);
            block.set_output_filename(output);
            resolved.push(block);
        }
        Ok(resolved)
    }

    fn resolve_storage_roots<B: ResolutionBlock>(
        &self,
        blocks: Vec<B>,
    ) -> Result<Vec<B>, PipelineError> {
        let mut resolved = Vec::new();
        for mut block in blocks {
            let reference =
                entity_field(block.storage_location()?, field::STORAGE_ROOT)?.to_string();
            block.set_storage_root(self.registry.get_url(&reference)?);
            resolved.push(block);
        }
        Ok(resolved)
    }

    fn resolve_components<B: ResolutionBlock + Clone>(
        &self,
        blocks: Vec<B>,
    ) -> Result<Vec<B>, PipelineError> {
        // Keep only the highest version per (source, requested component) group.
        let mut groups: Vec<(GroupKey, Vec<B>)> = Vec::new();
        for block in blocks {
            let group_key = block.group_key()?;
            match groups.iter_mut().find(|(existing, _)| *existing == group_key) {
                Some((_, members)) => members.push(block),
                None => groups.push((group_key, vec![block])),
            }
        }
        let mut versioned = Vec::new();
        for (_, mut members) in groups {
            let mut best_index = 0;
            let mut best_version = members[0].source_version()?;
            for (index, member) in members.iter().enumerate().skip(1) {
                let version = member.source_version()?;
                if version > best_version {
                    best_version = version;
                    best_index = index;
                }
            }
            versioned.push(members.swap_remove(best_index));
        }

        let mut resolved = Vec::new();
        for block in versioned {
            let component_references: Vec<String> = block
                .object()?
                .get(field::COMPONENTS)
                .and_then(Value::as_array)
                .map(|references| {
                    references
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            for reference in component_references {
                let component = self.registry.get_url(&reference)?;
                let name = entity_field(&component, field::NAME)?;
                let keep = match block.requested_component() {
                    None => true,
                    Some(pattern) => glob_matches(name, pattern),
                };
                if keep {
                    let mut next = block.clone();
                    next.set_component(component);
                    resolved.push(next);
                }
            }
        }
        Ok(resolved)
    }

    fn data_product_pipe(
        &self,
        blocks: Vec<DataProductBlock>,
    ) -> Result<Vec<DataProductBlock>, PipelineError> {
        let blocks = self.resolve_namespaces(blocks)?;
        let blocks = self.resolve_data_products(blocks)?;
        let blocks = self.resolve_objects(blocks)?;
        let blocks = self.resolve_storage_locations(blocks)?;
        let blocks = self.resolve_storage_roots(blocks)?;
        let blocks = self.resolve_components(blocks)?;
        Ok(unique(blocks))
    }

    fn external_object_pipe(
        &self,
        blocks: Vec<ExternalObjectBlock>,
    ) -> Result<Vec<ExternalObjectBlock>, PipelineError> {
        let blocks = self.resolve_external_objects(blocks)?;
        let blocks = self.resolve_objects(blocks)?;
        let blocks = self.resolve_storage_locations(blocks)?;
        let blocks = self.resolve_storage_roots(blocks)?;
        let blocks = self.resolve_components(blocks)?;
        Ok(unique(blocks))
    }

    // Blocks are processed one at a time; a block that fails to resolve goes
    // back to the head of the queue and the error propagates.
    pub fn resolve(&mut self) -> Result<(), PipelineError> {
        info!(
            "resolving {} data product reference(s)",
            self.pending_data_products.len()
        );
        while let Some(block) = self.pending_data_products.pop() {
            match self.data_product_pipe(vec![block.clone()]) {
                Ok(blocks) if !blocks.is_empty() => self.resolved_data_products.extend(blocks),
                Ok(_) => {
                    let message = format!(
                        "data product '{}' in namespace '{}' could not be resolved",
                        block.data_product_name, block.namespace_name
                    );
                    self.pending_data_products.insert(0, block);
                    return Err(PipelineError::Lookup(message));
                }
                Err(err) => {
                    self.pending_data_products.insert(0, block);
                    return Err(err);
                }
            }
        }

        info!(
            "resolving {} external object reference(s)",
            self.pending_external_objects.len()
        );
        while let Some(block) = self.pending_external_objects.pop() {
            match self.external_object_pipe(vec![block.clone()]) {
                Ok(blocks) if !blocks.is_empty() => self.resolved_external_objects.extend(blocks),
                Ok(_) => {
                    let message = format!(
                        "external object '{}' could not be resolved",
                        block.doi_or_unique_name
                    );
                    self.pending_external_objects.insert(0, block);
                    return Err(PipelineError::Lookup(message));
                }
                Err(err) => {
                    self.pending_external_objects.insert(0, block);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn resolved_data_products(&self) -> &[DataProductBlock] {
        &self.resolved_data_products
    }

    pub fn resolved_external_objects(&self) -> &[ExternalObjectBlock] {
        &self.resolved_external_objects
    }

    pub fn pending_data_products(&self) -> &[DataProductBlock] {
        &self.pending_data_products
    }

    pub fn write_metadata(&self) -> Result<(), PipelineError> {
        info!("writing metadata");
        fs::create_dir_all(self.data_directory.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let mut records = Vec::new();
        for block in &self.resolved_data_products {
            records.push(data_product_record(block)?);
        }
        for block in &self.resolved_external_objects {
            records.push(external_object_record(block)?);
        }
        let content = serde_yaml::to_string(&records)
            .map_err(|err| PipelineError::Catalog(err.to_string()))?;
        let path = self.data_directory.join(METADATA_FILENAME);
        let tmp_path = path.with_extension("yaml.tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn fetch_files(&mut self) -> Result<(), PipelineError> {
        let mut fetch_targets = Vec::new();
        for block in &self.resolved_data_products {
            fetch_targets.push(fetch_target(block)?);
        }
        for block in &self.resolved_external_objects {
            fetch_targets.push(fetch_target(block)?);
        }

        let mut downloaded_hashes = BTreeSet::new();
        for target in fetch_targets {
            if downloaded_hashes.contains(&target.hash) {
                debug!(
                    "storage location with hash {} has already been downloaded, skipping",
                    target.hash
                );
            } else if target.public {
                let output = self.data_directory.join(&target.output_filename);
                if let Some(parent) = output.parent() {
                    fs::create_dir_all(parent.as_std_path())
                        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                }
                info!(
                    "downloading public data from uri: {}, path: {} to {output}",
                    target.root, target.path
                );
                let (protocol, _) = split_scheme(&target.root);
                let (mut filesystem, resolved_path) = remote_filesystem_and_path(
                    protocol,
                    &target.root,
                    &target.path,
                    &self.remote_options,
                )?;
                filesystem.get(&resolved_path, output.as_std_path())?;
            } else {
                info!("data is not public, skipping download");
            }
            downloaded_hashes.insert(target.hash);
        }
        Ok(())
    }

    pub fn download(&mut self, write_metadata: bool) -> Result<(), PipelineError> {
        info!("starting download");
        self.resolve()?;
        fs::create_dir_all(self.data_directory.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        if write_metadata {
            self.write_metadata()?;
        } else {
            info!("not writing metadata");
        }
        self.fetch_files()?;
        info!("completed download");
        Ok(())
    }
}

struct FetchTarget {
    hash: String,
    public: bool,
    root: String,
    path: String,
    output_filename: Utf8PathBuf,
}

fn fetch_target<B: ResolutionBlock>(block: &B) -> Result<FetchTarget, PipelineError> {
    let storage_location = block.storage_location()?;
    let storage_root = block.storage_root()?;
    Ok(FetchTarget {
        hash: entity_field(storage_location, field::HASH)?.to_string(),
        public: is_public(storage_root.get(field::ACCESSIBILITY)),
        root: entity_field(storage_root, field::ROOT)?.to_string(),
        path: entity_field(storage_location, field::PATH)?.to_string(),
        output_filename: block_output_filename(block)?,
    })
}

fn block_output_filename<B: ResolutionBlock>(block: &B) -> Result<Utf8PathBuf, PipelineError> {
    // Recompute from resolved entities; set during the storage location stage.
    let storage_location = block.storage_location()?;
    let remote_path = entity_field(storage_location, field::PATH)?;
    let basename = remote_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(remote_path);
    let mut output = Utf8PathBuf::new();
    for part in block.output_name_parts()? {
        output.push(part);
    }
    output.push(basename);
    Ok(output)
}

fn is_public(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Number(number)) => number.as_i64() == Some(0),
        Some(Value::String(text)) => text == "public" || text == "0",
        _ => false,
    }
}

fn json_to_metadata_value(value: &Value) -> Option<MetadataValue> {
    match value {
        Value::String(text) => Some(MetadataValue::String(text.clone())),
        Value::Number(number) => number.as_i64().map(MetadataValue::Integer),
        Value::Bool(flag) => Some(MetadataValue::Bool(*flag)),
        _ => None,
    }
}

fn extension_of(output_filename: &Utf8Path) -> String {
    output_filename.extension().unwrap_or_default().to_string()
}

fn data_product_record(block: &DataProductBlock) -> Result<Metadata, PipelineError> {
    let namespace = resolved_entity(&block.namespace, "namespace")?;
    let data_product = resolved_entity(&block.data_product, "data product")?;
    let storage_location = resolved_entity(&block.storage_location, "storage location")?;
    let storage_root = resolved_entity(&block.storage_root, "storage root")?;
    let component = resolved_entity(&block.component, "component")?;
    let output_filename = block
        .output_filename
        .as_ref()
        .ok_or_else(|| PipelineError::RegistryData("block has no output filename".to_string()))?;

    let mut record = Metadata::new();
    record.insert(
        key::DATA_PRODUCT.to_string(),
        entity_field(data_product, field::NAME)?.into(),
    );
    record.insert(
        key::NAMESPACE.to_string(),
        entity_field(namespace, field::NAME)?.into(),
    );
    if let Some(accessibility) = storage_root
        .get(field::ACCESSIBILITY)
        .and_then(json_to_metadata_value)
    {
        record.insert(key::ACCESSIBILITY.to_string(), accessibility);
    }
    record.insert(
        key::VERSION.to_string(),
        entity_field(data_product, field::VERSION)?.into(),
    );
    record.insert(
        key::VERIFIED_HASH.to_string(),
        entity_field(storage_location, field::HASH)?.into(),
    );
    record.insert(
        key::EXTENSION.to_string(),
        MetadataValue::String(extension_of(output_filename)),
    );
    record.insert(
        key::FILENAME.to_string(),
        MetadataValue::String(output_filename.to_string()),
    );
    record.insert(
        key::COMPONENT.to_string(),
        entity_field(component, field::NAME)?.into(),
    );
    Ok(record)
}

fn external_object_record(block: &ExternalObjectBlock) -> Result<Metadata, PipelineError> {
    let external_object = resolved_entity(&block.external_object, "external object")?;
    let storage_location = resolved_entity(&block.storage_location, "storage location")?;
    let storage_root = resolved_entity(&block.storage_root, "storage root")?;
    let component = resolved_entity(&block.component, "component")?;
    let output_filename = block
        .output_filename
        .as_ref()
        .ok_or_else(|| PipelineError::RegistryData("block has no output filename".to_string()))?;

    let mut record = Metadata::new();
    record.insert(
        key::DOI_OR_UNIQUE_NAME.to_string(),
        entity_field(external_object, field::DOI_OR_UNIQUE_NAME)?.into(),
    );
    if let Some(title) = external_object.get(field::TITLE).and_then(Value::as_str) {
        record.insert(key::TITLE.to_string(), title.into());
    }
    if let Some(accessibility) = storage_root
        .get(field::ACCESSIBILITY)
        .and_then(json_to_metadata_value)
    {
        record.insert(key::ACCESSIBILITY.to_string(), accessibility);
    }
    record.insert(
        key::VERSION.to_string(),
        entity_field(external_object, field::VERSION)?.into(),
    );
    record.insert(
        key::VERIFIED_HASH.to_string(),
        entity_field(storage_location, field::HASH)?.into(),
    );
    record.insert(
        key::EXTENSION.to_string(),
        MetadataValue::String(extension_of(output_filename)),
    );
    record.insert(
        key::FILENAME.to_string(),
        MetadataValue::String(output_filename.to_string()),
    );
    record.insert(
        key::COMPONENT.to_string(),
        entity_field(component, field::NAME)?.into(),
    );
    Ok(record)
}

fn sort_by_semver_desc(entities: &mut Vec<Entity>, version_field: &str) -> Result<(), PipelineError> {
    let mut keyed = entities
        .drain(..)
        .map(|entity| {
            let text = entity_field(&entity, version_field)?.to_string();
            let version = parse_version(&text)?;
            Ok((version, entity))
        })
        .collect::<Result<Vec<_>, PipelineError>>()?;
    keyed.sort_by(|a, b| b.0.cmp(&a.0));
    *entities = keyed.into_iter().map(|(_, entity)| entity).collect();
    Ok(())
}
