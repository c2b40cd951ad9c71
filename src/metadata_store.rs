use semver::Version;
use tracing::debug;

use crate::error::PipelineError;
use crate::metadata::{Metadata, key, log_format_metadata, matches};

#[derive(Debug, Clone)]
pub struct MetadataRecord {
    pub metadata: Metadata,
    pub version: Option<Version>,
}

impl MetadataRecord {
    pub fn new(metadata: Metadata) -> Result<Self, PipelineError> {
        let version = match metadata.get(key::VERSION) {
            Some(value) => {
                let text = value.to_string();
                Some(Version::parse(&text).map_err(|_| PipelineError::VersionFormat(text))?)
            }
            None => None,
        };
        Ok(Self { metadata, version })
    }
}

// Ordered catalog of versioned metadata records. `find` selects the highest
// version among superset matches; records without a version sort lowest.
#[derive(Debug, Clone, Default)]
pub struct MetadataStore {
    records: Vec<MetadataRecord>,
}

impl MetadataStore {
    pub fn new(metadata_sequence: Vec<Metadata>) -> Result<Self, PipelineError> {
        let records = metadata_sequence
            .into_iter()
            .map(MetadataRecord::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| PipelineError::Catalog(err.to_string()))?;
        Ok(Self { records })
    }

    pub fn find(&self, query: &Metadata) -> Option<&Metadata> {
        let mut selected: Option<&MetadataRecord> = None;
        for record in self
            .records
            .iter()
            .filter(|record| matches(&record.metadata, query))
        {
            debug!(
                "found matching metadata {}",
                log_format_metadata(&record.metadata)
            );
            match selected {
                // Strict comparison keeps the first of equally-versioned matches.
                Some(best) if record.version > best.version => selected = Some(record),
                None => selected = Some(record),
                _ => {}
            }
        }
        match selected {
            Some(record) => {
                debug!("selected metadata {}", log_format_metadata(&record.metadata));
                Some(&record.metadata)
            }
            None => {
                debug!("could not find any matching metadata");
                None
            }
        }
    }

    // Replaces only the first record sharing `data_product`, which is narrower
    // than the superset match `find` uses.
    pub fn add(&mut self, metadata: Metadata) -> Result<(), PipelineError> {
        let record = MetadataRecord::new(metadata)?;
        let data_product = record.metadata.get(key::DATA_PRODUCT).cloned();
        let existing = self.records.iter().position(|candidate| {
            candidate.metadata.get(key::DATA_PRODUCT) == data_product.as_ref()
        });
        match existing {
            Some(index) => self.records[index] = record,
            None => self.records.push(record),
        }
        Ok(())
    }

    pub fn records(&self) -> impl Iterator<Item = &Metadata> {
        self.records.iter().map(|record| &record.metadata)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::metadata::MetadataValue;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), MetadataValue::from(*v)))
            .collect()
    }

    #[test]
    fn find_returns_highest_version() {
        let store = MetadataStore::new(vec![
            meta(&[("data_product", "mortality"), ("version", "0.1.0")]),
            meta(&[("data_product", "mortality"), ("version", "0.2.0")]),
            meta(&[("data_product", "other"), ("version", "9.9.9")]),
        ])
        .unwrap();
        let found = store.find(&meta(&[("data_product", "mortality")])).unwrap();
        assert_eq!(
            found.get("version"),
            Some(&MetadataValue::from("0.2.0"))
        );
    }

    #[test]
    fn find_treats_missing_version_as_lowest() {
        let store = MetadataStore::new(vec![
            meta(&[("data_product", "mortality")]),
            meta(&[("data_product", "mortality"), ("version", "0.1.0")]),
        ])
        .unwrap();
        let found = store.find(&meta(&[("data_product", "mortality")])).unwrap();
        assert_eq!(
            found.get("version"),
            Some(&MetadataValue::from("0.1.0"))
        );
    }

    #[test]
    fn find_ties_break_by_insertion_order() {
        let store = MetadataStore::new(vec![
            meta(&[("data_product", "mortality"), ("filename", "first.csv")]),
            meta(&[("data_product", "mortality"), ("filename", "second.csv")]),
        ])
        .unwrap();
        let found = store.find(&meta(&[("data_product", "mortality")])).unwrap();
        assert_eq!(
            found.get("filename"),
            Some(&MetadataValue::from("first.csv"))
        );
    }

    #[test]
    fn find_matches_globs() {
        let store = MetadataStore::new(vec![
            meta(&[("data_product", "human/mortality"), ("version", "1.0.0")]),
        ])
        .unwrap();
        assert!(store.find(&meta(&[("data_product", "human/*")])).is_some());
        assert!(store.find(&meta(&[("data_product", "animal/*")])).is_none());
    }

    #[test]
    fn invalid_version_fails_construction() {
        let result = MetadataStore::new(vec![meta(&[
            ("data_product", "mortality"),
            ("version", "not-a-version"),
        ])]);
        assert_matches!(result, Err(PipelineError::Catalog(_)));
    }

    #[test]
    fn add_replaces_first_matching_data_product() {
        let mut store = MetadataStore::new(vec![
            meta(&[("data_product", "mortality"), ("filename", "a.csv")]),
            meta(&[("data_product", "mortality"), ("filename", "b.csv")]),
        ])
        .unwrap();
        store
            .add(meta(&[("data_product", "mortality"), ("filename", "c.csv")]))
            .unwrap();
        let filenames: Vec<_> = store
            .records()
            .map(|record| record.get("filename").unwrap().to_string())
            .collect();
        assert_eq!(filenames, vec!["c.csv", "b.csv"]);
    }

    #[test]
    fn add_appends_when_no_data_product_matches() {
        let mut store =
            MetadataStore::new(vec![meta(&[("data_product", "mortality")])]).unwrap();
        store.add(meta(&[("data_product", "births")])).unwrap();
        assert_eq!(store.records().count(), 2);
    }
}
