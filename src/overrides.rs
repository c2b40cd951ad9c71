use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metadata::{Metadata, log_format_metadata, matches};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Override {
    #[serde(default, rename = "where")]
    pub where_: Metadata,
    #[serde(default, rename = "use")]
    pub use_: Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct Overrides {
    overrides: Vec<Override>,
}

impl Overrides {
    pub fn new(overrides: Vec<Override>) -> Self {
        Self { overrides }
    }

    // Rules are tested against the metadata as already patched by earlier
    // rules; later rules win on key conflicts.
    pub fn apply(&self, metadata: &mut Metadata) {
        for rule in &self.overrides {
            if matches(metadata, &rule.where_) {
                debug!("applying override {}", log_format_metadata(&rule.use_));
                for (name, value) in &rule.use_ {
                    metadata.insert(name.clone(), value.clone());
                }
            }
        }
    }
}
