use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse config file: {0}")]
    ConfigParse(String),

    #[error("invalid metadata catalog: {0}")]
    Catalog(String),

    #[error("no match found for {0}")]
    Lookup(String),

    #[error("{count} matching results found for exact query '{query}' on target '{target}'")]
    AmbiguousResult {
        target: String,
        query: String,
        count: usize,
    },

    #[error("calculated hash {calculated} != verified hash {verified}")]
    HashMismatch {
        calculated: String,
        verified: String,
    },

    #[error("'{0}' is not a valid semantic version")]
    VersionFormat(String),

    #[error("unsupported remote filesystem {protocol}:{uri}")]
    UnsupportedProtocol { protocol: String, uri: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("registry request failed: {0}")]
    RegistryHttp(String),

    #[error("registry returned status {status}: {message}")]
    RegistryStatus { status: u16, message: String },

    #[error("unexpected registry response: {0}")]
    RegistryData(String),

    #[error("entity already exists on target '{0}'")]
    AlreadyExists(String),

    #[error("run metadata key '{0}' is reserved")]
    ReservedRunMetadata(String),

    #[error("registry access token required but not provided")]
    MissingToken,

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
