//! Error taxonomy for the comparison lab.
//!
//! Validation problems are rejected before any state mutation or network
//! activity. Transport problems stay inside a single provider's task. Storage
//! problems are reported as warnings and never roll back in-memory state.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T, E = LabError> = std::result::Result<T, E>;

/// Top-level error returned by lab operations
#[derive(Debug, Error)]
pub enum LabError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Nothing to regenerate for {provider_id}: no trailing assistant reply after a user message")]
    InsufficientHistory { provider_id: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Reference document not found: {0}")]
    DocumentNotFound(u64),
    #[error("Could not render export: {0}")]
    Export(#[source] serde_json::Error),
}

/// Input rejected synchronously, before anything is sent or recorded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Please enter a test message")]
    EmptyMessage,
    #[error("Please select at least one provider")]
    NoProviderSelected,
    #[error("A saved conversation needs a name")]
    EmptyName,
    #[error("No conversation to save. Start chatting first!")]
    NothingToSave,
    #[error("Unsupported file type: .{extension}. Supported types: {supported}")]
    UnsupportedDocumentType { extension: String, supported: String },
    #[error("Unknown export format: {0}")]
    UnknownExportFormat(String),
    #[error("Invalid gateway URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Failure of one outbound request; isolated to the provider that issued it
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Request failed with status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("{0}")]
    Provider(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// Durable-storage failure; the in-memory state stays authoritative
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not encode or decode stored data: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage may be full: writing '{key}' would exceed the {quota} byte quota")]
    QuotaExceeded { key: String, quota: usize },
    #[error("Could not persist '{key}': {reason}")]
    Persist { key: String, reason: String },
}

impl LabError {
    /// Whether this error was raised before any side effect took place
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::InsufficientHistory { .. })
    }
}
