//! Asher - multi-provider LLM comparison lab
//!
//! This library sends one prompt to several language-model providers at once,
//! keeps every provider's conversation in step with a shared, versioned
//! context, and saves or exports the resulting histories for side-by-side
//! comparison.

#![allow(clippy::uninlined_format_args)] // Style preference
#![allow(clippy::format_push_string)] // Performance improvement but stylistic
#![allow(clippy::return_self_not_must_use)] // Builder pattern is clear enough
#![allow(clippy::missing_errors_doc)] // Error enums document themselves

pub mod config;
pub mod context;
pub mod conversation;
pub mod dispatch;
pub mod documents;
pub mod error;
pub mod export;
pub mod gateway;
pub mod logger;
pub mod persistence;
pub mod providers;
pub mod session;

// Re-export important structs and functions for easier testing
pub use config::LabConfig;
pub use context::{ContextChangeDetector, ContextEvent, build_context};
pub use conversation::{ConversationStore, Message, Role};
pub use dispatch::{BatchSummary, DispatchCoordinator, DispatchOutcome, DispatchTarget, RenderSink};
pub use error::{LabError, StorageError, TransportError, ValidationError};
pub use export::{ExportFormat, ExportInput, Exporter};
pub use gateway::{HttpGateway, ProviderGateway, ProviderStatus, SendRequest};
pub use persistence::{BlobStore, FileBlobStore, MemoryBlobStore, SessionPersistence, Stored};
pub use providers::{Provider, ProviderFamily, ProviderRegistry, ProviderSettings};
pub use session::{LabSession, SharedSession};
