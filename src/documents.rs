//! Reference documents attached to the shared context.
//!
//! Documents keep insertion order, which is also the order they are
//! concatenated into the composed context.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{LabError, ValidationError};

/// File extensions the upload endpoint knows how to parse
pub const SUPPORTED_UPLOAD_EXTENSIONS: &[&str] = &[
    "txt", "pdf", "docx", "doc", "md", "markdown", "html", "htm", "csv", "json", "jsonl",
];

/// Kind recorded for documents typed in by hand
pub const TEXT_KIND: &str = "text";

/// One user-managed reference document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDocument {
    pub id: u64,
    pub title: String,
    pub content: String,
    pub enabled: bool,
    #[serde(rename = "size", default)]
    pub size_bytes: usize,
    /// `text` for hand-entered documents, the uploaded file type otherwise
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    TEXT_KIND.to_string()
}

impl ReferenceDocument {
    /// Whether this document contributes to the composed context
    pub fn contributes(&self) -> bool {
        self.enabled && !self.content.trim().is_empty()
    }
}

/// Parsed result of `POST /upload/document`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedDocument {
    pub filename: String,
    pub content: String,
    #[serde(default)]
    pub file_type: String,
}

/// Reject files the gateway cannot parse before uploading them
pub fn check_upload_extension(path: &Path) -> Result<String, ValidationError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if SUPPORTED_UPLOAD_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(ValidationError::UnsupportedDocumentType {
            extension,
            supported: SUPPORTED_UPLOAD_EXTENSIONS.join(", "),
        })
    }
}

/// Human-readable size (`0 B`, `1.5 KB`, `2 MB`)
pub fn format_size(bytes: usize) -> String {
    const UNITS: [&str; 3] = ["B", "KB", "MB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 10.0).round() / 10.0;
    format!("{} {}", rounded, UNITS[unit])
}

/// Ordered, id-stamped document collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSet {
    documents: Vec<ReferenceDocument>,
    next_id: u64,
}

impl DocumentSet {
    pub fn new() -> Self {
        Self {
            documents: Vec::new(),
            next_id: 1,
        }
    }

    /// Rebuild a set from persisted documents; new ids continue after the largest one
    pub fn from_documents(documents: Vec<ReferenceDocument>) -> Self {
        let next_id = documents.iter().map(|d| d.id).max().map_or(1, |max| max + 1);
        Self { documents, next_id }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }

    /// Add an empty, enabled text document titled `Document {n}`
    pub fn add_blank(&mut self) -> &ReferenceDocument {
        let title = format!("Document {}", self.documents.len() + 1);
        let id = self.allocate_id();
        self.push(ReferenceDocument {
            id,
            title,
            content: String::new(),
            enabled: true,
            size_bytes: 0,
            kind: TEXT_KIND.to_string(),
        })
    }

    /// Add a document produced by the upload endpoint
    pub fn add_uploaded(&mut self, upload: UploadedDocument) -> &ReferenceDocument {
        let id = self.allocate_id();
        let kind = if upload.file_type.is_empty() {
            "file".to_string()
        } else {
            upload.file_type
        };
        self.push(ReferenceDocument {
            id,
            title: upload.filename,
            size_bytes: upload.content.len(),
            content: upload.content,
            enabled: true,
            kind,
        })
    }

    fn push(&mut self, document: ReferenceDocument) -> &ReferenceDocument {
        let index = self.documents.len();
        self.documents.push(document);
        &self.documents[index]
    }

    fn get_mut(&mut self, id: u64) -> Result<&mut ReferenceDocument, LabError> {
        self.documents
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(LabError::DocumentNotFound(id))
    }

    pub fn get(&self, id: u64) -> Option<&ReferenceDocument> {
        self.documents.iter().find(|d| d.id == id)
    }

    pub fn update_title(&mut self, id: u64, title: impl Into<String>) -> Result<(), LabError> {
        self.get_mut(id)?.title = title.into();
        Ok(())
    }

    pub fn update_content(&mut self, id: u64, content: impl Into<String>) -> Result<(), LabError> {
        let doc = self.get_mut(id)?;
        doc.content = content.into();
        doc.size_bytes = doc.content.len();
        Ok(())
    }

    /// Flip the enabled flag, returning the new value
    pub fn toggle_enabled(&mut self, id: u64) -> Result<bool, LabError> {
        let doc = self.get_mut(id)?;
        doc.enabled = !doc.enabled;
        Ok(doc.enabled)
    }

    pub fn remove(&mut self, id: u64) -> Result<ReferenceDocument, LabError> {
        let index = self
            .documents
            .iter()
            .position(|d| d.id == id)
            .ok_or(LabError::DocumentNotFound(id))?;
        Ok(self.documents.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferenceDocument> {
        self.documents.iter()
    }

    pub fn as_slice(&self) -> &[ReferenceDocument] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.documents.iter().filter(|d| d.enabled).count()
    }

    /// Deep copy of the documents in order
    pub fn to_vec(&self) -> Vec<ReferenceDocument> {
        self.documents.clone()
    }
}
