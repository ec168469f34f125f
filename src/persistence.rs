//! Durable state over a named-blob store.
//!
//! In-memory state is authoritative. A failed write never rolls back the
//! mutation that caused it; the failure comes back as [`Stored::warning`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::documents::ReferenceDocument;
use crate::error::{LabError, Result, StorageError, ValidationError};
use crate::providers::ProviderSettings;
use crate::session::{LabSession, LabSnapshot, SharedSession};
use crate::{log_debug, log_warn};

pub const SAVED_CONVERSATIONS_KEY: &str = "asher-saved-conversations";
pub const REFERENCE_DOCS_KEY: &str = "asher-reference-docs";
pub const PREFERENCES_KEY: &str = "asher-preferences";

/// Persist and retrieve named string blobs
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// One JSON file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.dir.join(format!("{safe}.json"))
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Write to a temp file in the same directory, then rename over the target
    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(value.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(self.path_for(key))
            .map_err(|e| StorageError::Persist {
                key: key.to_string(),
                reason: e.error.to_string(),
            })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// In-memory blobs with an optional total-size quota
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that refuses writes pushing the total size past `quota` bytes
    pub fn with_quota(quota: usize) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.blobs.lock().values().map(String::len).sum()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock();
        if let Some(quota) = self.quota {
            let others: usize = blobs
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            if others + value.len() > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    quota,
                });
            }
        }
        blobs.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

/// Result of an operation whose durable write may have failed
#[derive(Debug)]
pub struct Stored<T> {
    pub value: T,
    pub warning: Option<StorageError>,
}

impl<T> Stored<T> {
    fn new(value: T, outcome: Result<(), StorageError>) -> Self {
        Self {
            value,
            warning: outcome.err(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.warning.is_none()
    }
}

/// Named point-in-time copy of a lab session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConversation {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub snapshot: LabSnapshot,
}

/// Older saves used a millisecond timestamp as a numeric id
fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(id) => id,
        RawId::Number(id) => id.to_string(),
    })
}

impl SavedConversation {
    /// Providers with at least one message
    pub fn active_providers(&self) -> Vec<&str> {
        self.snapshot
            .conversation_history
            .iter()
            .filter(|(_, messages)| !messages.is_empty())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Two-by-two grid
    #[default]
    Quad,
    Columns,
}

/// UI preferences remembered between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub theme: Theme,
    pub layout: Layout,
    pub sync_scroll: bool,
    pub config_panel_open: bool,
    pub onboarding_seen: bool,
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: Theme::Dark,
            layout: Layout::Quad,
            sync_scroll: true,
            config_panel_open: false,
            onboarding_seen: false,
            providers: BTreeMap::new(),
        }
    }
}

/// Saved conversations, documents and preferences over a [`BlobStore`]
pub struct SessionPersistence<S: BlobStore> {
    store: S,
    saved: Vec<SavedConversation>,
}

impl<S: BlobStore> SessionPersistence<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            saved: Vec::new(),
        }
    }

    pub fn blob_store(&self) -> &S {
        &self.store
    }

    /// Read saved conversations from the store.
    ///
    /// A missing blob means none were saved; an unreadable one is reported
    /// as a warning and the list starts empty.
    pub fn load(&mut self) -> Stored<usize> {
        let loaded = self.read_json::<Vec<SavedConversation>>(SAVED_CONVERSATIONS_KEY);
        self.saved = loaded.value.unwrap_or_default();
        log_debug!("Loaded {} saved conversations", self.saved.len());
        Stored {
            value: self.saved.len(),
            warning: loaded.warning,
        }
    }

    /// Save a named copy of the session
    pub fn save(&mut self, name: &str, session: &LabSession) -> Result<Stored<SavedConversation>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        if !session.store().has_content() {
            return Err(ValidationError::NothingToSave.into());
        }

        let saved = SavedConversation {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            timestamp: Utc::now(),
            snapshot: session.snapshot(),
        };
        self.saved.insert(0, saved.clone());
        let outcome = self.write_saved();
        Ok(Stored::new(saved, outcome))
    }

    /// Saved conversations, newest first
    pub fn list(&self) -> Vec<SavedConversation> {
        let mut list = self.saved.clone();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        list
    }

    pub fn get(&self, id: &str) -> Option<&SavedConversation> {
        self.saved.iter().find(|s| s.id == id)
    }

    /// Deep copy of a saved conversation's state
    pub fn restore(&self, id: &str) -> Result<LabSnapshot> {
        self.get(id)
            .map(|s| s.snapshot.clone())
            .ok_or_else(|| LabError::NotFound(format!("saved conversation {id}")))
    }

    /// Restore a saved conversation into a live session
    pub fn restore_into(&self, id: &str, session: &SharedSession) -> Result<()> {
        let snapshot = self.restore(id)?;
        session.write().restore(&snapshot)
    }

    pub fn delete(&mut self, id: &str) -> Result<Stored<()>> {
        let index = self
            .saved
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| LabError::NotFound(format!("saved conversation {id}")))?;
        self.saved.remove(index);
        Ok(Stored::new((), self.write_saved()))
    }

    pub fn save_documents(&self, documents: &[ReferenceDocument]) -> Stored<()> {
        Stored::new((), self.write_json(REFERENCE_DOCS_KEY, &documents))
    }

    pub fn load_documents(&self) -> Stored<Vec<ReferenceDocument>> {
        let loaded = self.read_json(REFERENCE_DOCS_KEY);
        Stored {
            value: loaded.value.unwrap_or_default(),
            warning: loaded.warning,
        }
    }

    /// Save preferences; API key overrides are left out
    pub fn save_preferences(&self, preferences: &Preferences) -> Stored<()> {
        let mut redacted = preferences.clone();
        for settings in redacted.providers.values_mut() {
            settings.api_key_override = None;
        }
        Stored::new((), self.write_json(PREFERENCES_KEY, &redacted))
    }

    pub fn load_preferences(&self) -> Stored<Preferences> {
        let loaded = self.read_json(PREFERENCES_KEY);
        Stored {
            value: loaded.value.unwrap_or_default(),
            warning: loaded.warning,
        }
    }

    fn write_saved(&self) -> Result<(), StorageError> {
        self.write_json(SAVED_CONVERSATIONS_KEY, &self.saved)
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let outcome = serde_json::to_string(value)
            .map_err(StorageError::from)
            .and_then(|json| self.store.put(key, &json));
        if let Err(e) = &outcome {
            log_warn!("Could not persist '{}': {}", key, e);
        }
        outcome
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Stored<Option<T>> {
        let parsed = self.store.get(key).and_then(|blob| {
            blob.map(|json| serde_json::from_str(&json).map_err(StorageError::from))
                .transpose()
        });
        match parsed {
            Ok(value) => Stored {
                value,
                warning: None,
            },
            Err(e) => {
                log_warn!("Ignoring unreadable '{}': {}", key, e);
                Stored {
                    value: None,
                    warning: Some(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;

    fn chatty_session() -> LabSession {
        let mut session = LabSession::default();
        session.set_system_prompt("Be terse.");
        session
            .store_mut()
            .append_message("grok-4", Message::user("hi"))
            .expect("append");
        session
    }

    #[test]
    fn test_save_requires_name_and_content() {
        let mut persistence = SessionPersistence::new(MemoryBlobStore::new());
        assert!(matches!(
            persistence.save("   ", &chatty_session()),
            Err(LabError::Validation(ValidationError::EmptyName))
        ));
        assert!(matches!(
            persistence.save("empty", &LabSession::default()),
            Err(LabError::Validation(ValidationError::NothingToSave))
        ));
        assert!(persistence.list().is_empty());
    }

    #[test]
    fn test_saved_blob_uses_camel_case_fields() {
        let mut persistence = SessionPersistence::new(MemoryBlobStore::new());
        let stored = persistence
            .save(" Run 1 ", &chatty_session())
            .expect("save");
        assert!(stored.is_persisted());
        assert_eq!(stored.value.name, "Run 1");

        let blob = persistence
            .blob_store()
            .get(SAVED_CONVERSATIONS_KEY)
            .expect("get")
            .expect("written");
        let value: serde_json::Value = serde_json::from_str(&blob).expect("json");
        assert_eq!(value[0]["systemPrompt"], "Be terse.");
        assert_eq!(value[0]["conversationHistory"]["grok-4"][0]["role"], "user");
        assert!(value[0].get("referenceDocuments").is_some());
    }

    #[test]
    fn test_quota_failure_keeps_in_memory_state() {
        let mut persistence = SessionPersistence::new(MemoryBlobStore::with_quota(16));
        let stored = persistence.save("big", &chatty_session()).expect("validated");
        assert!(matches!(
            stored.warning,
            Some(StorageError::QuotaExceeded { .. })
        ));
        assert_eq!(persistence.list().len(), 1);
    }

    #[test]
    fn test_corrupt_blob_loads_empty_with_warning() {
        let store = MemoryBlobStore::new();
        store.put(SAVED_CONVERSATIONS_KEY, "{not json").expect("put");
        let mut persistence = SessionPersistence::new(store);
        let loaded = persistence.load();
        assert_eq!(loaded.value, 0);
        assert!(matches!(loaded.warning, Some(StorageError::Serialization(_))));
    }

    #[test]
    fn test_restore_and_delete_unknown_id() {
        let mut persistence = SessionPersistence::new(MemoryBlobStore::new());
        assert!(matches!(persistence.restore("nope"), Err(LabError::NotFound(_))));
        assert!(matches!(persistence.delete("nope"), Err(LabError::NotFound(_))));
    }

    #[test]
    fn test_preferences_drop_api_keys() {
        let persistence = SessionPersistence::new(MemoryBlobStore::new());
        let mut preferences = Preferences {
            theme: Theme::Light,
            ..Default::default()
        };
        preferences.providers.insert(
            "grok-4".to_string(),
            ProviderSettings {
                api_key_override: Some("xai-secret".to_string()),
                temperature: Some(0.7),
                ..Default::default()
            },
        );
        assert!(persistence.save_preferences(&preferences).is_persisted());

        let loaded = persistence.load_preferences().value;
        assert_eq!(loaded.theme, Theme::Light);
        assert_eq!(loaded.providers["grok-4"].api_key_override, None);
        assert_eq!(loaded.providers["grok-4"].temperature, Some(0.7));
    }

    #[test]
    fn test_missing_preferences_are_defaults() {
        let persistence = SessionPersistence::new(MemoryBlobStore::new());
        let loaded = persistence.load_preferences();
        assert!(loaded.is_persisted());
        assert_eq!(loaded.value, Preferences::default());
    }
}
