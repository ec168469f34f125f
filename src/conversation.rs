//! Per-provider conversation logs.
//!
//! Every provider owns one message log and one event log. Both are append-only
//! apart from clearing and the regenerate flow, which may drop the trailing
//! assistant reply.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::context::ContextEvent;
use crate::error::{LabError, ValidationError};
use crate::providers::ProviderRegistry;

/// Speaker of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn in a provider's conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Message and event logs of a single provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub messages: Vec<Message>,
    pub events: Vec<ContextEvent>,
}

impl ConversationEntry {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.events.is_empty()
    }

    /// Whether a user message is still waiting for its reply
    pub fn awaiting_reply(&self) -> bool {
        self.messages.last().is_some_and(|m| m.role == Role::User)
    }
}

/// Deep copy of every provider's logs, keyed by provider id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub history: BTreeMap<String, Vec<Message>>,
    pub events: BTreeMap<String, Vec<ContextEvent>>,
}

/// Conversation logs for every known provider
#[derive(Debug, Clone)]
pub struct ConversationStore {
    /// Provider ids in catalog order
    order: Vec<String>,
    entries: HashMap<String, ConversationEntry>,
}

impl ConversationStore {
    /// One empty entry per provider the registry knows
    pub fn new(registry: &ProviderRegistry) -> Self {
        let order: Vec<String> = registry
            .list_providers()
            .iter()
            .map(|p| p.id.to_string())
            .collect();
        let entries = order
            .iter()
            .map(|id| (id.clone(), ConversationEntry::default()))
            .collect();
        Self { order, entries }
    }

    fn entry_mut(&mut self, provider_id: &str) -> Result<&mut ConversationEntry, ValidationError> {
        self.entries
            .get_mut(provider_id)
            .ok_or_else(|| ValidationError::UnknownProvider(provider_id.to_string()))
    }

    pub fn entry(&self, provider_id: &str) -> Result<&ConversationEntry, ValidationError> {
        self.entries
            .get(provider_id)
            .ok_or_else(|| ValidationError::UnknownProvider(provider_id.to_string()))
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.entries.contains_key(provider_id)
    }

    pub fn append_message(&mut self, provider_id: &str, message: Message) -> Result<(), LabError> {
        self.entry_mut(provider_id)?.messages.push(message);
        Ok(())
    }

    /// Append an event, stamping it with the current message-log length
    pub fn append_event(&mut self, provider_id: &str, mut event: ContextEvent) -> Result<(), LabError> {
        let entry = self.entry_mut(provider_id)?;
        event.position = Some(entry.messages.len());
        entry.events.push(event);
        Ok(())
    }

    /// Remove the trailing assistant reply so its user message can be resent.
    ///
    /// Nothing is mutated unless the log ends with an assistant message
    /// immediately preceded by a user message.
    pub fn pop_last_assistant_message(&mut self, provider_id: &str) -> Result<Message, LabError> {
        let entry = self.entry_mut(provider_id)?;
        let insufficient = || LabError::InsufficientHistory {
            provider_id: provider_id.to_string(),
        };

        let [.., before, last] = entry.messages.as_slice() else {
            return Err(insufficient());
        };
        if last.role != Role::Assistant || before.role != Role::User {
            return Err(insufficient());
        }

        entry.messages.pop().ok_or_else(insufficient)
    }

    pub fn clear(&mut self, provider_id: &str) -> Result<(), LabError> {
        let entry = self.entry_mut(provider_id)?;
        entry.messages.clear();
        entry.events.clear();
        Ok(())
    }

    pub fn clear_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.messages.clear();
            entry.events.clear();
        }
    }

    pub fn messages(&self, provider_id: &str) -> Result<&[Message], ValidationError> {
        self.entry(provider_id).map(|e| e.messages.as_slice())
    }

    pub fn events(&self, provider_id: &str) -> Result<&[ContextEvent], ValidationError> {
        self.entry(provider_id).map(|e| e.events.as_slice())
    }

    /// Whether any provider has at least one message
    pub fn has_content(&self) -> bool {
        self.entries.values().any(|e| !e.messages.is_empty())
    }

    /// Provider ids in catalog order
    pub fn provider_ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// `(provider id, entry)` pairs in catalog order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConversationEntry)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (id.as_str(), e)))
    }

    /// Owned copy of every log; later mutation of the store never shows through
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::default();
        for (id, entry) in self.iter() {
            snapshot.history.insert(id.to_string(), entry.messages.clone());
            snapshot.events.insert(id.to_string(), entry.events.clone());
        }
        snapshot
    }

    /// Replace all logs with a snapshot's content.
    ///
    /// Every id is validated first; on error the store is left untouched.
    /// Providers absent from the snapshot end up empty.
    pub fn restore_from(&mut self, snapshot: &StoreSnapshot) -> Result<(), LabError> {
        if let Some(unknown) = snapshot
            .history
            .keys()
            .chain(snapshot.events.keys())
            .find(|id| !self.entries.contains_key(id.as_str()))
        {
            return Err(ValidationError::UnknownProvider(unknown.clone()).into());
        }

        self.clear_all();
        for (id, messages) in &snapshot.history {
            self.entry_mut(id)?.messages.clone_from(messages);
        }
        for (id, events) in &snapshot.events {
            self.entry_mut(id)?.events.clone_from(events);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn store() -> ConversationStore {
        ConversationStore::new(&ProviderRegistry::builtin())
    }

    #[test]
    fn test_append_to_unknown_provider_fails() {
        let mut store = store();
        let err = store
            .append_message("nope", Message::user("hi"))
            .expect_err("unknown provider");
        assert!(matches!(
            err,
            LabError::Validation(ValidationError::UnknownProvider(ref id)) if id == "nope"
        ));
        assert!(!store.has_content());
    }

    #[test]
    fn test_pop_requires_user_then_assistant() {
        let mut store = store();
        store
            .append_message("grok-4", Message::user("hi"))
            .expect("append");

        let err = store
            .pop_last_assistant_message("grok-4")
            .expect_err("odd log");
        assert!(matches!(err, LabError::InsufficientHistory { .. }));
        assert_eq!(store.messages("grok-4").map(<[Message]>::len), Ok(1));

        store
            .append_message("grok-4", Message::assistant("hello"))
            .expect("append");
        let popped = store.pop_last_assistant_message("grok-4").expect("pop");
        assert_eq!(popped, Message::assistant("hello"));
        assert_eq!(
            store.messages("grok-4").expect("known"),
            &[Message::user("hi")]
        );
    }

    #[test]
    fn test_pop_rejects_assistant_after_assistant() {
        let mut store = store();
        for m in [Message::assistant("a"), Message::assistant("b")] {
            store.append_message("grok-3", m).expect("append");
        }
        assert!(store.pop_last_assistant_message("grok-3").is_err());
        assert_eq!(store.messages("grok-3").map(<[Message]>::len), Ok(2));
    }

    #[test]
    fn test_event_position_is_stamped() {
        let mut store = store();
        store
            .append_message("grok-4", Message::user("one"))
            .expect("append");
        store
            .append_event("grok-4", ContextEvent::context_change(Utc::now()))
            .expect("event");
        assert_eq!(store.events("grok-4").expect("known")[0].position, Some(1));
    }

    #[test]
    fn test_clear_keeps_entry() {
        let mut store = store();
        store
            .append_message("grok-4", Message::user("one"))
            .expect("append");
        store.clear("grok-4").expect("clear");
        assert!(store.contains("grok-4"));
        assert!(store.entry("grok-4").expect("known").is_empty());
    }

    #[test]
    fn test_snapshot_does_not_alias_live_state() {
        let mut store = store();
        store
            .append_message("grok-4", Message::user("one"))
            .expect("append");
        let snapshot = store.snapshot();
        store
            .append_message("grok-4", Message::assistant("two"))
            .expect("append");

        assert_eq!(snapshot.history["grok-4"].len(), 1);

        let mut other = ConversationStore::new(&ProviderRegistry::builtin());
        other.restore_from(&snapshot).expect("restore");
        assert_eq!(other.snapshot(), snapshot);
    }

    #[test]
    fn test_restore_rejects_unknown_ids_without_mutation() {
        let mut store = store();
        store
            .append_message("grok-4", Message::user("keep"))
            .expect("append");

        let mut snapshot = StoreSnapshot::default();
        snapshot
            .history
            .insert("ghost".to_string(), vec![Message::user("x")]);

        assert!(store.restore_from(&snapshot).is_err());
        assert_eq!(store.messages("grok-4").map(<[Message]>::len), Ok(1));
    }
}
