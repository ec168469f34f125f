//! Lab-wide state.
//!
//! `LabSession` owns everything a comparison run mutates: the system prompt,
//! reference documents, context detector, per-provider logs, response stats
//! and best-response marks. All mutation goes through its methods.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::context::{ContextChangeDetector, ContextEvent, build_context};
use crate::conversation::{ConversationStore, Message, Role, StoreSnapshot};
use crate::documents::{DocumentSet, ReferenceDocument};
use crate::error::{LabError, ValidationError};
use crate::log_debug;
use crate::providers::ProviderRegistry;

/// Session handle shared between the UI layer and in-flight dispatches
pub type SharedSession = Arc<RwLock<LabSession>>;

/// Cost and latency of one provider response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStats {
    /// Estimated tokens (zero for failures)
    pub tokens: u64,
    pub elapsed_ms: u64,
    pub success: bool,
}

impl ResponseStats {
    pub fn success(tokens: u64, elapsed_ms: u64) -> Self {
        Self {
            tokens,
            elapsed_ms,
            success: true,
        }
    }

    pub fn failure(elapsed_ms: u64) -> Self {
        Self {
            tokens: 0,
            elapsed_ms,
            success: false,
        }
    }
}

/// Reply marked as the best one in its panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestResponse {
    pub provider_id: String,
    pub message_index: usize,
}

/// Deep copy of the state a saved conversation preserves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabSnapshot {
    pub system_prompt: String,
    pub reference_documents: Vec<ReferenceDocument>,
    pub conversation_history: BTreeMap<String, Vec<Message>>,
    pub conversation_events: BTreeMap<String, Vec<ContextEvent>>,
}

impl LabSnapshot {
    pub fn store_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            history: self.conversation_history.clone(),
            events: self.conversation_events.clone(),
        }
    }
}

/// The explicit global state of one comparison lab
#[derive(Debug, Clone)]
pub struct LabSession {
    registry: ProviderRegistry,
    system_prompt: String,
    documents: DocumentSet,
    detector: ContextChangeDetector,
    store: ConversationStore,
    stats: HashMap<String, Vec<ResponseStats>>,
    best: BTreeMap<String, BestResponse>,
    /// Bumped whenever the logs are wholesale replaced
    generation: u64,
}

impl Default for LabSession {
    fn default() -> Self {
        Self::new(ProviderRegistry::builtin())
    }
}

impl LabSession {
    pub fn new(registry: ProviderRegistry) -> Self {
        let store = ConversationStore::new(&registry);
        Self {
            registry,
            system_prompt: String::new(),
            documents: DocumentSet::new(),
            detector: ContextChangeDetector::new(),
            store,
            stats: HashMap::new(),
            best: BTreeMap::new(),
            generation: 0,
        }
    }

    /// Wrap in the shared handle dispatches operate on
    pub fn into_shared(self) -> SharedSession {
        Arc::new(RwLock::new(self))
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.documents
    }

    pub fn documents_mut(&mut self) -> &mut DocumentSet {
        &mut self.documents
    }

    pub fn replace_documents(&mut self, documents: Vec<ReferenceDocument>) {
        self.documents = DocumentSet::from_documents(documents);
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ConversationStore {
        &mut self.store
    }

    pub fn detector(&self) -> &ContextChangeDetector {
        &self.detector
    }

    /// The context string sent with the next message
    pub fn current_context(&self) -> String {
        build_context(&self.system_prompt, self.documents.as_slice())
    }

    /// Run change detection on the current context.
    ///
    /// When it changed, one shared event is appended to each listed provider's
    /// event log and returned.
    pub fn record_context_change(
        &mut self,
        provider_ids: &[String],
    ) -> Result<Option<ContextEvent>, LabError> {
        for id in provider_ids {
            self.registry.resolve(id)?;
        }

        let context = self.current_context();
        if !self.detector.detect(&context).changed {
            return Ok(None);
        }

        let event = ContextEvent::context_change(Utc::now());
        for id in provider_ids {
            self.store.append_event(id, event.clone())?;
        }
        log_debug!("Context changed; recorded for {} providers", provider_ids.len());
        Ok(Some(event))
    }

    /// Counter identifying the current set of conversations.
    ///
    /// Clearing or restoring starts a new generation; replies to requests
    /// issued under an older one are not recorded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record a reply to a request issued under `generation`.
    ///
    /// Returns false without touching anything when the conversations were
    /// cleared or restored since, or when the provider's log no longer ends
    /// with the user message awaiting this reply.
    pub fn record_reply(
        &mut self,
        generation: u64,
        provider_id: &str,
        reply: Message,
        stats: ResponseStats,
    ) -> Result<bool, LabError> {
        let awaiting = self.store.entry(provider_id)?.awaiting_reply();
        if generation != self.generation || !awaiting {
            return Ok(false);
        }
        self.store.append_message(provider_id, reply)?;
        self.record_stats(provider_id, stats);
        Ok(true)
    }

    /// Record a failed request issued under `generation`; stale failures are ignored
    pub fn record_failure(
        &mut self,
        generation: u64,
        provider_id: &str,
        stats: ResponseStats,
    ) -> bool {
        if generation != self.generation {
            return false;
        }
        self.record_stats(provider_id, stats);
        true
    }

    pub fn record_stats(&mut self, provider_id: &str, stats: ResponseStats) {
        self.stats.entry(provider_id.to_string()).or_default().push(stats);
    }

    pub fn stats(&self, provider_id: &str) -> &[ResponseStats] {
        self.stats.get(provider_id).map_or(&[], Vec::as_slice)
    }

    pub fn last_stats(&self, provider_id: &str) -> Option<ResponseStats> {
        self.stats(provider_id).last().copied()
    }

    /// Mean latency of successful responses, if any
    pub fn average_response_ms(&self, provider_id: &str) -> Option<u64> {
        let successes: Vec<u64> = self
            .stats(provider_id)
            .iter()
            .filter(|s| s.success)
            .map(|s| s.elapsed_ms)
            .collect();
        let count = u64::try_from(successes.len()).ok().filter(|c| *c > 0)?;
        Some(successes.iter().sum::<u64>() / count)
    }

    /// Mark or unmark a reply as the best in its panel.
    ///
    /// Returns whether the reply is marked afterwards. A panel holds at most one mark.
    pub fn toggle_best(&mut self, provider_id: &str, message_index: usize) -> Result<bool, LabError> {
        let panel = self.registry.resolve(provider_id)?.panel_group;
        let is_reply = self
            .store
            .messages(provider_id)?
            .get(message_index)
            .is_some_and(|m| m.role == Role::Assistant);
        if !is_reply {
            return Err(LabError::NotFound(format!(
                "assistant message {message_index} for {provider_id}"
            )));
        }

        let mark = BestResponse {
            provider_id: provider_id.to_string(),
            message_index,
        };
        if self.best.get(panel) == Some(&mark) {
            self.best.remove(panel);
            Ok(false)
        } else {
            self.best.insert(panel.to_string(), mark);
            Ok(true)
        }
    }

    /// Marked replies keyed by panel
    pub fn best_responses(&self) -> &BTreeMap<String, BestResponse> {
        &self.best
    }

    /// Drop the trailing reply of a provider, along with any mark pointing at it
    pub fn pop_last_assistant_message(&mut self, provider_id: &str) -> Result<Message, LabError> {
        let popped = self.store.pop_last_assistant_message(provider_id)?;
        let removed_index = self.store.messages(provider_id)?.len();
        self.best
            .retain(|_, b| !(b.provider_id == provider_id && b.message_index == removed_index));
        Ok(popped)
    }

    /// Empty every conversation and forget the context baseline.
    ///
    /// The system prompt and documents are kept.
    pub fn clear_conversations(&mut self) {
        self.store.clear_all();
        self.stats.clear();
        self.best.clear();
        self.detector.reset();
        self.generation += 1;
    }

    /// Owned copy of prompt, documents and logs
    pub fn snapshot(&self) -> LabSnapshot {
        let store = self.store.snapshot();
        LabSnapshot {
            system_prompt: self.system_prompt.clone(),
            reference_documents: self.documents.to_vec(),
            conversation_history: store.history,
            conversation_events: store.events,
        }
    }

    /// Replace prompt, documents and logs with a snapshot's content.
    ///
    /// Unknown provider ids reject the whole snapshot before anything changes.
    /// Stats and marks belong to the replaced conversation and are dropped.
    pub fn restore(&mut self, snapshot: &LabSnapshot) -> Result<(), LabError> {
        if let Some(unknown) = snapshot
            .conversation_history
            .keys()
            .chain(snapshot.conversation_events.keys())
            .find(|id| !self.registry.contains(id))
        {
            return Err(ValidationError::UnknownProvider(unknown.clone()).into());
        }

        self.store.restore_from(&snapshot.store_snapshot())?;
        self.system_prompt.clone_from(&snapshot.system_prompt);
        self.documents = DocumentSet::from_documents(snapshot.reference_documents.clone());
        self.stats.clear();
        self.best.clear();
        self.generation += 1;
        Ok(())
    }
}
