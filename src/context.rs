//! Shared-context composition and change detection.
//!
//! The composed string is both what every provider receives as its system
//! prompt and the value compared between turns, so `build_context` must stay
//! pure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::documents::ReferenceDocument;

/// Header written before the first contributing reference document
pub const REFERENCE_HEADER: &str = "\n\n=== REFERENCE DOCUMENTS ===\n\n";

/// Text recorded on every context-change event
pub const CONTEXT_CHANGE_MESSAGE: &str = "System prompt or reference documents changed";

/// Compose the system prompt and enabled documents into one context string
pub fn build_context(system_prompt: &str, documents: &[ReferenceDocument]) -> String {
    let mut context = system_prompt.trim().to_string();

    let mut contributing = documents.iter().filter(|d| d.contributes()).peekable();
    if contributing.peek().is_some() {
        context.push_str(REFERENCE_HEADER);
        for doc in contributing {
            context.push_str(&format!("--- {} ---\n{}\n\n", doc.title, doc.content));
        }
    }

    context
}

/// The inputs a composed context is reduced from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub system_prompt: String,
    /// `(title, content)` of each contributing document, in order
    pub enabled_document_content: Vec<(String, String)>,
}

impl ContextSnapshot {
    pub fn capture(system_prompt: &str, documents: &[ReferenceDocument]) -> Self {
        Self {
            system_prompt: system_prompt.to_string(),
            enabled_document_content: documents
                .iter()
                .filter(|d| d.contributes())
                .map(|d| (d.title.clone(), d.content.clone()))
                .collect(),
        }
    }

    /// Same composition rule as [`build_context`]
    pub fn compose(&self) -> String {
        let mut context = self.system_prompt.trim().to_string();
        if !self.enabled_document_content.is_empty() {
            context.push_str(REFERENCE_HEADER);
            for (title, content) in &self.enabled_document_content {
                context.push_str(&format!("--- {title} ---\n{content}\n\n"));
            }
        }
        context
    }
}

/// Kind tag of a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextEventKind {
    ContextChange,
}

/// Notice that the shared context changed between two turns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEvent {
    #[serde(rename = "type")]
    pub kind: ContextEventKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Length of the provider's message log when the event was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl ContextEvent {
    pub fn context_change(timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: ContextEventKind::ContextChange,
            timestamp,
            message: CONTEXT_CHANGE_MESSAGE.to_string(),
            position: None,
        }
    }
}

/// Outcome of one [`ContextChangeDetector::detect`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextChangeResult {
    pub changed: bool,
}

/// Edge-triggered detector over composed context strings
#[derive(Debug, Clone, Default)]
pub struct ContextChangeDetector {
    last_context: Option<String>,
}

impl ContextChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare against the previous context, then remember the new one.
    ///
    /// The first call only establishes the baseline and never reports a change.
    pub fn detect(&mut self, new_context: &str) -> ContextChangeResult {
        let changed = self
            .last_context
            .as_deref()
            .is_some_and(|last| last != new_context);
        self.last_context = Some(new_context.to_string());
        ContextChangeResult { changed }
    }

    /// Forget the baseline; the next `detect` is silent again
    pub fn reset(&mut self) {
        self.last_context = None;
    }

    pub fn last_context(&self) -> Option<&str> {
        self.last_context.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: u64, title: &str, content: &str, enabled: bool) -> ReferenceDocument {
        ReferenceDocument {
            id,
            title: title.to_string(),
            content: content.to_string(),
            enabled,
            size_bytes: content.len(),
            kind: "text".to_string(),
        }
    }

    #[test]
    fn test_build_skips_disabled_documents() {
        let docs = vec![doc(1, "A", "x", true), doc(2, "B", "y", false)];
        assert_eq!(
            build_context("Be terse.", &docs),
            "Be terse.\n\n=== REFERENCE DOCUMENTS ===\n\n--- A ---\nx\n\n"
        );
    }

    #[test]
    fn test_build_without_documents_is_trimmed_prompt() {
        assert_eq!(build_context("  Be kind.\n", &[]), "Be kind.");
    }

    #[test]
    fn test_blank_documents_produce_no_header() {
        let docs = vec![doc(1, "Empty", "   \n", true)];
        assert_eq!(build_context("Prompt", &docs), "Prompt");
    }

    #[test]
    fn test_build_is_deterministic_and_ordered() {
        let docs = vec![doc(2, "Second", "b", true), doc(1, "First", "a", true)];
        let first = build_context("p", &docs);
        let second = build_context("p", &docs);
        assert_eq!(first, second);
        let second_pos = first.find("--- Second ---").expect("second present");
        let first_pos = first.find("--- First ---").expect("first present");
        assert!(second_pos < first_pos);
    }

    #[test]
    fn test_snapshot_composes_like_builder() {
        let docs = vec![doc(1, "A", "x", true), doc(2, "B", "", true), doc(3, "C", "z", false)];
        let snapshot = ContextSnapshot::capture(" prompt ", &docs);
        assert_eq!(snapshot.enabled_document_content.len(), 1);
        assert_eq!(snapshot.compose(), build_context(" prompt ", &docs));
    }

    #[test]
    fn test_detector_is_edge_triggered() {
        let mut detector = ContextChangeDetector::new();
        assert!(!detector.detect("one").changed);
        assert!(!detector.detect("one").changed);
        assert!(detector.detect("two").changed);
        assert!(!detector.detect("two").changed);
        assert!(detector.detect("two ").changed);
    }

    #[test]
    fn test_detector_first_call_is_silent_even_when_empty() {
        let mut detector = ContextChangeDetector::new();
        assert!(!detector.detect("").changed);
        assert_eq!(detector.last_context(), Some(""));
    }

    #[test]
    fn test_detector_reset_drops_baseline() {
        let mut detector = ContextChangeDetector::new();
        detector.detect("one");
        detector.reset();
        assert!(!detector.detect("two").changed);
    }

    #[test]
    fn test_disabled_document_edit_does_not_change_context() {
        let mut docs = vec![doc(1, "A", "x", true), doc(2, "B", "y", false)];
        let mut detector = ContextChangeDetector::new();
        detector.detect(&build_context("p", &docs));

        docs[1].content = "changed".to_string();
        assert!(!detector.detect(&build_context("p", &docs)).changed);

        docs[0].title = "A2".to_string();
        assert!(detector.detect(&build_context("p", &docs)).changed);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ContextEvent::context_change(Utc::now());
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "context_change");
        assert_eq!(value["message"], CONTEXT_CHANGE_MESSAGE);
        assert!(value.get("position").is_none());
    }
}
