//! Rendering lab state into downloadable reports.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

use crate::context::ContextEvent;
use crate::conversation::{Message, Role};
use crate::documents::ReferenceDocument;
use crate::error::{LabError, Result, ValidationError};
use crate::persistence::SavedConversation;
use crate::providers::ProviderRegistry;
use crate::session::{LabSession, LabSnapshot};

const TABLE_CELL_LIMIT: usize = 200;
const TABLE_PROMPT_LIMIT: usize = 100;
const BEST_RESPONSE_LIMIT: usize = 500;
const RULE_WIDTH: usize = 80;

/// Report formats the lab can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Json,
    PlainText,
    Markdown,
    /// One row per prompt, one column per provider
    ComparisonTable,
}

impl ExportFormat {
    /// Download name stamped with the export time in epoch milliseconds
    pub fn file_name(self, at: DateTime<Utc>) -> String {
        let millis = at.timestamp_millis();
        match self {
            Self::Json => format!("asher-results-{millis}.json"),
            Self::PlainText => format!("asher-results-{millis}.txt"),
            Self::Markdown => format!("asher-results-{millis}.md"),
            Self::ComparisonTable => format!("asher-comparison-{millis}.md"),
        }
    }

    pub const fn mime_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::PlainText => "text/plain",
            Self::Markdown | Self::ComparisonTable => "text/markdown",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "txt" | "plain" => Ok(Self::PlainText),
            "markdown" | "md" => Ok(Self::Markdown),
            "table" | "comparison" => Ok(Self::ComparisonTable),
            other => Err(ValidationError::UnknownExportFormat(other.to_string())),
        }
    }
}

/// A reply marked best, resolved to its text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestReply {
    pub provider_id: String,
    pub content: String,
}

/// Everything a report is rendered from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInput {
    pub generated_at: DateTime<Utc>,
    pub snapshot: LabSnapshot,
    pub active_providers: Vec<String>,
    pub average_response_ms: BTreeMap<String, u64>,
    pub best_responses: Vec<BestReply>,
}

impl ExportInput {
    /// Capture the live session for the given active providers
    pub fn from_session(session: &LabSession, active_providers: &[String]) -> Self {
        let snapshot = session.snapshot();
        let average_response_ms = active_providers
            .iter()
            .filter_map(|id| session.average_response_ms(id).map(|ms| (id.clone(), ms)))
            .collect();
        let best_responses = session
            .best_responses()
            .values()
            .filter_map(|mark| {
                snapshot
                    .conversation_history
                    .get(&mark.provider_id)
                    .and_then(|messages| messages.get(mark.message_index))
                    .map(|m| BestReply {
                        provider_id: mark.provider_id.clone(),
                        content: m.content.clone(),
                    })
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            snapshot,
            active_providers: active_providers.to_vec(),
            average_response_ms,
            best_responses,
        }
    }

    /// Report input for a saved conversation; providers with messages count as active
    pub fn from_saved(saved: &SavedConversation) -> Self {
        Self {
            generated_at: Utc::now(),
            active_providers: saved
                .active_providers()
                .into_iter()
                .map(str::to_string)
                .collect(),
            snapshot: saved.snapshot.clone(),
            average_response_ms: BTreeMap::new(),
            best_responses: Vec::new(),
        }
    }

    fn messages(&self, provider_id: &str) -> &[Message] {
        self.snapshot
            .conversation_history
            .get(provider_id)
            .map_or(&[], Vec::as_slice)
    }

    fn events(&self, provider_id: &str) -> &[ContextEvent] {
        self.snapshot
            .conversation_events
            .get(provider_id)
            .map_or(&[], Vec::as_slice)
    }
}

#[derive(Serialize)]
struct JsonConfiguration<'a> {
    system_prompt: &'a str,
    reference_documents: &'a [ReferenceDocument],
    active_providers: &'a [String],
}

#[derive(Serialize)]
struct JsonExport<'a> {
    timestamp: String,
    configuration: JsonConfiguration<'a>,
    conversations: BTreeMap<&'a str, &'a [Message]>,
    events: BTreeMap<&'a str, &'a [ContextEvent]>,
}

/// One line of a provider's interleaved transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptItem<'a> {
    Message(&'a Message),
    Event(&'a ContextEvent),
}

/// Merge a message log with its event log.
///
/// An event stamped with position `n` is placed before message `n`. Events
/// without a position go after every message.
pub fn interleave<'a>(
    messages: &'a [Message],
    events: &'a [ContextEvent],
) -> Vec<TranscriptItem<'a>> {
    let mut items = Vec::with_capacity(messages.len() + events.len());
    for (index, message) in messages.iter().enumerate() {
        items.extend(
            events
                .iter()
                .filter(|e| e.position == Some(index))
                .map(TranscriptItem::Event),
        );
        items.push(TranscriptItem::Message(message));
    }
    items.extend(
        events
            .iter()
            .filter(|e| e.position.is_none_or(|p| p >= messages.len()))
            .map(TranscriptItem::Event),
    );
    items
}

/// First `limit` characters, with `...` when anything was cut
fn truncate_chars(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Make text safe for a single Markdown table cell
fn table_cell(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(limit).collect();
    let escaped = head.replace('|', "\\|").replace('\n', "<br>");
    if chars.next().is_some() {
        format!("{escaped}...")
    } else {
        escaped
    }
}

fn format_seconds(ms: u64) -> String {
    format!("{}.{:02}s", ms / 1000, (ms % 1000) / 10)
}

fn display_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Renders [`ExportInput`] in each [`ExportFormat`]
#[derive(Debug, Clone, Default)]
pub struct Exporter {
    registry: ProviderRegistry,
}

impl Exporter {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self { registry }
    }

    pub fn render(&self, format: ExportFormat, input: &ExportInput) -> Result<String> {
        match format {
            ExportFormat::Json => self.render_json(input),
            ExportFormat::PlainText => Ok(self.render_plain_text(input)),
            ExportFormat::Markdown => Ok(self.render_markdown(input)),
            ExportFormat::ComparisonTable => Ok(self.render_comparison_table(input)),
        }
    }

    fn display_name<'a>(&self, provider_id: &'a str) -> &'a str {
        self.registry
            .resolve(provider_id)
            .map_or(provider_id, |p| p.display_name)
    }

    /// Providers with at least one message, in catalog order
    fn providers_with_messages<'a>(
        &'a self,
        input: &'a ExportInput,
    ) -> impl Iterator<Item = &'static str> + 'a {
        self.registry
            .list_providers()
            .iter()
            .map(|p| p.id)
            .filter(move |id| !input.messages(id).is_empty())
    }

    fn render_json(&self, input: &ExportInput) -> Result<String> {
        let snapshot = &input.snapshot;
        let export = JsonExport {
            timestamp: input.generated_at.to_rfc3339(),
            configuration: JsonConfiguration {
                system_prompt: &snapshot.system_prompt,
                reference_documents: &snapshot.reference_documents,
                active_providers: &input.active_providers,
            },
            conversations: snapshot
                .conversation_history
                .iter()
                .filter(|(_, m)| !m.is_empty())
                .map(|(id, m)| (id.as_str(), m.as_slice()))
                .collect(),
            events: snapshot
                .conversation_events
                .iter()
                .filter(|(_, e)| !e.is_empty())
                .map(|(id, e)| (id.as_str(), e.as_slice()))
                .collect(),
        };
        serde_json::to_string_pretty(&export).map_err(LabError::Export)
    }

    fn render_plain_text(&self, input: &ExportInput) -> String {
        let snapshot = &input.snapshot;
        let rule = "=".repeat(RULE_WIDTH);
        let mut text = String::new();
        writeln!(text, "ASHER Test Results").expect("write to string should not fail");
        writeln!(text, "Date: {}", display_time(input.generated_at))
            .expect("write to string should not fail");
        writeln!(text, "{rule}\n").expect("write to string should not fail");

        if !snapshot.system_prompt.is_empty() {
            writeln!(text, "SYSTEM PROMPT:\n{}\n", snapshot.system_prompt)
                .expect("write to string should not fail");
        }

        if !snapshot.reference_documents.is_empty() {
            text.push_str("REFERENCE DOCUMENTS:\n");
            for doc in &snapshot.reference_documents {
                let status = if doc.enabled { "ENABLED" } else { "DISABLED" };
                writeln!(text, "\n--- {} ({status}) ---\n{}", doc.title, doc.content)
                    .expect("write to string should not fail");
            }
            text.push('\n');
        }

        writeln!(text, "CONVERSATIONS:\n{rule}\n").expect("write to string should not fail");
        for id in self.providers_with_messages(input) {
            writeln!(text, "\n### {} ###\n", self.display_name(id))
                .expect("write to string should not fail");
            for item in interleave(input.messages(id), input.events(id)) {
                match item {
                    TranscriptItem::Message(m) => {
                        writeln!(
                            text,
                            "[{}]\n{}\n",
                            m.role.as_str().to_uppercase(),
                            m.content
                        )
                        .expect("write to string should not fail");
                    }
                    TranscriptItem::Event(e) => {
                        writeln!(
                            text,
                            "[CONTEXT CHANGE - {}]\n{}\n",
                            display_time(e.timestamp),
                            e.message
                        )
                        .expect("write to string should not fail");
                    }
                }
            }
        }
        text
    }

    fn render_markdown(&self, input: &ExportInput) -> String {
        let snapshot = &input.snapshot;
        let mut md = String::new();
        md.push_str("# ASHER Test Results\n\n");
        writeln!(md, "**Date:** {}\n", display_time(input.generated_at))
            .expect("write to string should not fail");
        md.push_str("---\n\n");

        if !snapshot.system_prompt.is_empty() {
            writeln!(md, "## System Prompt\n\n```\n{}\n```\n", snapshot.system_prompt)
                .expect("write to string should not fail");
        }

        if !snapshot.reference_documents.is_empty() {
            md.push_str("## Reference Documents\n\n");
            for doc in &snapshot.reference_documents {
                let status = if doc.enabled { "ENABLED" } else { "DISABLED" };
                writeln!(md, "### {} ({status})\n\n```\n{}\n```\n", doc.title, doc.content)
                    .expect("write to string should not fail");
            }
        }

        md.push_str("## Conversations\n\n");
        for id in self.providers_with_messages(input) {
            writeln!(md, "### {}\n", self.display_name(id))
                .expect("write to string should not fail");
            for item in interleave(input.messages(id), input.events(id)) {
                match item {
                    TranscriptItem::Message(m) => {
                        let speaker = match m.role {
                            Role::User => "User",
                            Role::Assistant => "Assistant",
                        };
                        writeln!(md, "**{speaker}:**\n\n{}\n\n---\n", m.content)
                            .expect("write to string should not fail");
                    }
                    TranscriptItem::Event(e) => {
                        writeln!(
                            md,
                            "> **Context Change** ({}): {}\n",
                            display_time(e.timestamp),
                            e.message
                        )
                        .expect("write to string should not fail");
                    }
                }
            }
        }
        md
    }

    fn render_comparison_table(&self, input: &ExportInput) -> String {
        let active: Vec<&str> = input
            .active_providers
            .iter()
            .map(String::as_str)
            .collect();
        let mut md = String::new();
        md.push_str("# ASHER A/B/C/D Test Results\n\n");
        writeln!(md, "**Date:** {}\n", display_time(input.generated_at))
            .expect("write to string should not fail");

        if !input.snapshot.system_prompt.is_empty() {
            writeln!(md, "## System Prompt\n```\n{}\n```\n", input.snapshot.system_prompt)
                .expect("write to string should not fail");
        }

        md.push_str("## Response Comparison\n\n");
        let names: Vec<&str> = active.iter().map(|id| self.display_name(id)).collect();
        writeln!(md, "| Prompt | {} |", names.join(" | "))
            .expect("write to string should not fail");
        writeln!(
            md,
            "|--------|{}|",
            vec!["--------"; active.len()].join("|")
        )
        .expect("write to string should not fail");

        let mut prompts: Vec<&str> = Vec::new();
        for id in &active {
            for m in input.messages(id).iter().filter(|m| m.role == Role::User) {
                if !prompts.contains(&m.content.as_str()) {
                    prompts.push(&m.content);
                }
            }
        }

        for prompt in prompts {
            let cells: Vec<String> = active
                .iter()
                .map(|id| {
                    let history = input.messages(id);
                    history
                        .iter()
                        .position(|m| m.role == Role::User && m.content == prompt)
                        .and_then(|i| history.get(i + 1))
                        .filter(|m| m.role == Role::Assistant)
                        .map_or_else(
                            || "_No response_".to_string(),
                            |reply| table_cell(&reply.content, TABLE_CELL_LIMIT),
                        )
                })
                .collect();
            writeln!(
                md,
                "| {} | {} |",
                table_cell(prompt, TABLE_PROMPT_LIMIT),
                cells.join(" | ")
            )
            .expect("write to string should not fail");
        }

        md.push_str("\n## Statistics\n\n");
        md.push_str("| Provider | Messages | Avg Response Time |\n");
        md.push_str("|----------|----------|-------------------|\n");
        for id in &active {
            let replies = input
                .messages(id)
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .count();
            let average = input
                .average_response_ms
                .get(*id)
                .map_or_else(|| "N/A".to_string(), |ms| format_seconds(*ms));
            writeln!(md, "| {} | {replies} | {average} |", self.display_name(id))
                .expect("write to string should not fail");
        }

        if !input.best_responses.is_empty() {
            md.push_str("\n## Best Responses\n\n");
            for best in &input.best_responses {
                writeln!(
                    md,
                    "### BEST: {}\n```\n{}\n```\n",
                    self.display_name(&best.provider_id),
                    truncate_chars(&best.content, BEST_RESPONSE_LIMIT)
                )
                .expect("write to string should not fail");
            }
        }
        md
    }
}
