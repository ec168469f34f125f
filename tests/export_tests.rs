use asher::conversation::Message;
use asher::export::{ExportFormat, ExportInput, Exporter};
use asher::persistence::{MemoryBlobStore, SessionPersistence};
use asher::session::{LabSession, ResponseStats};

fn compared_session() -> LabSession {
    let mut session = LabSession::default();
    session.set_system_prompt("Answer briefly.");
    let doc = session.documents_mut().add_blank().id;
    session
        .documents_mut()
        .update_content(doc, "Pricing sheet")
        .expect("content");
    session.documents_mut().toggle_enabled(doc).expect("toggle");

    let active = ["openai-gpt4.1".to_string(), "grok-4".to_string()];
    session.record_context_change(&active).expect("baseline");
    {
        let store = session.store_mut();
        store
            .append_message("openai-gpt4.1", Message::user("What | is\nit?"))
            .expect("append");
        store
            .append_message("openai-gpt4.1", Message::assistant("A pipe | and\nnewline"))
            .expect("append");
        store
            .append_message("grok-4", Message::user("What | is\nit?"))
            .expect("append");
    }
    session.record_stats("openai-gpt4.1", ResponseStats::success(10, 1500));
    session.record_stats("openai-gpt4.1", ResponseStats::success(10, 2500));

    session.set_system_prompt("Answer at length.");
    session.record_context_change(&active).expect("change");
    session
        .store_mut()
        .append_message("openai-gpt4.1", Message::user("Second"))
        .expect("append");
    session
}

fn input(session: &LabSession) -> ExportInput {
    ExportInput::from_session(
        session,
        &["openai-gpt4.1".to_string(), "grok-4".to_string()],
    )
}

#[test]
fn test_json_export_skips_empty_logs() {
    let session = compared_session();
    let json = Exporter::default()
        .render(ExportFormat::Json, &input(&session))
        .expect("render");
    let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

    assert_eq!(value["configuration"]["system_prompt"], "Answer at length.");
    assert_eq!(value["configuration"]["active_providers"][1], "grok-4");
    assert_eq!(value["configuration"]["reference_documents"][0]["enabled"], false);
    assert_eq!(value["conversations"]["openai-gpt4.1"].as_array().map(Vec::len), Some(3));
    assert!(value["conversations"].get("claude-opus-4.1").is_none());
    assert_eq!(value["events"]["grok-4"][0]["type"], "context_change");
    assert!(value["timestamp"].is_string());
}

#[test]
fn test_markdown_interleaves_context_changes() {
    let session = compared_session();
    let md = Exporter::default()
        .render(ExportFormat::Markdown, &input(&session))
        .expect("render");

    assert!(md.starts_with("# ASHER Test Results"));
    assert!(md.contains("### OpenAI GPT-4.1"));
    assert!(md.contains("(DISABLED)"));

    let reply = md.find("A pipe | and").expect("reply present");
    let change = md.find("> **Context Change**").expect("event present");
    let second = md.find("Second").expect("second prompt present");
    assert!(reply < change && change < second);
}

#[test]
fn test_plain_text_lists_messages_by_role() {
    let session = compared_session();
    let text = Exporter::default()
        .render(ExportFormat::PlainText, &input(&session))
        .expect("render");

    assert!(text.contains("SYSTEM PROMPT:\nAnswer at length."));
    assert!(text.contains("### xAI Grok 4 ###"));
    assert!(text.contains("[USER]\nSecond"));
    assert!(text.contains("[CONTEXT CHANGE - "));
}

#[test]
fn test_comparison_table_escapes_cells_and_reports_stats() {
    let mut session = compared_session();
    session.toggle_best("openai-gpt4.1", 1).expect("mark");
    let md = Exporter::default()
        .render(ExportFormat::ComparisonTable, &input(&session))
        .expect("render");

    assert!(md.contains("| Prompt | OpenAI GPT-4.1 | xAI Grok 4 |"));
    assert!(md.contains("|--------|--------|--------|"));
    assert!(md.contains("| What \\| is<br>it? | A pipe \\| and<br>newline | _No response_ |"));
    assert!(md.contains("| Second | _No response_ | _No response_ |"));
    assert!(md.contains("| OpenAI GPT-4.1 | 1 | 2.00s |"));
    assert!(md.contains("| xAI Grok 4 | 0 | N/A |"));
    assert!(md.contains("### BEST: OpenAI GPT-4.1\n```\nA pipe | and\nnewline\n```"));
}

#[test]
fn test_long_replies_are_truncated_in_table() {
    let mut session = LabSession::default();
    let long = "word ".repeat(100);
    let store = session.store_mut();
    store
        .append_message("grok-3", Message::user("q"))
        .expect("append");
    store
        .append_message("grok-3", Message::assistant(long.clone()))
        .expect("append");

    let md = Exporter::default()
        .render(
            ExportFormat::ComparisonTable,
            &ExportInput::from_session(&session, &["grok-3".to_string()]),
        )
        .expect("render");
    let truncated: String = long.chars().take(200).collect();
    assert!(md.contains(&format!("| q | {truncated}... |")));
}

#[test]
fn test_saved_conversation_export_uses_its_active_providers() {
    let mut persistence = SessionPersistence::new(MemoryBlobStore::new());
    let saved = persistence
        .save("Run", &compared_session())
        .expect("save")
        .value;

    let json = Exporter::default()
        .render(ExportFormat::Json, &ExportInput::from_saved(&saved))
        .expect("render");
    let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    let active = value["configuration"]["active_providers"]
        .as_array()
        .expect("array")
        .len();
    assert_eq!(active, 2);
}
