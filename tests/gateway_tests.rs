use asher::conversation::Message;
use asher::error::{LabError, TransportError, ValidationError};
use asher::gateway::{HttpGateway, ProviderGateway, SendRequest};
use mockito::Matcher;
use serde_json::json;
use tempfile::TempDir;

fn request(provider: &str) -> SendRequest {
    SendRequest {
        provider: provider.to_string(),
        message: "hello".to_string(),
        system_prompt: "Be terse.".to_string(),
        conversation_history: vec![Message::user("hello")],
        model: None,
        temperature: Some(1.0),
        api_key: None,
    }
}

#[tokio::test]
async fn test_send_posts_request_and_returns_reply() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/asher/test")
        .match_body(Matcher::PartialJson(json!({
            "provider": "grok-4",
            "message": "hello",
            "system_prompt": "Be terse.",
            "conversation_history": [{"role": "user", "content": "hello"}],
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"reply": "Hi there", "success": true}"#)
        .create_async()
        .await;

    let gateway = HttpGateway::new(&server.url()).expect("valid url");
    let reply = gateway.send(&request("grok-4")).await.expect("reply");

    assert_eq!(reply, "Hi there");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_non_success_status_uses_detail() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/asher/test")
        .with_status(400)
        .with_body(r#"{"detail": "Invalid provider"}"#)
        .create_async()
        .await;

    let gateway = HttpGateway::new(&server.url()).expect("valid url");
    let err = gateway
        .send(&request("grok-4"))
        .await
        .expect_err("bad status");

    assert!(matches!(
        err,
        TransportError::Status { status: 400, ref detail } if detail == "Invalid provider"
    ));
}

#[tokio::test]
async fn test_success_false_and_missing_reply_are_failures() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/asher/test")
        .match_body(Matcher::PartialJson(json!({"provider": "grok-3"})))
        .with_status(200)
        .with_body(r#"{"success": false, "error": "quota exhausted"}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/asher/test")
        .match_body(Matcher::PartialJson(json!({"provider": "grok-4"})))
        .with_status(200)
        .with_body(r#"{"success": true}"#)
        .create_async()
        .await;

    let gateway = HttpGateway::new(&server.url()).expect("valid url");

    let provider_error = gateway.send(&request("grok-3")).await.expect_err("failed");
    assert_eq!(provider_error.to_string(), "quota exhausted");

    let missing = gateway.send(&request("grok-4")).await.expect_err("no reply");
    assert!(matches!(missing, TransportError::MalformedResponse(_)));
}

#[tokio::test]
async fn test_list_providers_retries_then_succeeds() {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("GET", "/providers")
        .with_status(503)
        .create_async()
        .await;

    let gateway = HttpGateway::new(&server.url()).expect("valid url");
    // Every attempt fails while only the 503 mock exists
    assert!(gateway.list_providers().await.is_err());
    failing.remove_async().await;

    server
        .mock("GET", "/providers")
        .with_status(200)
        .with_body(
            r#"{"providers": [
                {"id": "grok-4", "name": "xAI Grok 4", "available": true},
                {"id": "gemini-2.5-pro", "name": "Gemini 2.5 Pro", "available": false, "error": "missing key"}
            ]}"#,
        )
        .create_async()
        .await;

    let statuses = gateway.list_providers().await.expect("statuses");
    assert_eq!(statuses.len(), 2);
    assert!(statuses[0].available);
    assert_eq!(statuses[1].error.as_deref(), Some("missing key"));
}

#[tokio::test]
async fn test_upload_sends_multipart_file() {
    let dir = TempDir::new().expect("Failed to create temporary directory");
    let path = dir.path().join("brief.txt");
    std::fs::write(&path, "Quarterly numbers").expect("Failed to write file");

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/upload/document")
        .match_header(
            "content-type",
            Matcher::Regex("multipart/form-data.*".to_string()),
        )
        .match_body(Matcher::Regex("brief.txt".to_string()))
        .with_status(200)
        .with_body(r#"{"filename": "brief.txt", "content": "Quarterly numbers", "file_type": "txt"}"#)
        .create_async()
        .await;

    let gateway = HttpGateway::new(&server.url()).expect("valid url");
    let uploaded = gateway.upload_document(&path).await.expect("uploaded");

    assert_eq!(uploaded.filename, "brief.txt");
    assert_eq!(uploaded.content, "Quarterly numbers");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_upload_rejects_unsupported_extension_before_request() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/upload/document")
        .expect(0)
        .create_async()
        .await;

    let gateway = HttpGateway::new(&server.url()).expect("valid url");
    let err = gateway
        .upload_document(std::path::Path::new("diagram.svg"))
        .await
        .expect_err("unsupported");

    assert!(matches!(
        err,
        LabError::Validation(ValidationError::UnsupportedDocumentType { .. })
    ));
    mock.assert_async().await;
}

#[test]
fn test_invalid_base_url_is_rejected() {
    assert!(matches!(
        HttpGateway::new("not a url"),
        Err(LabError::Validation(ValidationError::InvalidUrl { .. }))
    ));
}
