//! HTTP contract tests for `HttpBackend` against a mock server.
//!
//! Covers:
//! - submit: conversation id extraction, missing id, non-2xx
//! - status: snapshot parsing, 404 / empty body as "no snapshot", 5xx classification

use mockito::{Matcher, Server};
use serde_json::json;
use weft_api::{
    Backend, ConversationStatus, Error, HttpBackend, HttpBackendConfig, QueryRequest, TaskStatus,
};

fn backend_for(server: &Server) -> HttpBackend {
    HttpBackend::new(HttpBackendConfig {
        base_url: server.url(),
        ..Default::default()
    })
    .expect("valid config")
}

#[tokio::test]
async fn test_submit_query_returns_conversation_id() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/query")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({"query": "compare the two reports"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"conversation_id": "conv-1", "status": "pending"}).to_string())
        .create_async()
        .await;

    let accepted = backend_for(&server)
        .submit_query(&QueryRequest::new("compare the two reports"))
        .await
        .expect("submit failed");

    assert_eq!(accepted.conversation_id, "conv-1");
    assert_eq!(accepted.status, Some(ConversationStatus::Pending));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_submit_query_forwards_existing_conversation() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/query")
        .match_body(Matcher::PartialJson(json!({"conversation_id": "conv-9"})))
        .with_status(200)
        .with_body(json!({"conversationId": "conv-9"}).to_string())
        .create_async()
        .await;

    let accepted = backend_for(&server)
        .submit_query(&QueryRequest::new("and now in French").in_conversation("conv-9"))
        .await
        .unwrap();

    assert_eq!(accepted.conversation_id, "conv-9");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_submit_without_conversation_id_is_an_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/query")
        .with_status(200)
        .with_body(json!({"status": "pending"}).to_string())
        .create_async()
        .await;

    let err = backend_for(&server)
        .submit_query(&QueryRequest::new("q"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingConversationId));
}

#[tokio::test]
async fn test_submit_server_error_is_api_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/query")
        .with_status(400)
        .with_body("query must not be empty")
        .create_async()
        .await;

    let err = backend_for(&server)
        .submit_query(&QueryRequest::new(""))
        .await
        .unwrap_err();

    match err {
        Error::Api { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("must not be empty"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_fetch_status_parses_snapshot() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/status/conv-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "conversation_id": "conv-1",
                "status": "processing",
                "tasks": [
                    {"id": "t1", "role": "analyst", "description": "Read report A", "status": "processing"}
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let snapshot = backend_for(&server)
        .fetch_status("conv-1")
        .await
        .unwrap()
        .expect("snapshot expected");

    assert_eq!(snapshot.status, ConversationStatus::Processing);
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Processing);
    assert_eq!(snapshot.raw()["tasks"][0]["id"], "t1");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_fetch_status_not_found_is_none() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/status/unknown")
        .with_status(404)
        .create_async()
        .await;

    let snapshot = backend_for(&server).fetch_status("unknown").await.unwrap();
    assert!(snapshot.is_none());
}

#[tokio::test]
async fn test_fetch_status_empty_body_is_none() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/status/c")
        .with_status(200)
        .with_body("")
        .create_async()
        .await;

    assert!(backend_for(&server).fetch_status("c").await.unwrap().is_none());
}

#[tokio::test]
async fn test_fetch_status_server_error_is_retryable() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/status/c")
        .with_status(503)
        .with_body("upstream unavailable")
        .create_async()
        .await;

    let err = backend_for(&server).fetch_status("c").await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_fetch_status_invalid_json_is_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/status/c")
        .with_status(200)
        .with_body("<html>gateway</html>")
        .create_async()
        .await;

    let err = backend_for(&server).fetch_status("c").await.unwrap_err();
    assert!(matches!(err, Error::Json(_)));
}
