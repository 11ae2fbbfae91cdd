use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chatline_core::Role;
use chatline_sync::{ApiClient, ApiError};
use serde_json::json;

async fn list() -> impl IntoResponse {
    Json(json!([
        {
            "id": "c1",
            "title": "Greetings",
            "created_at": "2024-05-01T10:00:00",
            "messages": [
                {"id": 7, "role": "user", "conversation_id": "c1",
                 "content": [{"type": "text", "text": "hi"}], "meta_data": null},
                {"id": "m2", "role": "assistant", "conversation_id": "c1", "status": "complete",
                 "content": [{"type": "text", "text": "Hello"}]}
            ]
        },
        {"id": "c2", "title": null, "messages": []}
    ]))
}

async fn one(Path(id): Path<String>) -> impl IntoResponse {
    if id == "c1" {
        Json(json!({"id": "c1", "title": "Greetings", "messages": []})).into_response()
    } else if id == "boom" {
        (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable").into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"detail": "Conversation not found"}))).into_response()
    }
}

async fn settings() -> impl IntoResponse {
    Json(json!({"models": ["GPT-4", "Claude Haiku"]}))
}

async fn start_server() -> String {
    let app = Router::new()
        .route("/conversations", get(list))
        .route("/conversations/:id", get(one))
        .route("/settings", get(settings));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn lists_conversations_with_numeric_ids_and_null_meta() {
    let client = ApiClient::new(&start_server().await).expect("client");
    let conversations = client.list_conversations().await.expect("list");

    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[0].id, "c1");
    assert_eq!(conversations[0].messages[0].id, "7");
    assert_eq!(conversations[0].messages[0].role, Role::User);
    assert!(conversations[0].messages[0].meta_data.is_empty());
    assert_eq!(conversations[0].messages[1].text(), "Hello");
    assert!(conversations[1].messages.is_empty());
}

#[tokio::test]
async fn missing_conversation_is_none() {
    let client = ApiClient::new(&start_server().await).expect("client");

    let found = client.get_conversation("c1").await.expect("get");
    assert_eq!(found.map(|conversation| conversation.id), Some("c1".to_string()));

    let missing = client.get_conversation("nope").await.expect("get");
    assert!(missing.is_none());
}

#[tokio::test]
async fn server_failure_surfaces_status_and_body() {
    let client = ApiClient::new(&start_server().await).expect("client");
    match client.get_conversation("boom").await {
        Err(ApiError::UnexpectedStatus { status, body }) => {
            assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body, "database unavailable");
        }
        other => panic!("expected unexpected status, got {other:?}"),
    }
}

#[tokio::test]
async fn partial_settings_document_deserializes() {
    let client = ApiClient::new(&start_server().await).expect("client");
    let settings = client.get_settings().await.expect("settings");
    assert_eq!(settings.models, vec!["GPT-4", "Claude Haiku"]);
    assert_eq!(settings.model(), Some("GPT-4"));
}
