use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chatrelay_core_sdk::prelude::*;

/// Spins up the relay on an ephemeral port in front of `upstream`.
async fn start_relay(upstream: &MockServer) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = UpstreamClient::new(&upstream.uri(), Duration::from_secs(5)).expect("client");
    tokio::spawn(server::serve(listener, server::AppState::new(client)));
    format!("http://{addr}/v1")
}

fn delta(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices":[{"index":0,"delta":{"content":text}}]})
    )
}

#[tokio::test]
async fn test_client_through_relay_accumulates_reply() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-e2e"))
        .and(body_partial_json(json!({"model": "qwen", "stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            format!("{}{}{}data: [DONE]\n\n", delta("Rust "), delta("is "), delta("fun")),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&upstream)
        .await;

    let relay = start_relay(&upstream).await;
    let storage = Storage::in_memory().expect("storage");
    let mut client = ChatClient::new(
        storage.clone(),
        UpstreamClient::new(&relay, Duration::from_secs(5)).expect("relay client"),
    );
    client.settings.set_api_key("sk-e2e");
    client
        .settings
        .set_model_config(&ModelConfigPatch {
            model: Some("qwen".into()),
            ..Default::default()
        })
        .expect("config");

    let mut streamed = String::new();
    let outcome = client
        .send_message("what is rust like?", |d| streamed.push_str(d))
        .await
        .expect("turn");
    assert_eq!(outcome, TurnOutcome::Completed);
    assert_eq!(streamed, "Rust is fun");

    let session = client.chat.current_session().expect("session");
    assert_eq!(session.title, "Rust is fun");
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[1].role, Role::Assistant);
    assert!(session.messages[1].response_time_ms.is_some());

    let reloaded = ChatStore::load(storage);
    assert_eq!(reloaded.sessions(), client.chat.sessions());
}

#[tokio::test]
async fn test_upstream_rejection_reaches_client_as_error() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "invalid api key"}})),
        )
        .mount(&upstream)
        .await;

    let relay = start_relay(&upstream).await;
    let mut client = ChatClient::new(
        Storage::in_memory().expect("storage"),
        UpstreamClient::new(&relay, Duration::from_secs(5)).expect("relay client"),
    );
    client.settings.set_api_key("sk-wrong");

    let outcome = client.send_message("hello", |_| {}).await.expect("turn");
    assert!(matches!(outcome, TurnOutcome::Failed(_)));
    assert_eq!(client.chat.error(), Some("invalid api key"));
    let session = client.chat.current_session().expect("session");
    assert_eq!(session.messages.len(), 1);
    assert!(!client.chat.is_streaming());
}

#[tokio::test]
async fn test_models_through_relay_fall_back_to_defaults() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    let relay = start_relay(&upstream).await;
    let client = UpstreamClient::new(&relay, Duration::from_secs(5)).expect("relay client");
    let ids: Vec<_> = client
        .list_models("sk")
        .await
        .expect("relay always answers")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["gpt-3.5-turbo", "gpt-4"]);
}
