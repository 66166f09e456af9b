mod support;

use std::time::Duration;

use chat_client::{ChatClient, ChatClientConfig, ClientError};
use futures::{StreamExt, TryStreamExt};
use shared::models::ChatRequest;

use support::chat_app::TestChatServer;
use support::stubs::{ModelReply, ScriptedGateway};

fn query(text: &str) -> ChatRequest {
    ChatRequest {
        query: Some(text.to_string()),
        ..ChatRequest::default()
    }
}

#[tokio::test]
async fn client_streams_answers_and_reuses_issued_session() {
    let gateway = ScriptedGateway::new(vec![ModelReply::Deltas(vec!["Fees are ", "listed online."])]);
    let server = TestChatServer::start(gateway).await;
    let client = ChatClient::start(ChatClientConfig::new(server.ws_url.clone()));

    let answer: String = client
        .stream_response(query("What are the fees?"))
        .await
        .expect("request should queue")
        .try_collect()
        .await
        .expect("answer should stream");
    assert_eq!(answer, "Fees are listed online.");
    let session_id = client.session_id().expect("server should issue a session id");

    let recall: String = client
        .stream_response(query("What was my previous question?"))
        .await
        .expect("request should queue")
        .try_collect()
        .await
        .expect("recall should stream");
    assert_eq!(recall, "Your previous question was: 'What are the fees?'");
    assert_eq!(client.session_id(), Some(session_id));

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn client_marks_final_message_per_request() {
    let gateway = ScriptedGateway::new(vec![ModelReply::Deltas(vec!["a", "b", "c"])]);
    let server = TestChatServer::start(gateway).await;
    let client = ChatClient::start(ChatClientConfig::new(server.ws_url.clone()));

    let responses = client
        .send(query("Spell something"))
        .await
        .expect("request should queue");
    let message_id = responses.message_id();
    let messages = responses
        .try_collect::<Vec<_>>()
        .await
        .expect("messages should stream");

    assert_eq!(messages.len(), 3);
    assert!(messages[..2].iter().all(|message| !message.is_last));
    assert!(messages[2].is_last);
    assert!(
        messages
            .iter()
            .all(|message| message.message_id == Some(serde_json::Value::from(message_id)))
    );

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn model_error_surfaces_as_server_error() {
    let server = TestChatServer::start(ScriptedGateway::new(vec![ModelReply::Fail("boom")])).await;
    let client = ChatClient::start(ChatClientConfig::new(server.ws_url.clone()));

    let mut chunks = client
        .stream_response(query("Tell me about scholarships"))
        .await
        .expect("request should queue");
    let err = chunks
        .next()
        .await
        .expect("one item")
        .expect_err("model failure should be an error");
    assert!(matches!(err, ClientError::Server(ref content) if content.starts_with("Error processing query")));
    assert!(chunks.next().await.is_none());

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn requests_fail_fast_while_server_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener address");
    drop(listener);

    let mut config = ChatClientConfig::new(format!("ws://{addr}/chat"));
    config.reconnect_base_delay = Duration::from_millis(500);
    let client = ChatClient::start(config);

    let outcome = client
        .send(query("Anyone there?"))
        .await
        .expect("request should queue")
        .next()
        .await
        .expect("one item");
    assert_eq!(outcome.expect_err("no server"), ClientError::NotConnected);

    client.shutdown().await;
}
