mod support;

use serde_json::json;
use shared::models::PartKind;
use uuid::Uuid;

use support::chat_app::{TestChatServer, answer_text, read_turn, send_frame, send_raw};
use support::stubs::{ModelReply, ScriptedGateway};

#[tokio::test]
async fn three_turn_conversation_recalls_questions_over_socket() {
    let gateway = ScriptedGateway::new(vec![ModelReply::Deltas(vec![
        "The CS program ",
        "is four years.",
    ])]);
    let server = TestChatServer::start(gateway.clone()).await;
    let mut socket = server.connect().await;

    send_frame(
        &mut socket,
        json!({"query": "Tell me about the CS program", "session_id": "e2e-1", "message_id": 1}),
    )
    .await;
    let first = read_turn(&mut socket).await;
    assert_eq!(answer_text(&first), "The CS program is four years.");
    assert!(first.iter().all(|message| message.message_id == Some(json!(1))));
    assert!(first.iter().all(|message| message.session_id == "e2e-1"));
    assert_eq!(first.iter().filter(|message| message.is_last).count(), 1);

    send_frame(
        &mut socket,
        json!({"query": "What was my previous question?", "session_id": "e2e-1", "message_id": 2}),
    )
    .await;
    let second = read_turn(&mut socket).await;
    assert_eq!(
        answer_text(&second),
        "Your previous question was: 'Tell me about the CS program'"
    );

    send_frame(
        &mut socket,
        json!({"query": "What was my last question?", "session_id": "e2e-1", "message_id": 3}),
    )
    .await;
    let third = read_turn(&mut socket).await;
    assert_eq!(
        answer_text(&third),
        "Your previous question was: 'What was my previous question?'"
    );

    assert_eq!(gateway.requests().await.len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn generated_session_id_is_echoed_and_reusable_on_new_connection() {
    let gateway = ScriptedGateway::new(vec![ModelReply::Deltas(vec!["Admissions open in May."])]);
    let server = TestChatServer::start(gateway).await;

    let mut socket = server.connect().await;
    send_frame(
        &mut socket,
        json!({"query": "When do admissions open?", "message_id": "a"}),
    )
    .await;
    let first = read_turn(&mut socket).await;
    let session_id = first[0].session_id.clone();
    let parsed = Uuid::parse_str(&session_id).expect("server issues a uuid session id");
    assert_eq!(parsed.get_version_num(), 4);
    assert!(first.iter().all(|message| message.session_id == session_id));

    send_frame(
        &mut socket,
        json!({"query": "what did i ask", "message_id": "b"}),
    )
    .await;
    let same_connection = read_turn(&mut socket).await;
    assert_eq!(same_connection[0].session_id, session_id);
    drop(socket);

    let mut reconnected = server.connect().await;
    send_frame(
        &mut reconnected,
        json!({"query": "My previous one?", "session_id": session_id, "message_id": "c"}),
    )
    .await;
    let recalled = read_turn(&mut reconnected).await;
    assert_eq!(
        answer_text(&recalled),
        "Your previous question was: 'what did i ask'"
    );
    assert_eq!(recalled[0].session_id, session_id);

    server.stop().await;
}

#[tokio::test]
async fn model_failure_yields_single_final_error_without_memory_write() {
    let gateway = ScriptedGateway::new(vec![ModelReply::Fail("status=503 code=overloaded")]);
    let server = TestChatServer::start(gateway).await;
    let mut socket = server.connect().await;

    send_frame(
        &mut socket,
        json!({"query": "Tell me about hostel fees", "session_id": "fail-1", "message_id": 9}),
    )
    .await;
    let turn = read_turn(&mut socket).await;
    assert_eq!(turn.len(), 1);
    assert_eq!(turn[0].kind, PartKind::Error);
    assert!(turn[0].is_last);
    assert!(turn[0].content.starts_with("Error processing query: "));
    assert_eq!(turn[0].message_id, Some(json!(9)));

    let history = server.pipeline.memory().get_memory("fail-1").history().await;
    assert!(history.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn malformed_frames_get_final_error_and_connection_stays_usable() {
    let gateway = ScriptedGateway::new(vec![ModelReply::Deltas(vec!["Fine."])]);
    let server = TestChatServer::start(gateway.clone()).await;
    let mut socket = server.connect().await;

    send_raw(&mut socket, "this is not json").await;
    let invalid = read_turn(&mut socket).await;
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].kind, PartKind::Error);
    assert_eq!(invalid[0].content, "Invalid JSON format");
    assert!(invalid[0].is_last);

    send_frame(&mut socket, json!({"query": "   ", "message_id": 4})).await;
    let missing = read_turn(&mut socket).await;
    assert_eq!(missing[0].content, "No query provided");
    assert_eq!(missing[0].message_id, Some(json!(4)));
    assert!(missing[0].is_last);
    assert!(gateway.requests().await.is_empty());

    send_frame(&mut socket, json!({"query": "How are you?", "message_id": 5})).await;
    let answered = read_turn(&mut socket).await;
    assert_eq!(answer_text(&answered), "Fine.");
    server.stop().await;
}

#[tokio::test]
async fn escalation_request_returns_marker_for_ui() {
    let server = TestChatServer::start(ScriptedGateway::default()).await;
    let mut socket = server.connect().await;

    send_frame(
        &mut socket,
        json!({"query": "Can I raise a ticket?", "session_id": "esc-1", "message_id": 1}),
    )
    .await;
    let turn = read_turn(&mut socket).await;
    assert_eq!(answer_text(&turn), "{{RAISE_QUERY}}");
    assert_eq!(turn[0].kind, PartKind::Response);
    server.stop().await;
}
