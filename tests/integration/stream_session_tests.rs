use std::time::Duration;

use agent_tether::client::BackendClient;
use agent_tether::stream::{FormResponse, SessionUpdate, StreamEvent, StreamSession, TurnPhase};

use super::test_helpers::{
    collect_turn, done, eventually, next_update, server_error, text, MockBackend, Script,
    SEAL_FAILS,
};
use agent_tether::stream::codec::MAX_LINE_BYTES;

fn chunk(data: &str) -> SessionUpdate {
    SessionUpdate::Event(StreamEvent::TextChunk { data: data.into() })
}

#[tokio::test]
async fn completed_turn_adopts_header_session() {
    let mock = MockBackend::start().await;
    mock.push(Script::fixed(Some("abc"), [text("Hi"), text("!"), done()]));

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    assert_eq!(session.phase(), TurnPhase::Idle);
    let g = session.send("hello");
    assert_eq!(g, 1);

    let turn = collect_turn(&mut updates).await;
    assert_eq!(
        turn,
        vec![
            chunk("Hi"),
            chunk("!"),
            SessionUpdate::Event(StreamEvent::Done),
            SessionUpdate::TurnCompleted {
                session_id: Some("abc".into())
            },
        ]
    );
    assert_eq!(session.session_id().as_deref(), Some("abc"));
    assert_eq!(session.phase(), TurnPhase::Completed);

    let requests = mock.state.stream_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].message, "hello");
    assert_eq!(requests[0].session_id, None);
}

#[tokio::test]
async fn follow_up_turn_sends_session_id() {
    let mock = MockBackend::start().await;
    mock.push(Script::fixed(Some("abc"), [text("one"), done()]));
    mock.push(Script::fixed(Some("abc"), [text("two"), done()]));

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    session.send("first");
    collect_turn(&mut updates).await;
    session.send("second");
    collect_turn(&mut updates).await;

    let requests = mock.state.stream_requests();
    assert_eq!(requests[1].session_id.as_deref(), Some("abc"));
}

#[tokio::test]
async fn stream_without_done_marker_still_completes() {
    let mock = MockBackend::start().await;
    mock.push(Script::fixed(Some("abc"), [text("partial")]));

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    session.send("hello");

    let turn = collect_turn(&mut updates).await;
    assert_eq!(
        turn.last(),
        Some(&SessionUpdate::TurnCompleted {
            session_id: Some("abc".into())
        })
    );
}

#[tokio::test]
async fn malformed_lines_are_skipped() {
    let mock = MockBackend::start().await;
    mock.push(Script::fixed(
        Some("abc"),
        ["data: {broken".to_owned(), ": keep-alive".to_owned(), text("ok"), done()],
    ));

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    session.send("hello");

    let turn = collect_turn(&mut updates).await;
    assert_eq!(turn[0], chunk("ok"));
    assert_eq!(session.phase(), TurnPhase::Completed);
}

#[tokio::test]
async fn oversized_line_is_skipped_and_turn_continues() {
    let mock = MockBackend::start().await;
    let huge = format!("data: {}", "x".repeat(MAX_LINE_BYTES + 50_000));
    mock.push(Script::fixed(Some("abc"), [text("a"), huge, text("b"), done()]));

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    session.send("hello");

    let turn = collect_turn(&mut updates).await;
    assert_eq!(
        turn,
        vec![
            chunk("a"),
            chunk("b"),
            SessionUpdate::Event(StreamEvent::Done),
            SessionUpdate::TurnCompleted {
                session_id: Some("abc".into())
            },
        ]
    );
    assert_eq!(session.phase(), TurnPhase::Completed);
}

#[tokio::test]
async fn cancel_reports_stopped_even_when_seal_fails() {
    let mock = MockBackend::start().await;
    let (script, tx) = Script::open(Some(SEAL_FAILS));
    mock.push(script);
    tx.send(text("partial")).expect("stream open");

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    session.send("hello");
    assert_eq!(next_update(&mut updates).await, chunk("partial"));

    assert!(session.cancel());
    assert_eq!(
        next_update(&mut updates).await,
        SessionUpdate::Stopped {
            context_preserved: true
        }
    );

    let state = &mock.state;
    eventually("seal attempt", || state.sealed() == vec![SEAL_FAILS.to_owned()]).await;

    // A rejected seal is logged only; no failure reaches the consumer.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), updates.recv())
            .await
            .is_err()
    );
    assert_eq!(session.session_id().as_deref(), Some(SEAL_FAILS));
    assert_eq!(session.phase(), TurnPhase::Cancelled);
}

#[tokio::test]
async fn cancel_seals_and_preserves_context() {
    let mock = MockBackend::start().await;
    let (script, tx) = Script::open(Some("abc"));
    mock.push(script);
    tx.send(text("Hel")).expect("stream open");

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    let g = session.send("hello");
    assert_eq!(next_update(&mut updates).await, chunk("Hel"));
    assert_eq!(session.phase(), TurnPhase::Streaming);

    assert!(session.cancel());
    assert!(session.generation() > g);
    assert_eq!(session.phase(), TurnPhase::Cancelled);
    assert_eq!(
        next_update(&mut updates).await,
        SessionUpdate::Stopped {
            context_preserved: true
        }
    );
    assert_eq!(session.session_id().as_deref(), Some("abc"));

    // Late output of the cancelled turn never surfaces.
    let _ = tx.send(text("lo"));
    let _ = tx.send(done());
    assert!(
        tokio::time::timeout(Duration::from_millis(300), updates.recv())
            .await
            .is_err()
    );

    let state = &mock.state;
    eventually("seal request", || state.sealed() == vec!["abc".to_owned()]).await;

    mock.push(Script::fixed(Some("abc"), [text("again"), done()]));
    session.send("continue");
    let turn = collect_turn(&mut updates).await;
    assert_eq!(turn[0], chunk("again"));
    assert_eq!(
        mock.state.stream_requests()[1].session_id.as_deref(),
        Some("abc")
    );
}

#[tokio::test]
async fn cancel_without_active_turn_is_a_no_op() {
    let mock = MockBackend::start().await;
    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));

    assert!(!session.cancel());
    assert_eq!(session.generation(), 0);
    assert_eq!(session.phase(), TurnPhase::Idle);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), updates.recv())
            .await
            .is_err()
    );
    assert!(mock.state.sealed().is_empty());
}

#[tokio::test]
async fn cancel_before_any_session_does_not_seal() {
    let mock = MockBackend::start().await;
    let (script, tx) = Script::open(None);
    mock.push(script);
    tx.send(text("x")).expect("stream open");

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    session.send("hello");
    assert_eq!(next_update(&mut updates).await, chunk("x"));

    assert!(session.cancel());
    assert_eq!(
        next_update(&mut updates).await,
        SessionUpdate::Stopped {
            context_preserved: false
        }
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(mock.state.sealed().is_empty());
}

#[tokio::test]
async fn second_send_supersedes_first_turn() {
    let mock = MockBackend::start().await;
    let (first, tx) = Script::open(Some("abc"));
    mock.push(first);
    tx.send(text("first")).expect("stream open");

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    let g1 = session.send("one");
    assert_eq!(next_update(&mut updates).await, chunk("first"));

    mock.push(Script::fixed(Some("abc"), [text("second"), done()]));
    let g2 = session.send("two");
    assert_eq!(g2, g1 + 1);
    assert_eq!(session.generation(), g2);

    let _ = tx.send(text("stale"));
    let _ = tx.send(done());

    let turn = collect_turn(&mut updates).await;
    let chunks: Vec<_> = turn
        .iter()
        .filter_map(|u| match u {
            SessionUpdate::Event(StreamEvent::TextChunk { data }) => Some(data.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec!["second"]);
    assert!(mock.state.sealed().is_empty());
}

#[tokio::test]
async fn clear_deletes_session_and_starts_fresh() {
    let mock = MockBackend::start().await;
    mock.push(Script::fixed(Some("abc"), [text("Hi"), done()]));
    mock.push(Script::fixed(Some("def"), [text("new"), done()]));

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    session.send("hello");
    collect_turn(&mut updates).await;

    session.clear();
    assert_eq!(next_update(&mut updates).await, SessionUpdate::Cleared);
    assert_eq!(session.session_id(), None);
    let state = &mock.state;
    eventually("delete request", || state.deleted() == vec!["abc".to_owned()]).await;

    session.send("again");
    collect_turn(&mut updates).await;
    assert_eq!(mock.state.stream_requests()[1].session_id, None);
    assert_eq!(session.session_id().as_deref(), Some("def"));
}

#[tokio::test]
async fn clear_without_session_only_notifies() {
    let mock = MockBackend::start().await;
    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));

    session.clear();
    assert_eq!(next_update(&mut updates).await, SessionUpdate::Cleared);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mock.state.deleted().is_empty());
}

#[tokio::test]
async fn server_error_event_fails_the_turn() {
    let mock = MockBackend::start().await;
    mock.push(Script::fixed(Some("abc"), [server_error("rate limited")]));

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    session.send("hello");

    let turn = collect_turn(&mut updates).await;
    assert_eq!(
        turn.last(),
        Some(&SessionUpdate::TurnFailed {
            message: "rate limited".into()
        })
    );
    assert_eq!(session.phase(), TurnPhase::Errored);
}

#[tokio::test]
async fn http_failure_fails_the_turn() {
    let mock = MockBackend::start().await;
    // No script queued: the mock answers 500.
    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    session.send("hello");

    match next_update(&mut updates).await {
        SessionUpdate::TurnFailed { message } => assert!(message.starts_with("stream:")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(session.phase(), TurnPhase::Errored);
}

#[tokio::test]
async fn form_response_is_sent_as_a_message() {
    let mock = MockBackend::start().await;
    mock.push(Script::fixed(Some("abc"), [text("thanks"), done()]));

    let (session, mut updates) = StreamSession::new(BackendClient::fixed(&mock.url));
    let response = FormResponse::new("ab12cd34", "success").with_value("ip", "10.0.0.1");
    session.respond_to_form(&response);
    collect_turn(&mut updates).await;

    assert_eq!(
        mock.state.stream_requests()[0].message,
        "[Form response form_id=ab12cd34]\nchoice: success\nip: 10.0.0.1"
    );
}

#[tokio::test]
async fn ask_adopts_returned_session() {
    let mock = MockBackend::start().await;
    let (session, _updates) = StreamSession::new(BackendClient::fixed(&mock.url));

    let reply = session.ask("ping").await.expect("chat reply");
    assert_eq!(reply.reply, "echo: ping");
    assert_eq!(session.session_id().as_deref(), Some("chat-session"));
    assert_eq!(session.generation(), 0);
}
