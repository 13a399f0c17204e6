//! Full question flow: polling handshake on a mock HTTP server, then the
//! upgraded channel against a local WebSocket server.

use std::time::Duration;

use askline_core::{AskError, ClientConfig, QueryEngine, Reference};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OPEN_PACKET: &str = r#"0{"sid":"abc123","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

#[derive(Debug, Default)]
struct UpgradeSeen {
    uri: String,
    cookie: Option<String>,
    user_agent: Option<String>,
    client_name: Option<String>,
}

#[derive(Debug, Default)]
struct Transcript {
    queries: Vec<String>,
    saw_pong: bool,
}

async fn mount_polling(server: &MockServer, auth_reply: &str) {
    Mock::given(method("GET"))
        .and(path("/socket.io/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(OPEN_PACKET)
                .insert_header("set-cookie", "AWSALB=xyz; Path=/"),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/socket.io/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(auth_reply))
        .mount(server)
        .await;
}

fn config_for(server: &MockServer, ws_port: u16) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.service.base_url = server.uri();
    config.service.websocket_url = Some(format!("ws://127.0.0.1:{ws_port}/socket.io/"));
    config
}

async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, UpgradeSeen) {
    let (stream, _) = listener.accept().await.unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();
    let callback = move |req: &Request, response: Response| {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let _ = seen_tx.send(UpgradeSeen {
            uri: req.uri().to_string(),
            cookie: header("cookie"),
            user_agent: header("user-agent"),
            client_name: header("x-client-name"),
        });
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
    (ws, seen_rx.await.unwrap())
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Option<String> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

fn is_query(frame: &str) -> bool {
    let body = frame.trim_start_matches(|c: char| c.is_ascii_digit());
    body.len() < frame.len() && body.starts_with(r#"["perplexity_ask""#)
}

fn completed_frame(answer: &str, refs: Value) -> String {
    let nested = json!({"answer": answer, "web_results": refs}).to_string();
    let steps = json!([
        {"step_type": "INITIAL_QUERY", "content": {"query": "q"}},
        {"step_type": "FINAL", "content": {"answer": nested}},
    ])
    .to_string();
    let payload = json!({"final": true, "status": "COMPLETED", "text": steps});
    format!("42{}", json!(["query_answered", payload]))
}

/// Plays the server side of one upgraded connection. `answer` of `None`
/// never replies to the query.
async fn serve_one(mut ws: WebSocketStream<TcpStream>, answer: Option<String>) -> Transcript {
    let mut transcript = Transcript::default();

    assert_eq!(next_text(&mut ws).await.as_deref(), Some("2probe"));
    ws.send(Message::Text("3probe".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some("5"));
    ws.send(Message::Text("2".into())).await.unwrap();

    while let Some(frame) = next_text(&mut ws).await {
        if frame == "3" {
            transcript.saw_pong = true;
        } else if is_query(&frame) {
            transcript.queries.push(frame);
            break;
        }
    }

    let progress = format!(
        "42{}",
        json!(["query_progress", {"status": "PENDING", "final": false}])
    );
    ws.send(Message::Text(progress.into())).await.unwrap();
    ws.send(Message::Text("not a frame".into())).await.unwrap();
    if let Some(answer) = answer {
        ws.send(Message::Text(answer.into())).await.unwrap();
    }

    while let Some(frame) = next_text(&mut ws).await {
        if frame == "3" {
            transcript.saw_pong = true;
        }
    }
    transcript
}

#[tokio::test]
async fn test_ask_end_to_end() {
    let server = MockServer::start().await;
    mount_polling(&server, "OK").await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let answer = completed_frame("Paris", json!([{"name": "Wiki", "url": "http://x"}]));
    let ws_server = tokio::spawn(async move {
        let (ws, seen) = accept(&listener).await;
        (seen, serve_one(ws, Some(answer)).await)
    });

    let mut engine = QueryEngine::new(config_for(&server, port)).unwrap();
    let reply = engine.ask_answer("What is the capital of France?").await.unwrap();

    assert_eq!(reply.error(), None);
    assert_eq!(reply.answer.text, "Paris");
    assert_eq!(
        reply.answer.references,
        vec![Reference {
            name: "Wiki".into(),
            url: "http://x".into()
        }]
    );
    assert_eq!(reply.fragments.len(), 2);

    let (seen, transcript) = tokio::time::timeout(Duration::from_secs(5), ws_server)
        .await
        .unwrap()
        .unwrap();
    assert!(seen.uri.contains("transport=websocket"), "{}", seen.uri);
    assert!(seen.uri.contains("sid=abc123"), "{}", seen.uri);
    assert!(seen.uri.contains("EIO=4"), "{}", seen.uri);
    assert_eq!(seen.cookie.as_deref(), Some("AWSALB=xyz"));
    assert_eq!(
        seen.user_agent.as_deref(),
        Some(askline_core::config::DEFAULT_USER_AGENT)
    );
    assert_eq!(seen.client_name.as_deref(), Some("Perplexity-iOS"));
    assert!(transcript.saw_pong);

    let query = &transcript.queries[0];
    assert!(query.starts_with(r#"422["perplexity_ask","What is the capital of France?","#));
    let args: Value = serde_json::from_str(&query[3..]).unwrap();
    assert_eq!(args[2]["mode"], "concise");
    assert_eq!(args[2]["language"], "en-GB");
}

#[tokio::test]
async fn test_sequence_advances_across_queries() {
    let server = MockServer::start().await;
    mount_polling(&server, "OK").await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let ws_server = tokio::spawn(async move {
        let mut queries = Vec::new();
        for answer in ["first", "second"] {
            let (ws, _) = accept(&listener).await;
            let transcript = serve_one(ws, Some(completed_frame(answer, json!([])))).await;
            queries.extend(transcript.queries);
        }
        queries
    });

    let mut engine = QueryEngine::new(config_for(&server, port)).unwrap();
    let first = engine.ask_answer("one").await.unwrap();
    let second = engine.ask_answer("two").await.unwrap();
    assert_eq!(first.answer.text, "first");
    assert_eq!(second.answer.text, "second");
    assert_eq!(engine.sequence().current(), 423);

    let queries = tokio::time::timeout(Duration::from_secs(5), ws_server)
        .await
        .unwrap()
        .unwrap();
    assert!(queries[0].starts_with("422["));
    assert!(queries[1].starts_with("423["));
}

#[tokio::test]
async fn test_unanswered_query_times_out() {
    let server = MockServer::start().await;
    mount_polling(&server, "OK").await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let ws_server = tokio::spawn(async move {
        let (ws, _) = accept(&listener).await;
        serve_one(ws, None).await
    });

    let mut config = config_for(&server, port);
    config.query.answer_timeout_secs = 1;
    let mut engine = QueryEngine::new(config).unwrap();
    let reply = engine.ask_answer("slow question").await.unwrap();

    assert_eq!(reply.error(), Some("Timed out."));
    assert!(reply.answer.is_empty());
    let last = reply.fragments.last().unwrap();
    assert_eq!(last.payload, json!({"error": "Timed out."}));
    assert_eq!(reply.fragments.len(), 2);

    // The stream closes the channel once it gives up.
    let transcript = tokio::time::timeout(Duration::from_secs(5), ws_server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transcript.queries.len(), 1);
}

#[tokio::test]
async fn test_auth_failure_never_opens_channel() {
    let server = MockServer::start().await;
    mount_polling(&server, "denied").await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut engine = QueryEngine::new(config_for(&server, port)).unwrap();
    let err = engine.ask("anything").await.err().unwrap();
    assert!(matches!(err, AskError::Auth(_)), "{err:?}");

    let accepted = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(accepted.is_err(), "no upgrade should have been attempted");
    assert_eq!(engine.sequence().current(), 421);
}
