//! Loopback server that records raw requests and answers per path.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::json;

/// One request as it arrived on the wire.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: String,
}

pub struct Recorder {
    pub url: String,
    seen: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    /// Serve canned replies; paths under `/fail` answer 500.
    pub async fn start() -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new().fallback(record).with_state(Arc::clone(&seen));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind recorder");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("recorder serve");
        });
        Self {
            url: format!("http://{addr}"),
            seen,
        }
    }

    pub fn last(&self) -> Recorded {
        self.seen
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a recorded request")
    }
}

async fn record(
    State(seen): State<Arc<Mutex<Vec<Recorded>>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = uri.path().to_owned();
    seen.lock().unwrap().push(Recorded {
        method,
        path: path.clone(),
        query: uri.query().map(str::to_owned),
        headers,
        body,
    });

    if path.starts_with("/fail") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    match path.as_str() {
        "/health" => axum::Json(json!({"status": "ok"})).into_response(),
        "/chat" => axum::Json(json!({"session_id": "s-1", "reply": "hello"})).into_response(),
        "/chat/stream" => (
            [("content-type", "text/event-stream"), ("x-session-id", "  abc  ")],
            "data: {\"type\":\"text\",\"chunk\":\"\",\"done\":true}\n\n",
        )
            .into_response(),
        "/reload-config" => {
            axum::Json(json!({"status": "reloaded", "model": "m2", "api_base": "https://b"}))
                .into_response()
        }
        "/reload" => axum::Json(json!({"status": "reloaded"})).into_response(),
        p if p.ends_with("/seal") => axum::Json(json!({"preserved": false})).into_response(),
        p if p.starts_with("/session/") => axum::Json(json!({"deleted": true})).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
