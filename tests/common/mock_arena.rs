use std::collections::HashSet;
use std::net::TcpListener;

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use arena_gateway::transport::STREAM_PATH;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

/// One request as seen by the mock backend.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub cookie: String,
    pub content_type: String,
    pub origin: String,
    pub body: Value,
}

impl RecordedRequest {
    /// Value of the `arena-auth-prod-v1` cookie.
    pub fn credential(&self) -> Option<&str> {
        self.cookie
            .split(';')
            .map(str::trim)
            .find_map(|pair| pair.strip_prefix("arena-auth-prod-v1="))
    }
}

struct MockArenaState {
    rejected: HashSet<String>,
    lines: Vec<String>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Mock evaluation backend on an ephemeral port. Credentials in the
/// rejected set get 403; everyone else gets the scripted lines, one line
/// per body chunk.
pub struct MockArena {
    pub url: String,
    state: web::Data<MockArenaState>,
    handle: ServerHandle,
}

impl MockArena {
    /// Must be called from within an actix system (e.g. `#[actix_web::test]`).
    pub fn start(rejected: &[&str], lines: Vec<String>) -> std::io::Result<Self> {
        let state = web::Data::new(MockArenaState {
            rejected: rejected.iter().map(|c| c.to_string()).collect(),
            lines,
            requests: Mutex::new(Vec::new()),
        });

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();

        let app_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .route(STREAM_PATH, web::post().to(create_evaluation))
        })
        .workers(1)
        .listen(listener)?
        .run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        Ok(Self {
            url: format!("http://127.0.0.1:{}", port),
            state,
            handle,
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    pub async fn stop(self) {
        self.handle.stop(false).await;
    }
}

fn header_value(req: &HttpRequest, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn create_evaluation(
    req: HttpRequest,
    body: Bytes,
    state: web::Data<MockArenaState>,
) -> HttpResponse {
    let recorded = RecordedRequest {
        cookie: header_value(&req, "cookie"),
        content_type: header_value(&req, "content-type"),
        origin: header_value(&req, "origin"),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    };
    let credential = recorded.credential().unwrap_or_default().to_string();
    state.requests.lock().push(recorded);

    if state.rejected.contains(&credential) {
        return HttpResponse::Forbidden().body("Forbidden");
    }

    let chunks: Vec<Result<Bytes, actix_web::Error>> = state
        .lines
        .iter()
        .map(|line| Ok(Bytes::from(format!("{}\n", line))))
        .collect();
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .streaming(stream::iter(chunks))
}
