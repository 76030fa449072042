// Shared by several test binaries; not every helper is used by each one.
#![allow(dead_code)]

pub mod mock_arena;

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::web;
use arena_gateway::error::{ProxyError, ProxyResult};
use arena_gateway::payload::EvaluationPayload;
use arena_gateway::server::AppState;
use arena_gateway::transport::{ArenaTransport, LineStream};
use arena_gateway::{ArenaClient, Credential, CredentialPool};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// What the scripted backend does for one credential.
#[derive(Debug, Clone)]
pub enum Script {
    /// 200 with these body lines
    Lines(Vec<String>),
    /// Non-2xx before any body
    Status(u16, String),
    /// These lines, then the connection drops with the given message
    LinesThenDrop(Vec<String>, String),
}

/// In-memory backend. Behaviour is picked per credential, falling back to a
/// default script.
pub struct ScriptedTransport {
    default: Script,
    per_credential: HashMap<String, Script>,
    calls: Mutex<Vec<(String, EvaluationPayload)>>,
}

impl ScriptedTransport {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            per_credential: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, credential: &str, script: Script) -> Self {
        self.per_credential.insert(credential.to_string(), script);
        self
    }

    /// Credentials used so far, in call order.
    pub fn credentials_used(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn payloads(&self) -> Vec<EvaluationPayload> {
        self.calls.lock().iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl ArenaTransport for ScriptedTransport {
    async fn open(
        &self,
        payload: &EvaluationPayload,
        credential: &Credential,
    ) -> ProxyResult<LineStream> {
        self.calls
            .lock()
            .push((credential.as_str().to_string(), payload.clone()));

        let script = self
            .per_credential
            .get(credential.as_str())
            .unwrap_or(&self.default)
            .clone();

        match script {
            Script::Lines(lines) => Ok(stream::iter(lines.into_iter().map(Ok)).boxed()),
            Script::Status(status, body) => Err(ProxyError::BackendHttp { status, body }),
            Script::LinesThenDrop(lines, message) => {
                let items: Vec<ProxyResult<String>> = lines
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(ProxyError::BackendUnreachable(message))))
                    .collect();
                Ok(stream::iter(items).boxed())
            }
        }
    }
}

pub fn lines(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|l| l.to_string()).collect()
}

/// A typical backend answer: metadata, "Hi there" in two fragments, finish.
pub fn hello_lines() -> Vec<String> {
    lines(&[
        r#"data: af:{"messageId":"00000000-0000-0000-0000-000000000000"}"#,
        r#"data: a0:"Hi""#,
        "",
        r#"data: a0:" there""#,
        r#"data: ad:{"finishReason":"stop"}"#,
    ])
}

pub fn arena_client(credentials: &[&str], transport: Arc<dyn ArenaTransport>) -> ArenaClient {
    let pool = CredentialPool::new(credentials.iter().copied()).expect("non-empty pool");
    ArenaClient::new(Arc::new(pool), transport)
}

pub fn app_state(client: ArenaClient) -> web::Data<AppState> {
    web::Data::new(AppState::new(client))
}

pub fn chat_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": "Be brief."},
            {"role": "user", "content": "Say hi"}
        ],
        "stream": stream
    })
}

/// Split an SSE body into its `data:` payloads.
pub fn sse_payloads(body: &[u8]) -> Vec<String> {
    std::str::from_utf8(body)
        .expect("utf-8 body")
        .split("\n\n")
        .filter(|block| !block.is_empty())
        .map(|block| {
            block
                .strip_prefix("data: ")
                .expect("data frame")
                .to_string()
        })
        .collect()
}
