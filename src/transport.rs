use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderValue};

use crate::config::GatewayConfig;
use crate::credential_pool::Credential;
use crate::error::{ProxyError, ProxyResult};
use crate::payload::EvaluationPayload;

pub const STREAM_PATH: &str = "/api/stream/create-evaluation";
const AUTH_COOKIE_NAME: &str = "arena-auth-prod-v1";
const CLEARANCE_COOKIE_NAME: &str = "cf_clearance";
const ERROR_BODY_PREVIEW_CHARS: usize = 500;

/// Raw response lines from one backend call, in arrival order.
pub type LineStream = BoxStream<'static, ProxyResult<String>>;

/// Opens one backend evaluation stream for a payload under a credential.
///
/// Dropping the returned stream must release the underlying connection.
#[async_trait]
pub trait ArenaTransport: Send + Sync {
    async fn open(
        &self,
        payload: &EvaluationPayload,
        credential: &Credential,
    ) -> ProxyResult<LineStream>;
}

/// Transport speaking HTTP to the arena backend.
#[derive(Debug, Clone)]
pub struct HttpArenaTransport {
    client: reqwest::Client,
    base_url: String,
    clearance: String,
}

impl HttpArenaTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, clearance: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            clearance: clearance.into(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> ProxyResult<Self> {
        let client = build_client(config.request_timeout(), config.proxy_url.as_deref())?;
        Ok(Self::new(client, &config.base_url, &config.cf_clearance))
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, STREAM_PATH)
    }

    fn request_headers(&self, credential: &Credential) -> ProxyResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let mut insert = |name: header::HeaderName, value: &str| -> ProxyResult<()> {
            let value = HeaderValue::from_str(value)
                .map_err(|e| ProxyError::Encode(format!("invalid header {}: {}", name, e)))?;
            headers.insert(name, value);
            Ok(())
        };

        insert(header::ACCEPT, "*/*")?;
        insert(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")?;
        insert(header::CONTENT_TYPE, "text/plain;charset=UTF-8")?;
        insert(header::ORIGIN, &self.base_url)?;
        insert(header::REFERER, &format!("{}/", self.base_url))?;
        insert(header::USER_AGENT, BROWSER_USER_AGENT)?;
        for (name, value) in BROWSER_CLIENT_HINTS {
            insert(header::HeaderName::from_static(name), value)?;
        }
        insert(
            header::COOKIE,
            &format!(
                "{}={}; {}={}",
                CLEARANCE_COOKIE_NAME,
                self.clearance,
                AUTH_COOKIE_NAME,
                credential.as_str()
            ),
        )?;
        Ok(headers)
    }
}

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.0.0 Safari/537.36";

const BROWSER_CLIENT_HINTS: [(&str, &str); 11] = [
    ("priority", "u=1, i"),
    (
        "sec-ch-ua",
        r#""Microsoft Edge";v="137", "Chromium";v="137", "Not/A)Brand";v="24""#,
    ),
    ("sec-ch-ua-arch", r#""arm""#),
    ("sec-ch-ua-bitness", r#""64""#),
    ("sec-ch-ua-full-version", r#""137.0.3296.52""#),
    (
        "sec-ch-ua-full-version-list",
        r#""Microsoft Edge";v="137.0.3296.52", "Chromium";v="137.0.7151.56", "Not/A)Brand";v="24.0.0.0""#,
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-model", r#""""#),
    ("sec-ch-ua-platform", r#""macOS""#),
    ("sec-ch-ua-platform-version", r#""15.5.0""#),
    ("sec-fetch-mode", "cors"),
];

/// Build the outbound client: one timeout per request, optional proxy.
pub fn build_client(timeout: Duration, proxy_url: Option<&str>) -> ProxyResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_idle_timeout(Some(Duration::from_secs(50)))
        .timeout(timeout);
    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| ProxyError::BackendUnreachable(format!("invalid proxy url: {}", e)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| ProxyError::BackendUnreachable(format!("failed to build HTTP client: {}", e)))
}

fn transport_error(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::BackendUnreachable(format!("request timed out: {}", e))
    } else {
        ProxyError::BackendUnreachable(e.to_string())
    }
}

#[async_trait]
impl ArenaTransport for HttpArenaTransport {
    async fn open(
        &self,
        payload: &EvaluationPayload,
        credential: &Credential,
    ) -> ProxyResult<LineStream> {
        let body = serde_json::to_vec(payload).map_err(|e| ProxyError::Encode(e.to_string()))?;
        let response = self
            .client
            .post(self.endpoint())
            .headers(self.request_headers(credential)?)
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let preview: String = text.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
            return Err(ProxyError::BackendHttp {
                status: status.as_u16(),
                body: preview,
            });
        }

        log::debug!(
            "Opened backend stream for session {} with credential {}",
            payload.id,
            credential
        );
        Ok(into_lines(response.bytes_stream().map(|r| r.map_err(transport_error))))
    }
}

/// Splits incoming byte chunks into lines. Bytes are buffered until a full
/// line is present so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator (`\n` or `\r\n`).
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Unterminated trailing content, if any.
    pub fn take_remaining(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Adapt a byte stream into a line stream. After the first error the
/// stream ends.
pub fn into_lines<S>(bytes: S) -> LineStream
where
    S: Stream<Item = ProxyResult<Bytes>> + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        buffer: LineBuffer,
        finished: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        buffer: LineBuffer::default(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.buffer.next_line() {
                return Some((Ok(line), state));
            }
            if state.finished {
                return state.buffer.take_remaining().map(|line| (Ok(line), state));
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.push_chunk(&chunk),
                Some(Err(e)) => {
                    state.finished = true;
                    state.buffer = LineBuffer::default();
                    return Some((Err(e), state));
                }
                None => state.finished = true,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_handles_split_chunks() {
        let mut buffer = LineBuffer::default();
        buffer.push_chunk(b"data: a0:\"he");
        assert_eq!(buffer.next_line(), None);
        buffer.push_chunk(b"llo\"\r\ndata: ad:\n\ntail");
        assert_eq!(buffer.next_line().as_deref(), Some("data: a0:\"hello\""));
        assert_eq!(buffer.next_line().as_deref(), Some("data: ad:"));
        assert_eq!(buffer.next_line().as_deref(), Some(""));
        assert_eq!(buffer.next_line(), None);
        assert_eq!(buffer.take_remaining().as_deref(), Some("tail"));
        assert_eq!(buffer.take_remaining(), None);
    }

    #[test]
    fn test_line_buffer_keeps_multibyte_chars_intact() {
        let text = "data: a0:\"héllo\"\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut buffer = LineBuffer::default();
        buffer.push_chunk(&text[..split]);
        buffer.push_chunk(&text[split..]);
        assert_eq!(buffer.next_line().as_deref(), Some("data: a0:\"héllo\""));
    }

    #[tokio::test]
    async fn test_into_lines_flushes_tail_and_stops_after_error() {
        let chunks = vec![
            Ok(Bytes::from_static(b"one\ntw")),
            Ok(Bytes::from_static(b"o\nthree")),
        ];
        let lines: Vec<String> = into_lines(stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["one", "two", "three"]);

        let chunks = vec![
            Ok(Bytes::from_static(b"one\npartial")),
            Err(ProxyError::BackendUnreachable("reset".to_string())),
            Ok(Bytes::from_static(b"never\n")),
        ];
        let items: Vec<ProxyResult<String>> = into_lines(stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "one");
        assert!(items[1].is_err());
    }

    #[test]
    fn test_request_headers_carry_cookie_and_origin() {
        let transport = HttpArenaTransport::new(
            reqwest::Client::new(),
            "https://arena.example.com/",
            "clear",
        );
        let headers = transport.request_headers(&Credential::new("tok")).unwrap();
        assert_eq!(
            headers.get(header::COOKIE).unwrap(),
            "cf_clearance=clear; arena-auth-prod-v1=tok"
        );
        assert_eq!(headers.get(header::ORIGIN).unwrap(), "https://arena.example.com");
        assert_eq!(headers.get(header::REFERER).unwrap(), "https://arena.example.com/");
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "text/plain;charset=UTF-8"
        );
        assert!(headers.contains_key("sec-ch-ua"));
        assert_eq!(
            transport.endpoint(),
            "https://arena.example.com/api/stream/create-evaluation"
        );
    }
}
