use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use uuid::Uuid;

use crate::credential_pool::{Credential, CredentialPool};
use crate::error::{ProxyError, ProxyResult};
use crate::frame::{self, StreamEvent};
use crate::models::{self, ArenaModel};
use crate::payload::{build_payload, EvaluationPayload};
use crate::protocol::{
    AssistantMessage, ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ModelList,
    CHAT_COMPLETION_OBJECT, FINISH_REASON_STOP,
};
use crate::sse::{format_sse_done, ChunkEncoder};
use crate::transport::{ArenaTransport, LineStream};

/// Backend events that matter to the caller: text, end, or failure.
type EventStream = BoxStream<'static, ProxyResult<StreamEvent>>;

fn frame_events(lines: LineStream) -> EventStream {
    lines
        .filter_map(|line| async move {
            match line {
                Err(e) => Some(Err(e)),
                Ok(line) => match frame::parse_line(&line) {
                    None | Some(StreamEvent::Ignorable) => None,
                    Some(event) => Some(event.into_result()),
                },
            }
        })
        .boxed()
}

fn response_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

fn unix_timestamp() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Runs chat requests against the arena backend, rotating and banning
/// credentials from a shared pool.
#[derive(Clone)]
pub struct ArenaClient {
    pool: Arc<CredentialPool>,
    transport: Arc<dyn ArenaTransport>,
}

impl std::fmt::Debug for ArenaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaClient")
            .field("credentials", &self.pool.size())
            .finish()
    }
}

impl ArenaClient {
    pub fn new(pool: Arc<CredentialPool>, transport: Arc<dyn ArenaTransport>) -> Self {
        Self { pool, transport }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn list_models(&self) -> ModelList {
        models::list_models()
    }

    fn prepare(&self, request: &ChatCompletionRequest) -> ProxyResult<(&'static ArenaModel, EvaluationPayload)> {
        let model = models::resolve_model(&request.model)?;
        let payload = build_payload(&request.messages, model)?;
        log::debug!(
            "Prepared session {} for {} ({} nodes)",
            payload.id,
            model.display_name,
            payload.messages.len()
        );
        Ok((model, payload))
    }

    /// Aggregated completion: the whole answer in one response.
    pub async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> ProxyResult<ChatCompletionResponse> {
        let (model, payload) = self.prepare(request)?;
        let content = self
            .with_credentials(|credential| self.collect_text(&payload, credential))
            .await?;

        Ok(ChatCompletionResponse {
            id: response_id(),
            object: CHAT_COMPLETION_OBJECT.to_string(),
            created: unix_timestamp(),
            model: model.name.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: Some(FINISH_REASON_STOP.to_string()),
            }],
        })
    }

    /// Streaming completion. Credential failures are retried only until the
    /// first output-bearing event arrives; the returned stream has already
    /// passed that point.
    pub async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> ProxyResult<ChatCompletionStream> {
        let (model, payload) = self.prepare(request)?;
        let opened = self
            .with_credentials(|credential| self.open_stream(&payload, credential))
            .await?;

        let encoder = ChunkEncoder::new(response_id(), unix_timestamp(), model.name);
        Ok(ChatCompletionStream {
            encoder,
            first: Some(opened.first),
            events: opened.events,
            pending: VecDeque::new(),
            credential: opened.credential,
            pool: Arc::clone(&self.pool),
            finished: false,
        })
    }

    /// Run `attempt` with credentials from the pool until it succeeds or
    /// fails for a reason unrelated to the credential. Credentials that
    /// fail are banned. The attempt budget is twice the pool size at entry.
    async fn with_credentials<T, F, Fut>(&self, mut attempt: F) -> ProxyResult<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = ProxyResult<T>>,
    {
        let max_attempts = 2 * self.pool.size().max(1);
        let mut last_error = None;

        for attempt_no in 1..=max_attempts {
            let credential = self.pool.next()?;
            if attempt_no > 1 {
                log::info!(
                    "Retrying with credential {} (attempt {}/{})",
                    credential,
                    attempt_no,
                    max_attempts
                );
            }

            match attempt(credential.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_credential_failure() => {
                    log::warn!("Credential {} rejected by backend: {}", credential, e);
                    self.pool.ban(&credential)?;
                    last_error = Some(e);
                }
                Err(e) => {
                    log::warn!("Backend request failed: {}", e);
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or(ProxyError::PoolExhausted))
    }

    async fn collect_text(
        &self,
        payload: &EvaluationPayload,
        credential: Credential,
    ) -> ProxyResult<String> {
        let mut events = frame_events(self.transport.open(payload, &credential).await?);
        let mut text = String::new();
        while let Some(event) = events.next().await {
            match event? {
                StreamEvent::Text(fragment) => text.push_str(&fragment),
                StreamEvent::End => break,
                StreamEvent::Ignorable | StreamEvent::Error(_) => {}
            }
        }
        Ok(text)
    }

    async fn open_stream(
        &self,
        payload: &EvaluationPayload,
        credential: Credential,
    ) -> ProxyResult<OpenedStream> {
        let mut events = frame_events(self.transport.open(payload, &credential).await?);
        let first = loop {
            match events.next().await {
                Some(Ok(StreamEvent::Text(fragment))) if fragment.is_empty() => continue,
                Some(event) => break event?,
                None => break StreamEvent::End,
            }
        };
        Ok(OpenedStream {
            credential,
            first,
            events,
        })
    }
}

/// A backend stream that has produced its first output-bearing event.
struct OpenedStream {
    credential: Credential,
    first: StreamEvent,
    events: EventStream,
}

/// SSE frames of one streamed completion.
///
/// Ends with a stop chunk and `[DONE]` when the backend finishes. A backend
/// failure yields one error item and ends the stream without `[DONE]`.
/// Dropping the stream closes the backend connection.
pub struct ChatCompletionStream {
    encoder: ChunkEncoder,
    first: Option<StreamEvent>,
    events: EventStream,
    pending: VecDeque<Bytes>,
    credential: Credential,
    pool: Arc<CredentialPool>,
    finished: bool,
}

impl std::fmt::Debug for ChatCompletionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionStream")
            .field("id", &self.encoder.id())
            .field("credential", &self.credential)
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl ChatCompletionStream {
    pub fn id(&self) -> &str {
        self.encoder.id()
    }

    fn apply(&mut self, event: StreamEvent) -> ProxyResult<()> {
        match event {
            StreamEvent::Text(fragment) => {
                if !fragment.is_empty() {
                    let frame = self.encoder.content(&fragment)?;
                    self.pending.push_back(frame);
                }
            }
            StreamEvent::End => {
                let stop = self.encoder.stop()?;
                self.pending.push_back(stop);
                self.pending.push_back(format_sse_done());
                self.finished = true;
            }
            StreamEvent::Ignorable => {}
            StreamEvent::Error(message) => return Err(ProxyError::BackendStream(message)),
        }
        Ok(())
    }

    fn fail(&mut self, error: ProxyError) -> ProxyError {
        self.finished = true;
        self.pending.clear();
        log::error!("Stream {} failed after output began: {}", self.encoder.id(), error);
        if error.is_credential_failure() {
            if let Err(e) = self.pool.ban(&self.credential) {
                log::error!("Ban after mid-stream failure: {}", e);
            }
        }
        error
    }
}

impl Stream for ChatCompletionStream {
    type Item = ProxyResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            let next = match this.first.take() {
                Some(event) => Some(Ok(event)),
                None => ready!(this.events.poll_next_unpin(cx)),
            };
            let outcome = match next {
                Some(Ok(event)) => this.apply(event),
                Some(Err(e)) => Err(e),
                // Connection closed without an end frame: treat as end.
                None => this.apply(StreamEvent::End),
            };
            if let Err(e) = outcome {
                return Poll::Ready(Some(Err(this.fail(e))));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use parking_lot::Mutex;

    use crate::protocol::{ChatMessage, Role};

    /// Serves one scripted outcome per call, in order; the last one repeats.
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<Vec<ProxyResult<String>>, ProxyError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<Vec<ProxyResult<String>>, ProxyError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ArenaTransport for Scripted {
        async fn open(
            &self,
            _payload: &EvaluationPayload,
            credential: &Credential,
        ) -> ProxyResult<LineStream> {
            self.calls.lock().push(credential.as_str().to_string());
            let outcome = {
                let mut outcomes = self.outcomes.lock();
                if outcomes.len() > 1 {
                    outcomes.pop_front().unwrap()
                } else {
                    outcomes.front().unwrap().clone()
                }
            };
            outcome.map(|lines| stream::iter(lines).boxed())
        }
    }

    fn lines(raw: &[&str]) -> Result<Vec<ProxyResult<String>>, ProxyError> {
        Ok(raw.iter().map(|l| Ok(l.to_string())).collect())
    }

    fn forbidden() -> Result<Vec<ProxyResult<String>>, ProxyError> {
        Err(ProxyError::BackendHttp {
            status: 403,
            body: "forbidden".to_string(),
        })
    }

    fn request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gemini-2.5-pro".to_string(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            stream,
            max_tokens: None,
            temperature: None,
        }
    }

    fn client(credentials: &[&str], transport: Arc<Scripted>) -> ArenaClient {
        let pool = Arc::new(CredentialPool::new(credentials.iter().copied()).unwrap());
        ArenaClient::new(pool, transport)
    }

    const HELLO: &[&str] = &[
        "data: af:{\"messageId\":\"x\"}",
        "data: a0:\"Hi\"",
        "",
        "data: a0:\" there\"",
        "data: ad:{\"finishReason\":\"stop\"}",
    ];

    #[tokio::test]
    async fn test_aggregated_concatenates_text() {
        let transport = Scripted::new(vec![lines(HELLO)]);
        let client = client(&["A"], transport);
        let response = client.chat_completion(&request(false)).await.unwrap();
        assert_eq!(response.choices[0].message.content, "Hi there");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.model, "gemini-2.5-pro-preview-05-06");
        assert!(response.id.starts_with("chatcmpl-"));
    }

    #[tokio::test]
    async fn test_aggregated_stops_at_end_frame() {
        let transport = Scripted::new(vec![lines(&[
            "data: a0:\"done\"",
            "data: [DONE]",
            "data: a0:\" ignored\"",
        ])]);
        let client = client(&["A"], transport);
        let response = client.chat_completion(&request(false)).await.unwrap();
        assert_eq!(response.choices[0].message.content, "done");
    }

    #[tokio::test]
    async fn test_forbidden_everywhere_bans_all_then_exhausts() {
        let transport = Scripted::new(vec![forbidden()]);
        let client = client(&["A", "B", "C"], Arc::clone(&transport));
        let err = client.chat_completion(&request(false)).await.unwrap_err();
        assert!(matches!(err, ProxyError::PoolExhausted));
        assert!(client.pool().is_empty());
        let calls = transport.calls.lock();
        assert_eq!(calls.len(), 3);
        assert!(calls.len() <= 6);
    }

    #[tokio::test]
    async fn test_credential_error_frame_retries_on_next_credential() {
        let transport = Scripted::new(vec![
            lines(&["data: {\"error\":\"Usage limit reached\"}"]),
            lines(HELLO),
        ]);
        let client = client(&["A", "B"], Arc::clone(&transport));
        let response = client.chat_completion(&request(false)).await.unwrap();
        assert_eq!(response.choices[0].message.content, "Hi there");
        assert_eq!(client.pool().size(), 1);

        let calls = transport.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0], calls[1]);
        assert_eq!(client.pool().snapshot()[0].as_str(), calls[1]);
    }

    #[tokio::test]
    async fn test_non_credential_error_is_not_retried() {
        let transport = Scripted::new(vec![Err(ProxyError::BackendHttp {
            status: 400,
            body: "malformed payload".to_string(),
        })]);
        let client = client(&["A", "B"], Arc::clone(&transport));
        let err = client.chat_completion(&request(false)).await.unwrap_err();
        assert_eq!(err.backend_status(), Some(400));
        assert_eq!(transport.calls.lock().len(), 1);
        assert_eq!(client.pool().size(), 2);
    }

    #[tokio::test]
    async fn test_request_errors_fail_before_backend() {
        let transport = Scripted::new(vec![lines(HELLO)]);
        let client = client(&["A"], Arc::clone(&transport));

        let mut bad_model = request(false);
        bad_model.model = "unknown".to_string();
        assert!(matches!(
            client.chat_completion(&bad_model).await,
            Err(ProxyError::UnsupportedModel(_))
        ));

        let mut no_user = request(false);
        no_user.messages = vec![ChatMessage::new(Role::Assistant, "x")];
        assert!(matches!(
            client.chat_completion(&no_user).await,
            Err(ProxyError::EmptyConversation)
        ));
        assert!(transport.calls.lock().is_empty());
    }

    async fn drain(stream: ChatCompletionStream) -> Vec<ProxyResult<Bytes>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_stream_emits_role_text_stop_done() {
        let transport = Scripted::new(vec![lines(HELLO)]);
        let client = client(&["A"], transport);
        let stream = client.chat_completion_stream(&request(true)).await.unwrap();
        let frames: Vec<String> = drain(stream)
            .await
            .into_iter()
            .map(|f| String::from_utf8(f.unwrap().to_vec()).unwrap())
            .collect();

        assert_eq!(frames.len(), 4);
        assert!(frames[0].contains("\"role\":\"assistant\""));
        assert!(frames[0].contains("\"content\":\"Hi\""));
        assert!(!frames[1].contains("\"role\""));
        assert!(frames[1].contains("\"content\":\" there\""));
        assert!(frames[2].contains("\"finish_reason\":\"stop\""));
        assert_eq!(frames[3], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_stream_retries_before_first_output() {
        let transport = Scripted::new(vec![
            lines(&["data: af:{}", "data: {\"message\":\"Invalid token\"}"]),
            lines(HELLO),
        ]);
        let client = client(&["A", "B"], Arc::clone(&transport));
        let stream = client.chat_completion_stream(&request(true)).await.unwrap();
        let frames = drain(stream).await;
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.is_ok()));
        assert_eq!(transport.calls.lock().len(), 2);
        assert_eq!(client.pool().size(), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_after_output_ends_without_done() {
        let transport = Scripted::new(vec![lines(&[
            "data: a0:\"partial\"",
            "data: {\"error\":\"rate limited\"}",
            "data: a0:\"never\"",
        ])]);
        let client = client(&["A", "B"], Arc::clone(&transport));
        let stream = client.chat_completion_stream(&request(true)).await.unwrap();
        let frames = drain(stream).await;

        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert_eq!(frames[1].as_ref().unwrap_err().to_string(), "rate limited");
        // No retry after output, but the credential is still banned.
        assert_eq!(transport.calls.lock().len(), 1);
        assert_eq!(client.pool().size(), 1);
    }

    #[tokio::test]
    async fn test_stream_close_without_end_still_completes() {
        let transport = Scripted::new(vec![lines(&["data: a0:\"only\""])]);
        let client = client(&["A"], transport);
        let stream = client.chat_completion_stream(&request(true)).await.unwrap();
        let frames = drain(stream).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[2].as_ref().unwrap()[..], b"data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_stream_open_failure_surfaces_before_stream() {
        let transport = Scripted::new(vec![Err(ProxyError::BackendUnreachable(
            "connection refused".to_string(),
        ))]);
        let client = client(&["A"], transport);
        let err = client.chat_completion_stream(&request(true)).await.unwrap_err();
        assert!(matches!(err, ProxyError::BackendUnreachable(_)));
        assert_eq!(client.pool().size(), 1);
    }

    #[tokio::test]
    async fn test_stream_debug_masks_credential() {
        let transport = Scripted::new(vec![lines(HELLO)]);
        let client = client(&["secret-session-token"], transport);
        let stream = client.chat_completion_stream(&request(true)).await.unwrap();
        let rendered = format!("{:?}", stream);
        assert!(rendered.contains(stream.id()));
        assert!(!rendered.contains("secret-session-token"));
    }

    #[tokio::test]
    async fn test_dropping_stream_does_not_ban() {
        let transport = Scripted::new(vec![lines(HELLO)]);
        let client = client(&["A"], transport);
        let mut stream = client.chat_completion_stream(&request(true)).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        drop(stream);
        assert_eq!(client.pool().size(), 1);
    }
}
