//! SSE encoding of chat completion chunks.

use bytes::Bytes;
use serde::Serialize;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{
    ChatCompletionStreamResponse, ChatMessageDelta, ChatStreamChoice,
    CHAT_COMPLETION_CHUNK_OBJECT, FINISH_REASON_STOP,
};

/// Format a value as an SSE data block: `data: {json}\n\n`
pub fn format_sse_data<T: Serialize>(data: &T) -> ProxyResult<Bytes> {
    let json = serde_json::to_string(data)
        .map_err(|e| ProxyError::Encode(format!("failed to serialize SSE data: {}", e)))?;
    Ok(Bytes::from(format!("data: {}\n\n", json)))
}

/// Format the SSE "[DONE]" marker
pub fn format_sse_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Builds the chunks of one streamed completion. The first content chunk
/// carries the assistant role; later ones carry content only.
#[derive(Debug)]
pub struct ChunkEncoder {
    id: String,
    created: u64,
    model: String,
    role_sent: bool,
}

impl ChunkEncoder {
    pub fn new(id: impl Into<String>, created: u64, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created,
            model: model.into(),
            role_sent: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk(&self, delta: ChatMessageDelta, finish_reason: Option<&str>) -> ChatCompletionStreamResponse {
        ChatCompletionStreamResponse {
            id: self.id.clone(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    pub fn content(&mut self, fragment: &str) -> ProxyResult<Bytes> {
        let role = (!self.role_sent).then(|| "assistant".to_string());
        self.role_sent = true;
        format_sse_data(&self.chunk(
            ChatMessageDelta {
                role,
                content: Some(fragment.to_string()),
            },
            None,
        ))
    }

    pub fn stop(&self) -> ProxyResult<Bytes> {
        format_sse_data(&self.chunk(ChatMessageDelta::default(), Some(FINISH_REASON_STOP)))
    }
}
