//! Translation of a flat chat transcript into the backend's message graph.

use serde::Serialize;
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};
use crate::models::ArenaModel;
use crate::protocol::{ChatMessage, Role};

const PARTICIPANT_POSITION: &str = "a";
const STATUS_PENDING: &str = "pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    User,
    Assistant,
}

impl From<Role> for NodeRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System | Role::User => NodeRole::User,
            Role::Assistant => NodeRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageGraphNode {
    pub id: String,
    pub role: NodeRole,
    pub content: String,
    #[serde(rename = "experimental_attachments")]
    pub experimental_attachments: Vec<serde_json::Value>,
    pub parent_message_ids: Vec<String>,
    pub participant_position: &'static str,
    pub model_id: Option<&'static str>,
    pub evaluation_session_id: String,
    pub status: &'static str,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationPayload {
    pub id: String,
    pub mode: &'static str,
    #[serde(rename = "modelAId")]
    pub model_a_id: &'static str,
    pub user_message_id: String,
    #[serde(rename = "modelAMessageId")]
    pub model_a_message_id: String,
    pub messages: Vec<MessageGraphNode>,
    pub modality: &'static str,
}

fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Build the evaluation payload for one request. Every call produces new
/// ids; nothing is cached between requests.
pub fn build_payload(messages: &[ChatMessage], model: &ArenaModel) -> ProxyResult<EvaluationPayload> {
    let session_id = fresh_id();
    let mut nodes = Vec::with_capacity(messages.len() + 1);
    let mut previous_id: Option<String> = None;
    let mut last_user_id: Option<String> = None;

    for message in messages {
        let id = fresh_id();
        let role = NodeRole::from(message.role);
        nodes.push(MessageGraphNode {
            id: id.clone(),
            role,
            content: message.content.flatten(),
            experimental_attachments: Vec::new(),
            parent_message_ids: previous_id.iter().cloned().collect(),
            participant_position: PARTICIPANT_POSITION,
            model_id: (role == NodeRole::Assistant).then_some(model.backend_id),
            evaluation_session_id: session_id.clone(),
            status: STATUS_PENDING,
            failure_reason: None,
        });
        // System messages ride along as user nodes but never anchor the turn.
        if message.role == Role::User {
            last_user_id = Some(id.clone());
        }
        previous_id = Some(id);
    }

    let user_message_id = last_user_id.ok_or(ProxyError::EmptyConversation)?;

    let placeholder_id = fresh_id();
    nodes.push(MessageGraphNode {
        id: placeholder_id.clone(),
        role: NodeRole::Assistant,
        content: String::new(),
        experimental_attachments: Vec::new(),
        parent_message_ids: previous_id.into_iter().collect(),
        participant_position: PARTICIPANT_POSITION,
        model_id: Some(model.backend_id),
        evaluation_session_id: session_id.clone(),
        status: STATUS_PENDING,
        failure_reason: None,
    });

    Ok(EvaluationPayload {
        id: session_id,
        mode: "direct",
        model_a_id: model.backend_id,
        user_message_id,
        model_a_message_id: placeholder_id,
        messages: nodes,
        modality: "chat",
    })
}
