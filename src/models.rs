//! Backend models the gateway can serve and the public aliases that map to them.

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{ModelCard, ModelList};

pub const MODEL_OWNER: &str = "lmarena.ai";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaModel {
    /// Canonical public name, echoed back in responses
    pub name: &'static str,
    /// Identifier the backend expects in `modelAId`
    pub backend_id: &'static str,
    pub display_name: &'static str,
}

const REGISTRY: &[ArenaModel] = &[ArenaModel {
    name: "gemini-2.5-pro-preview-05-06",
    backend_id: "0337ee08-8305-40c0-b820-123ad42b60cf",
    display_name: "Gemini 2.5 Pro (preview 2025-05-06)",
}];

/// (alias, canonical name)
const ALIASES: &[(&str, &str)] = &[
    ("gemini-2.5-pro", "gemini-2.5-pro-preview-05-06"),
    ("gemini-2.5-pro-preview", "gemini-2.5-pro-preview-05-06"),
    ("gemini-2.5-pro-preview-05-06", "gemini-2.5-pro-preview-05-06"),
];

fn lookup(canonical: &str) -> Option<&'static ArenaModel> {
    REGISTRY.iter().find(|model| model.name == canonical)
}

/// Resolve a requested model name. Surrounding whitespace is ignored;
/// matching is otherwise exact.
pub fn resolve_model(requested: &str) -> ProxyResult<&'static ArenaModel> {
    let key = requested.trim();
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(key);
    lookup(canonical).ok_or_else(|| ProxyError::UnsupportedModel(requested.to_string()))
}

/// One card per alias, sorted by id.
pub fn list_models() -> ModelList {
    let mut ids: Vec<&str> = ALIASES.iter().map(|(alias, _)| *alias).collect();
    ids.sort_unstable();
    ModelList {
        object: "list".to_string(),
        data: ids
            .into_iter()
            .map(|id| ModelCard {
                id: id.to_string(),
                object: "model".to_string(),
                owned_by: MODEL_OWNER.to_string(),
            })
            .collect(),
    }
}
