use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use crate::protocol::{ErrorDetail, ErrorResponse};

/// Substrings (lowercase) that mark a backend failure as caused by the credential itself.
const CREDENTIAL_FAILURE_MARKERS: [&str; 5] = [
    "invalid token",
    "not login",
    "usage limit",
    "too many concurrent requests",
    "rate limited",
];

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("unsupported model '{0}'")]
    UnsupportedModel(String),

    #[error("no user message")]
    EmptyConversation,

    #[error("all credentials exhausted")]
    PoolExhausted,

    #[error("failed to reach backend: {0}")]
    BackendUnreachable(String),

    #[error("backend returned HTTP {status}: {body}")]
    BackendHttp { status: u16, body: String },

    /// In-band error frame; the message is the backend's own text.
    #[error("{0}")]
    BackendStream(String),

    #[error("failed to encode response: {0}")]
    Encode(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Status code reported by the backend, if the failure carried one.
    pub fn backend_status(&self) -> Option<u16> {
        match self {
            ProxyError::BackendHttp { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the failure means the credential used is no longer usable.
    pub fn is_credential_failure(&self) -> bool {
        match self {
            ProxyError::BackendHttp { status: 401 | 403, .. } => true,
            ProxyError::BackendHttp { .. }
            | ProxyError::BackendUnreachable(_)
            | ProxyError::BackendStream(_) => {
                let message = self.to_string().to_lowercase();
                CREDENTIAL_FAILURE_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
            }
            _ => false,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::UnsupportedModel(_) | ProxyError::EmptyConversation => {
                "invalid_request_error"
            }
            ProxyError::PoolExhausted => "service_unavailable",
            ProxyError::Encode(_) => "internal_error",
            _ => "upstream_error",
        }
    }

    fn error_code(&self) -> Option<&'static str> {
        match self {
            ProxyError::UnsupportedModel(_) => Some("model_not_found"),
            ProxyError::PoolExhausted => Some("credentials_exhausted"),
            _ => None,
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UnsupportedModel(_) | ProxyError::EmptyConversation => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BackendHttp { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::BackendUnreachable(_) | ProxyError::BackendStream(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                error_type: self.error_type().to_string(),
                param: None,
                code: self.error_code().map(str::to_string),
            },
        })
    }
}
