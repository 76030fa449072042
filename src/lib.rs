//! OpenAI-compatible chat completion gateway in front of the LMArena
//! evaluation backend.
//!
//! Requests are translated into the backend's message-graph payload, sent
//! under a credential drawn from a shared [`CredentialPool`], and the
//! backend's line-oriented event stream is re-encoded as either one
//! aggregated completion or OpenAI-style SSE chunks.

pub mod client;
pub mod config;
pub mod credential_pool;
pub mod error;
pub mod frame;
pub mod logging;
pub mod middleware;
pub mod models;
pub mod payload;
pub mod protocol;
pub mod server;
pub mod sse;
pub mod transport;

pub use client::{ArenaClient, ChatCompletionStream};
pub use config::{ConfigError, ConfigResult, GatewayConfig};
pub use credential_pool::{Credential, CredentialPool};
pub use error::{ProxyError, ProxyResult};
pub use transport::{ArenaTransport, HttpArenaTransport};
