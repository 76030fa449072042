use std::sync::Arc;

use actix_web::{
    body::MessageBody,
    dev::{ServiceFactory, ServiceRequest, ServiceResponse},
    error, get,
    http::header,
    middleware::Logger,
    post, web, App, Error, HttpRequest, HttpResponse, HttpServer,
};
use serde_json::json;

use crate::client::ArenaClient;
use crate::config::GatewayConfig;
use crate::credential_pool::CredentialPool;
use crate::error::ProxyError;
use crate::middleware::ApiKeyAuth;
use crate::protocol::{ChatCompletionRequest, ErrorDetail, ErrorResponse};
use crate::transport::HttpArenaTransport;

#[derive(Debug, Clone)]
pub struct AppState {
    client: ArenaClient,
}

impl AppState {
    pub fn new(client: ArenaClient) -> Self {
        Self { client }
    }

    /// Build the credential pool and HTTP transport described by `config`.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, String> {
        let pool = CredentialPool::new(&config.arena_cookies).map_err(|e| e.to_string())?;
        let transport = HttpArenaTransport::from_config(config).map_err(|e| e.to_string())?;
        Ok(Self::new(ArenaClient::new(Arc::new(pool), Arc::new(transport))))
    }
}

fn error_body(status: actix_web::http::StatusCode, message: String) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse {
        error: ErrorDetail {
            message,
            error_type: "invalid_request_error".to_string(),
            param: None,
            code: None,
        },
    })
}

// Custom error handler for JSON payload errors.
fn json_error_handler(err: error::JsonPayloadError, _req: &HttpRequest) -> Error {
    log::error!("JSON payload error: {:?}", err);
    let response = match &err {
        error::JsonPayloadError::OverflowKnownLength { length, limit } => error_body(
            actix_web::http::StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Payload too large: {} bytes exceeds limit of {} bytes",
                length, limit
            ),
        ),
        error::JsonPayloadError::Overflow { limit } => error_body(
            actix_web::http::StatusCode::PAYLOAD_TOO_LARGE,
            format!("Payload exceeds limit of {} bytes", limit),
        ),
        _ => error_body(
            actix_web::http::StatusCode::BAD_REQUEST,
            format!("Invalid JSON payload: {}", err),
        ),
    };
    error::InternalError::from_response(err, response).into()
}

pub fn json_config(limit: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(json_error_handler)
}

#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

#[get("/v1/models")]
async fn v1_models(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.client.list_models())
}

#[post("/v1/chat/completions")]
async fn v1_chat_completions(
    body: web::Json<ChatCompletionRequest>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ProxyError> {
    let request = body.into_inner();
    log::info!(
        "Chat completion for {} ({} messages, stream={})",
        request.model,
        request.messages.len(),
        request.stream
    );

    if request.stream {
        let stream = data.client.chat_completion_stream(&request).await?;
        log::debug!("Streaming completion {}", stream.id());
        Ok(HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .streaming(stream))
    } else {
        let response = data.client.chat_completion(&request).await?;
        Ok(HttpResponse::Ok().json(response))
    }
}

/// Register every gateway route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(v1_models)
        .service(v1_chat_completions);
}

/// The full application: routes, auth, request logging and body limits.
pub fn build_app(
    app_state: web::Data<AppState>,
    api_key: Option<&str>,
    max_payload_size: usize,
) -> App<
    impl use<> + ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl use<> + MessageBody>,
        Error = Error,
        InitError = (),
    >,
> {
    App::new()
        .wrap(ApiKeyAuth::new(api_key))
        .wrap(Logger::default())
        .app_data(app_state)
        .app_data(json_config(max_payload_size))
        .app_data(web::PayloadConfig::default().limit(max_payload_size))
        .configure(configure)
}

pub async fn startup(config: GatewayConfig) -> std::io::Result<()> {
    let app_state = web::Data::new(AppState::from_config(&config).map_err(std::io::Error::other)?);

    log::info!("Starting gateway on {}:{}", config.host, config.port);
    log::info!(
        "Backend {} with {} credentials",
        config.base_url,
        app_state.client.pool().size()
    );
    log::info!(
        "Max payload size: {} MB",
        config.max_payload_size / (1024 * 1024)
    );
    if config.api_key.is_none() {
        log::warn!("No API key configured, the gateway accepts unauthenticated requests");
    }

    let api_key = config.api_key.clone();
    let max_payload_size = config.max_payload_size;
    HttpServer::new(move || build_app(app_state.clone(), api_key.as_deref(), max_payload_size))
        .bind((config.host.as_str(), config.port))?
        .run()
        .await
}
