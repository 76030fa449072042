use anyhow::Context;
use arena_gateway::config::{
    GatewayConfig, DEFAULT_BASE_URL, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use arena_gateway::{logging, server};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "arena-gateway")]
#[command(about = "OpenAI-compatible chat completion gateway for LMArena")]
#[command(long_about = r#"
OpenAI-compatible chat completion gateway for LMArena

Exposes /v1/models and /v1/chat/completions and forwards each request to the
arena evaluation backend, rotating across a pool of session credentials.
Credentials the backend rejects are dropped for the life of the process.

Examples:
  arena-gateway --cf-clearance "$CF_CLEARANCE" --arena-cookies tok1,tok2,tok3

  # everything from the environment
  CF_CLEARANCE=... ARENA_AUTH_COOKIES=tok1,tok2 API_AUTH_SECRET=s3cret arena-gateway
"#)]
struct CliArgs {
    /// Host address to bind the gateway server
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port number to bind the gateway server
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Clearance cookie value sent with every backend request
    #[arg(long, env = "CF_CLEARANCE")]
    cf_clearance: String,

    /// Backend session credentials, comma separated
    #[arg(long, env = "ARENA_AUTH_COOKIES", value_delimiter = ',')]
    arena_cookies: Vec<String>,

    /// Backend origin
    #[arg(long, env = "ARENA_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Per-request network timeout in seconds
    #[arg(long, env = "ARENA_TIMEOUT_SECONDS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout_secs: u64,

    /// Outbound HTTP(S) proxy for backend traffic
    #[arg(long, env = "PROXY_URL")]
    proxy_url: Option<String>,

    /// Bearer token callers must present; unset leaves the gateway open
    #[arg(long, env = "API_AUTH_SECRET")]
    api_key: Option<String>,

    /// Maximum request body size in bytes
    #[arg(long, env = "MAX_PAYLOAD_SIZE", default_value_t = DEFAULT_MAX_PAYLOAD_SIZE)]
    max_payload_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl CliArgs {
    fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            host: self.host.clone(),
            port: self.port,
            cf_clearance: self.cf_clearance.clone(),
            arena_cookies: self.arena_cookies.clone(),
            base_url: self.base_url.clone(),
            request_timeout_secs: self.request_timeout_secs,
            proxy_url: self.proxy_url.clone(),
            api_key: self.api_key.clone(),
            max_payload_size: self.max_payload_size,
            log_level: Some(self.log_level.clone()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli_args = CliArgs::parse();

    let config = cli_args
        .to_gateway_config()
        .validate()
        .context("invalid gateway configuration")?;

    logging::init_logging(config.log_level.as_deref());
    log::debug!("Configuration: {:?}", config);

    actix_web::rt::System::new()
        .block_on(server::startup(config))
        .context("gateway server failed")?;

    Ok(())
}
