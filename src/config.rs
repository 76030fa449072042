use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://canary.lmarena.ai";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Gateway process configuration
#[derive(Clone)]
pub struct GatewayConfig {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Clearance token sent alongside every credential
    pub cf_clearance: String,
    /// Backend session credentials (comma separated on the command line)
    pub arena_cookies: Vec<String>,
    /// Backend origin, without trailing slash
    pub base_url: String,
    /// Per-request network timeout in seconds
    pub request_timeout_secs: u64,
    /// Outbound HTTP(S) proxy for backend traffic
    pub proxy_url: Option<String>,
    /// Bearer token callers must present (None = open)
    pub api_key: Option<String>,
    /// Maximum request body size in bytes
    pub max_payload_size: usize,
    /// Log level (None = info)
    pub log_level: Option<String>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("cf_clearance", &"<redacted>")
            .field("arena_cookies", &format!("<{} redacted>", self.arena_cookies.len()))
            .field("base_url", &self.base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("proxy_url", &self.proxy_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_payload_size", &self.max_payload_size)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cf_clearance: String::new(),
            arena_cookies: Vec::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            proxy_url: None,
            api_key: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            log_level: None,
        }
    }
}

impl GatewayConfig {
    /// Split a comma separated credential list, dropping blank entries.
    pub fn parse_cookie_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Check required fields and normalize the base URL.
    pub fn validate(mut self) -> ConfigResult<Self> {
        if self.cf_clearance.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cf_clearance".to_string(),
            });
        }
        self.cf_clearance = self.cf_clearance.trim().to_string();

        self.arena_cookies = self
            .arena_cookies
            .iter()
            .flat_map(|entry| Self::parse_cookie_list(entry))
            .collect();
        if self.arena_cookies.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "arena_cookies".to_string(),
            });
        }

        let base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "base_url".to_string(),
                value: self.base_url,
                reason: "must start with http:// or https://".to_string(),
            });
        }
        self.base_url = base_url;

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if is_blank(self.proxy_url.as_deref()) {
            self.proxy_url = None;
        }
        if is_blank(self.api_key.as_deref()) {
            self.api_key = None;
        }

        Ok(self)
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().is_empty())
}
