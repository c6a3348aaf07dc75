//! Proxy configuration

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder secret; startup warns when it is still in use.
pub const DEV_JWT_SECRET: &str = "change-me-in-production-use-a-random-64-char-string";

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// HTTP listen address
    pub listen: SocketAddr,

    /// Host the instance containers publish their UI ports on
    pub upstream_host: String,

    /// Path to the backend's SQLite database
    pub db_path: PathBuf,

    /// Credential verification
    pub jwt: JwtConfig,

    /// Outbound client timeouts
    pub upstream: UpstreamConfig,

    /// Proxy session cookie
    pub session: SessionConfig,

    /// Allowed CORS origins; `*` allows any
    pub cors_origins: Vec<String>,

    /// Emit a tracing span per HTTP request
    pub request_logging: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            upstream_host: "127.0.0.1".to_string(),
            db_path: PathBuf::from("./data/app.db"),
            jwt: JwtConfig::default(),
            upstream: UpstreamConfig::default(),
            session: SessionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_logging: true,
        }
    }
}

/// JWT verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Shared HMAC secret
    pub secret: String,

    /// One of HS256, HS384, HS512
    pub algorithm: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: DEV_JWT_SECRET.to_string(),
            algorithm: "HS256".to_string(),
        }
    }
}

impl JwtConfig {
    pub fn algorithm(&self) -> anyhow::Result<Algorithm> {
        match self.algorithm.trim().to_ascii_uppercase().as_str() {
            "HS256" => Ok(Algorithm::HS256),
            "HS384" => Ok(Algorithm::HS384),
            "HS512" => Ok(Algorithm::HS512),
            other => Err(anyhow::anyhow!("unsupported jwt algorithm: {other}")),
        }
    }
}

/// Upstream client timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub pool_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            read_timeout_secs: 30,
            write_timeout_secs: 10,
            pool_timeout_secs: 5,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }
}

/// Proxy session cookie configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_age_secs: i64,
    pub secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 3600,
            secure: true,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `UIPROXY_*` environment overrides
    pub fn apply_env(mut self) -> anyhow::Result<Self> {
        if let Some(listen) = env_var("UIPROXY_LISTEN") {
            self.listen = listen.parse()?;
        }
        if let Some(host) = env_var("UIPROXY_UPSTREAM_HOST") {
            self.upstream_host = host;
        }
        if let Some(path) = env_var("UIPROXY_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(secret) = env_var("UIPROXY_JWT_SECRET") {
            self.jwt.secret = secret;
        }
        if let Some(alg) = env_var("UIPROXY_JWT_ALGORITHM") {
            self.jwt.algorithm = alg;
        }
        if let Some(origins) = env_var("UIPROXY_CORS_ORIGINS") {
            self.cors_origins = parse_origins(&origins);
        }
        Ok(self)
    }

    /// Reject settings the proxy cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.jwt.algorithm()?;
        if self.jwt.secret.is_empty() {
            anyhow::bail!("jwt.secret must not be empty");
        }
        if self.upstream_host.trim().is_empty() {
            anyhow::bail!("upstream_host must not be empty");
        }
        if self.session.max_age_secs <= 0 {
            anyhow::bail!("session.max_age_secs must be positive");
        }
        Ok(())
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt.secret == DEV_JWT_SECRET
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .and_then(|v| if v.trim().is_empty() { None } else { Some(v) })
}

fn parse_origins(s: &str) -> Vec<String> {
    s.split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}
