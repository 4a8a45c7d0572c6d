//! Plain configuration structs. The CLI fills these from flags and environment variables.

use std::net::SocketAddr;

use crate::planner::PlannerError;

/// Review cycles allowed before `review_and_completion_loop` gives up.
pub const DEFAULT_MAX_REVIEW_ITERATIONS: u32 = 10;

/// Options for the bundled agent workflows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowOptions {
    pub max_review_iterations: u32,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            max_review_iterations: DEFAULT_MAX_REVIEW_ITERATIONS,
        }
    }
}

/// HTTP front door and store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// sqlx SQLite URL, e.g. `sqlite:agentflow.db` or `sqlite::memory:`.
    pub database_url: String,
    /// Base for the status URIs returned to callers. Derived from `Host` when unset.
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7071,
            database_url: "sqlite:agentflow.db".to_string(),
            public_base_url: None,
        }
    }
}

impl ServerConfig {
    /// Resolve `host` (an IP literal or a name such as `localhost`) to the first listen address.
    pub async fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} did not resolve to any address", self.host),
                )
            })
    }
}

pub const AOAI_ENDPOINT: &str = "AOAI_ENDPOINT";
pub const AOAI_API_VERSION: &str = "AOAI_API_VERSION";
pub const AOAI_KEY: &str = "AOAI_KEY";
pub const AOAI_GPT_MODEL: &str = "AOAI_GPT_MODEL";

/// Azure OpenAI settings for workflow generation.
#[derive(Clone, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com/`.
    pub endpoint: String,
    pub api_version: String,
    pub api_key: String,
    /// Chat deployment name.
    pub deployment: String,
}

// The key stays out of logs
impl std::fmt::Debug for PlannerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannerConfig")
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .field("api_key", &"<redacted>")
            .field("deployment", &self.deployment)
            .finish()
    }
}

impl PlannerConfig {
    /// Read the four `AOAI_*` variables. Missing or empty variables are a `Config` error.
    pub fn from_env() -> Result<Self, PlannerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PlannerError> {
        let get = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| PlannerError::Config(format!("{key} is not set")))
        };
        Ok(Self {
            endpoint: get(AOAI_ENDPOINT)?,
            api_version: get(AOAI_API_VERSION)?,
            api_key: get(AOAI_KEY)?,
            deployment: get(AOAI_GPT_MODEL)?,
        })
    }
}
