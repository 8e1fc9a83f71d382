//! Deployment secret retrieval

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::AgentError;
use crate::http::client::HttpClient;
use crate::utils::SecretToken;

/// Returns the environment variables for a deployment
#[async_trait]
pub trait SecretFetcher: Send + Sync {
    async fn fetch_secrets(
        &self,
        deployment_id: &str,
        token: Option<&SecretToken>,
    ) -> Result<BTreeMap<String, String>, AgentError>;
}

/// Fetches secrets from the backend with the request's deploy token
pub struct BackendSecretFetcher {
    http: HttpClient,
}

impl BackendSecretFetcher {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl SecretFetcher for BackendSecretFetcher {
    async fn fetch_secrets(
        &self,
        deployment_id: &str,
        token: Option<&SecretToken>,
    ) -> Result<BTreeMap<String, String>, AgentError> {
        // Deployments without a token have no secrets configured
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            debug!("No deploy token for {}, skipping secret fetch", deployment_id);
            return Ok(BTreeMap::new());
        };

        self.http
            .get_deployment_secrets(deployment_id, token.expose())
            .await
            .map_err(|e| AgentError::SecretError(e.to_string()))
    }
}

/// Render variables as an env file, one `KEY=value` per line
pub fn render_env_file(vars: &BTreeMap<String, String>) -> Result<String, AgentError> {
    let mut out = String::new();
    for (key, value) in vars {
        let valid_key = !key.is_empty()
            && !key.starts_with(|c: char| c.is_ascii_digit())
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_key {
            return Err(AgentError::SecretError(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        if value.contains('\n') {
            return Err(AgentError::SecretError(format!(
                "value of {} spans multiple lines",
                key
            )));
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    Ok(out)
}
