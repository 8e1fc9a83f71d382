//! Backend deployment API

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::errors::AgentError;
use crate::http::client::HttpClient;
use crate::models::deployment::JobCompletion;

/// Secrets response, either wrapped or a bare map
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SecretsResponse {
    Wrapped { secrets: BTreeMap<String, String> },
    Bare(BTreeMap<String, String>),
}

impl SecretsResponse {
    pub fn into_map(self) -> BTreeMap<String, String> {
        match self {
            SecretsResponse::Wrapped { secrets } => secrets,
            SecretsResponse::Bare(secrets) => secrets,
        }
    }
}

impl HttpClient {
    /// Get the environment variables for a deployment
    pub async fn get_deployment_secrets(
        &self,
        deployment_id: &str,
        token: &str,
    ) -> Result<BTreeMap<String, String>, AgentError> {
        let path = format!("/deployments/{}/secrets", deployment_id);
        let response: SecretsResponse = self.get(&path, token).await?;
        Ok(response.into_map())
    }

    /// Report the terminal result of a tracked job
    pub async fn complete_job(
        &self,
        token: &str,
        completion: &JobCompletion,
    ) -> Result<(), AgentError> {
        let path = format!("/jobs/{}/complete", completion.job_id);
        self.post_empty(&path, token, completion).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_response_shapes() {
        let wrapped: SecretsResponse =
            serde_json::from_str(r#"{"secrets": {"DATABASE_URL": "postgres://db"}}"#).unwrap();
        assert_eq!(wrapped.into_map()["DATABASE_URL"], "postgres://db");

        let bare: SecretsResponse = serde_json::from_str(r#"{"API_KEY": "k"}"#).unwrap();
        assert_eq!(bare.into_map()["API_KEY"], "k");
    }
}
