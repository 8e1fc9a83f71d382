//! HTTP client implementation

use reqwest::{header, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::AgentError;

/// JSON-over-HTTP client for the backend and the routing front end
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T, AgentError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let request = self.authorized(self.client.get(&url), token);
        let response = check(request.send().await?, "GET").await?;
        Ok(response.json().await?)
    }

    /// Make a POST request
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<T, AgentError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let request = self.authorized(self.client.post(&url), token).json(body);
        let response = check(request.send().await?, "POST").await?;
        Ok(response.json().await?)
    }

    /// POST without reading a response body
    pub async fn post_empty<B: Serialize>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<(), AgentError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let request = self.authorized(self.client.post(&url), token).json(body);
        check(request.send().await?, "POST").await?;
        Ok(())
    }

    /// GET that only checks for a success status
    pub async fn ping(&self, path: &str, token: &str) -> Result<(), AgentError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let request = self.authorized(self.client.get(&url), token);
        check(request.send().await?, "GET").await?;
        Ok(())
    }

    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        if token.is_empty() {
            request
        } else {
            request.header(header::AUTHORIZATION, format!("Bearer {}", token))
        }
    }
}

async fn check(response: Response, method: &str) -> Result<Response, AgentError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!("HTTP {} failed: {} - {}", method, status, body);
    Err(AgentError::ApiError(format!("{}: {}", status, body)))
}
