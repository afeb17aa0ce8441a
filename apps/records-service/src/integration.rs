use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;

/// Tenant identity resolved from the calling request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub customer_id: String,
    pub customer_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Connection {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("integration request failed: {message}")]
    Request { message: String },
    #[error("integration returned {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("integration response could not be decoded: {message}")]
    Decode { message: String },
}

/// Seam over the external integration platform.
#[async_trait]
pub trait IntegrationClient: Send + Sync {
    async fn list_connections(
        &self,
        tenant: &TenantContext,
    ) -> Result<Vec<Connection>, IntegrationError>;

    /// Runs `action_key` on a connection and returns the action's `output`.
    async fn run_action(
        &self,
        tenant: &TenantContext,
        connection_id: &str,
        action_key: &str,
        input: Value,
    ) -> Result<Value, IntegrationError>;

    async fn first_connection(
        &self,
        tenant: &TenantContext,
    ) -> Result<Option<Connection>, IntegrationError> {
        Ok(self.list_connections(tenant).await?.into_iter().next())
    }
}

#[derive(Debug, Clone)]
pub struct HttpIntegrationClient {
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ConnectionsResponse {
    #[serde(default)]
    items: Vec<Connection>,
}

#[derive(Debug, Serialize)]
struct RunActionRequest {
    input: Value,
}

#[derive(Debug, Deserialize)]
struct RunActionResponse {
    #[serde(default)]
    output: Value,
}

impl HttpIntegrationClient {
    pub fn from_config(config: &Config) -> Option<Self> {
        let base_url = config.integration_base_url.as_deref()?;
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return None;
        }

        Some(Self {
            base_url: base_url.to_string(),
            api_token: config.integration_api_token.clone(),
            timeout: Duration::from_millis(config.integration_timeout_ms),
            http: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        tenant: &TenantContext,
    ) -> reqwest::RequestBuilder {
        let request = request
            .header("x-customer-id", tenant.customer_id.as_str())
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .timeout(self.timeout);
        match self.api_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl IntegrationClient for HttpIntegrationClient {
    async fn list_connections(
        &self,
        tenant: &TenantContext,
    ) -> Result<Vec<Connection>, IntegrationError> {
        let request = self.authorize(self.http.get(self.endpoint("/connections")), tenant);
        let response = request
            .send()
            .await
            .map_err(|error| IntegrationError::Request {
                message: error.to_string(),
            })?;
        let payload: ConnectionsResponse = decode_json_response(response).await?;
        Ok(payload.items)
    }

    async fn run_action(
        &self,
        tenant: &TenantContext,
        connection_id: &str,
        action_key: &str,
        input: Value,
    ) -> Result<Value, IntegrationError> {
        let path = format!(
            "/connections/{}/actions/{}/run",
            connection_id.trim(),
            action_key.trim()
        );
        let request = self
            .authorize(self.http.post(self.endpoint(&path)), tenant)
            .json(&RunActionRequest { input });
        let response = request
            .send()
            .await
            .map_err(|error| IntegrationError::Request {
                message: error.to_string(),
            })?;
        let payload: RunActionResponse = decode_json_response(response).await?;
        Ok(payload.output)
    }
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, IntegrationError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| IntegrationError::Request {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| IntegrationError::Decode {
        message: error.to_string(),
    })
}

fn format_http_error(status: StatusCode, body: &[u8]) -> IntegrationError {
    let body = String::from_utf8_lossy(body).trim().to_string();
    let body = if body.is_empty() {
        "<empty>".to_string()
    } else {
        body
    };
    IntegrationError::Http { status, body }
}
