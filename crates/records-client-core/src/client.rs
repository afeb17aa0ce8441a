use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::listing::{ImportSummary, ListingError, RecordPage, RecordsFetcher};

const CUSTOMER_ID_HEADER: &str = "x-customer-id";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP client for the records service, scoped to one customer.
#[derive(Debug, Clone)]
pub struct RecordsServiceClient {
    http: reqwest::Client,
    base_url: String,
    customer_id: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadUriData {
    download_uri: String,
}

impl RecordsServiceClient {
    pub fn new(base_url: &str, customer_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: normalize_base_url(base_url),
            customer_id: customer_id.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Asks the service for a fresh download link. `Ok(None)` means the
    /// customer has no integration connection.
    pub async fn resolve_download_uri(
        &self,
        file_id: &str,
    ) -> Result<Option<String>, ListingError> {
        let url = self.endpoint("/records/download", &[])?;
        let envelope: Envelope<DownloadUriData> = self
            .send(Method::POST, url, Some(json!({ "fileId": file_id })))
            .await?;
        if !envelope.success {
            return Ok(None);
        }
        envelope
            .data
            .map(|data| Some(data.download_uri))
            .ok_or_else(|| ListingError::Decode {
                message: "download response is missing data.downloadUri".to_string(),
            })
    }

    /// URL of the service proxy that streams `download_uri` back as an attachment.
    pub fn download_proxy_url(&self, download_uri: &str) -> Result<Url, ListingError> {
        self.endpoint("/records/download-proxy", &[("uri", download_uri)])
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, ListingError> {
        let mut url = Url::parse(&format!("{}{path}", self.base_url)).map_err(|error| {
            ListingError::Request {
                message: format!("invalid records service url: {error}"),
            }
        })?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<T, ListingError> {
        let mut request = self
            .http
            .request(method, url)
            .timeout(self.timeout)
            .header(CUSTOMER_ID_HEADER, &self.customer_id);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|error| ListingError::Request {
            message: error.to_string(),
        })?;
        decode_json_response(response).await
    }
}

#[async_trait]
impl RecordsFetcher for RecordsServiceClient {
    async fn fetch_page(
        &self,
        action: &str,
        cursor: Option<&str>,
        search: Option<&str>,
    ) -> Result<RecordPage, ListingError> {
        let mut query = vec![("action", action)];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        if let Some(search) = search {
            query.push(("search", search));
        }
        let url = self.endpoint("/records", &query)?;
        self.send(Method::GET, url, None).await
    }

    async fn import(&self, action: &str) -> Result<ImportSummary, ListingError> {
        let url = self.endpoint("/records/import", &[("action", action)])?;
        let envelope: Envelope<ImportSummary> = self.send(Method::GET, url, None).await?;
        if !envelope.success {
            return Err(ListingError::Rejected {
                message: envelope
                    .error
                    .unwrap_or_else(|| "Import failed".to_string()),
            });
        }
        envelope.data.ok_or_else(|| ListingError::Decode {
            message: "import response is missing data".to_string(),
        })
    }
}

fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

async fn decode_json_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ListingError> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(|error| ListingError::Request {
        message: error.to_string(),
    })?;
    if !status.is_success() {
        return Err(ListingError::Http {
            status: status.as_u16(),
            message: format_http_error(status, &bytes),
        });
    }
    serde_json::from_slice(&bytes).map_err(|error| ListingError::Decode {
        message: error.to_string(),
    })
}

fn format_http_error(status: StatusCode, body: &[u8]) -> String {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|value| value.get("error"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    if message.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        message
    }
}
