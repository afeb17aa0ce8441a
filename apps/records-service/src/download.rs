//! Two-stage file download: resolve a download URI through the integration
//! platform, then fetch those bytes server-side and re-emit them.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use serde_json::{Value, json};
use thiserror::Error;

use crate::integration::{IntegrationClient, IntegrationError, TenantContext};

pub const DOWNLOAD_ACTION_KEY: &str = "download-file";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const DEFAULT_FILENAME: &str = "download";

static FILENAME_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"filename[^;=\n]*=(?:"([^"]*)"|'([^']*)'|([^;\n]*))"#).ok()
});

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("No download URI found in response")]
    MissingUri,
    #[error("{message}")]
    InvalidUri { message: String },
    #[error("Failed to fetch file: {status_text}")]
    UpstreamFetch {
        status: StatusCode,
        status_text: String,
    },
    #[error("{message}")]
    Request { message: String },
    #[error(transparent)]
    Integration(#[from] IntegrationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadResolution {
    NoConnection,
    Resolved { download_uri: String },
}

/// Fully buffered upstream file.
#[derive(Debug, Clone)]
pub struct ProxiedFile {
    pub content_type: String,
    pub filename: String,
    pub body: Vec<u8>,
}

/// Runs the `download-file` action on the tenant's first connection.
pub async fn resolve_download_uri(
    integration: &dyn IntegrationClient,
    tenant: &TenantContext,
    file_id: &str,
) -> Result<DownloadResolution, DownloadError> {
    let Some(connection) = integration.first_connection(tenant).await? else {
        tracing::info!(
            target: "records.download",
            customer_id = %tenant.customer_id,
            "no integration connection for download",
        );
        return Ok(DownloadResolution::NoConnection);
    };

    let output = integration
        .run_action(
            tenant,
            &connection.id,
            DOWNLOAD_ACTION_KEY,
            json!({ "fileId": file_id }),
        )
        .await?;

    let download_uri = output
        .get("downloadUri")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(DownloadError::MissingUri)?;

    Ok(DownloadResolution::Resolved {
        download_uri: download_uri.to_string(),
    })
}

/// Accepts only absolute http(s) URLs for the server-side fetch.
pub fn validate_proxy_uri(raw: &str) -> Result<reqwest::Url, DownloadError> {
    let url = reqwest::Url::parse(raw.trim()).map_err(|error| DownloadError::InvalidUri {
        message: format!("Invalid download URI: {error}"),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DownloadError::InvalidUri {
            message: format!("Unsupported download URI scheme: {}", url.scheme()),
        });
    }
    Ok(url)
}

pub async fn fetch_file(
    http: &reqwest::Client,
    url: reqwest::Url,
) -> Result<ProxiedFile, DownloadError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|error| DownloadError::Request {
            message: error.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::UpstreamFetch {
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let filename = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(filename_from_content_disposition)
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

    let body = response
        .bytes()
        .await
        .map_err(|error| DownloadError::Request {
            message: error.to_string(),
        })?
        .to_vec();

    Ok(ProxiedFile {
        content_type,
        filename,
        body,
    })
}

pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let pattern = FILENAME_PATTERN.as_ref()?;
    let captures = pattern.captures(header)?;
    let raw = captures
        .get(1)
        .or_else(|| captures.get(2))
        .or_else(|| captures.get(3))?
        .as_str();
    let filename = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if filename.is_empty() {
        None
    } else {
        Some(filename.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_read_from_quoted_and_bare_parameters() {
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="Report Q1.pdf""#),
            Some("Report Q1.pdf".to_string())
        );
        assert_eq!(
            filename_from_content_disposition("attachment; filename='notes.txt'; size=10"),
            Some("notes.txt".to_string())
        );
        assert_eq!(
            filename_from_content_disposition("inline; filename=data.csv"),
            Some("data.csv".to_string())
        );
    }

    #[test]
    fn filename_falls_back_when_absent_or_empty() {
        assert_eq!(filename_from_content_disposition("attachment"), None);
        assert_eq!(filename_from_content_disposition(r#"attachment; filename="""#), None);
    }

    #[test]
    fn proxy_uri_must_be_absolute_http() {
        assert!(validate_proxy_uri("https://files.test/a.pdf").is_ok());
        assert!(validate_proxy_uri(" http://files.test/a.pdf ").is_ok());
        assert!(matches!(
            validate_proxy_uri("/relative/path"),
            Err(DownloadError::InvalidUri { .. })
        ));
        assert!(matches!(
            validate_proxy_uri("file:///etc/passwd"),
            Err(DownloadError::InvalidUri { .. })
        ));
    }

    #[test]
    fn upstream_fetch_error_carries_status_text() {
        let error = DownloadError::UpstreamFetch {
            status: StatusCode::NOT_FOUND,
            status_text: "Not Found".to_string(),
        };
        assert_eq!(error.to_string(), "Failed to fetch file: Not Found");
    }
}
