use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8790";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_INTEGRATION_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_OUTBOUND_ROUTE_PREFIX: &str = "get-";
const DEFAULT_OUTBOUND_WEBHOOK_ROUTES: &str = concat!(
    "files=https://api.integration.app/webhooks/app-events/5cce9363-f191-489c-a738-a8e196be0b3e,",
    "folders=https://api.integration.app/webhooks/app-events/cd9f4430-8f4e-45a4-badd-9d4666078540",
);
const DEFAULT_IMPORT_MAX_PAGES: usize = 20;
const DEFAULT_LIST_PAGE_SIZE: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRoute {
    pub routing_key: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub log_json: bool,
    pub store_path: Option<PathBuf>,
    pub integration_base_url: Option<String>,
    pub integration_api_token: Option<String>,
    pub integration_timeout_ms: u64,
    pub outbound_routes: Vec<OutboundRoute>,
    pub outbound_route_prefix: String,
    pub webhook_secret: Option<String>,
    pub import_max_pages: usize,
    pub list_page_size: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RECORDS_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid RECORDS_OUTBOUND_WEBHOOK_ROUTES entry '{entry}': expected key=url")]
    InvalidOutboundRoute { entry: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env::var("RECORDS_BIND_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = env::var("RECORDS_LOG_FILTER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let log_json = env::var("RECORDS_LOG_JSON")
            .ok()
            .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let store_path = env::var("RECORDS_STORE_PATH")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let integration_base_url = env::var("RECORDS_INTEGRATION_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());

        let integration_api_token = env::var("RECORDS_INTEGRATION_API_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let integration_timeout_ms = env::var("RECORDS_INTEGRATION_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_INTEGRATION_TIMEOUT_MS)
            .max(250);

        let outbound_routes = parse_outbound_routes(
            env::var("RECORDS_OUTBOUND_WEBHOOK_ROUTES")
                .ok()
                .unwrap_or_else(|| DEFAULT_OUTBOUND_WEBHOOK_ROUTES.to_string()),
        )?;

        let outbound_route_prefix = env::var("RECORDS_OUTBOUND_ROUTE_PREFIX")
            .ok()
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| DEFAULT_OUTBOUND_ROUTE_PREFIX.to_string());

        let webhook_secret = env::var("RECORDS_WEBHOOK_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let import_max_pages = env::var("RECORDS_IMPORT_MAX_PAGES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_IMPORT_MAX_PAGES)
            .max(1);

        let list_page_size = env::var("RECORDS_LIST_PAGE_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_LIST_PAGE_SIZE)
            .clamp(1, 100);

        Ok(Self {
            bind_addr,
            log_filter,
            log_json,
            store_path,
            integration_base_url,
            integration_api_token,
            integration_timeout_ms,
            outbound_routes,
            outbound_route_prefix,
            webhook_secret,
            import_max_pages,
            list_page_size,
        })
    }

    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            log_json: false,
            store_path: None,
            integration_base_url: None,
            integration_api_token: None,
            integration_timeout_ms: DEFAULT_INTEGRATION_TIMEOUT_MS,
            outbound_routes: Vec::new(),
            outbound_route_prefix: DEFAULT_OUTBOUND_ROUTE_PREFIX.to_string(),
            webhook_secret: None,
            import_max_pages: DEFAULT_IMPORT_MAX_PAGES,
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }
}

fn parse_outbound_routes(value: String) -> Result<Vec<OutboundRoute>, ConfigError> {
    parse_csv(value)
        .into_iter()
        .map(|entry| {
            let Some((key, url)) = entry.split_once('=') else {
                return Err(ConfigError::InvalidOutboundRoute { entry });
            };
            let routing_key = key.trim().to_lowercase();
            let url = url.trim().to_string();
            if routing_key.is_empty() || url.is_empty() {
                return Err(ConfigError::InvalidOutboundRoute { entry });
            }
            Ok(OutboundRoute { routing_key, url })
        })
        .collect()
}

fn parse_csv(value: String) -> Vec<String> {
    value
        .split(',')
        .map(|segment| segment.trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}
