use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub mod api_envelope;
pub mod config;
pub mod download;
pub mod integration;
mod listing;
pub mod outbound;
pub mod record_store;
pub mod records;
mod webhooks;

use crate::api_envelope::{
    ApiErrorCode, ApiErrorTuple, conflict_error, error_response, error_response_with_details,
    error_response_with_status, not_found_error, unauthorized_error, validation_error,
};
use crate::config::Config;
use crate::download::{DownloadError, DownloadResolution, ProxiedFile};
use crate::integration::{HttpIntegrationClient, IntegrationClient, IntegrationError, TenantContext};
use crate::outbound::{OutboundError, OutboundNotifier};
use crate::record_store::{RecordStore, RecordStoreError};

const SERVICE_NAME: &str = "records-service";
const CUSTOMER_ID_HEADER: &str = "x-customer-id";
const CUSTOMER_NAME_HEADER: &str = "x-customer-name";
const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: RecordStore,
    integration: Option<Arc<dyn IntegrationClient>>,
    notifier: OutboundNotifier,
    http: reqwest::Client,
    started_at: SystemTime,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct DownloadProxyQuery {
    uri: Option<String>,
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = record_store::connect_shared(&config).await;
    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!(
        service = SERVICE_NAME,
        bind_addr = %config.bind_addr,
        "records service listening",
    );
    axum::serve(listener, build_router_with_store(config, store)).await?;
    Ok(())
}

pub fn build_router(config: Config) -> Router {
    let store = RecordStore::from_config(&config);
    build_router_with_store(config, store)
}

pub fn build_router_with_store(config: Config, store: RecordStore) -> Router {
    let integration = HttpIntegrationClient::from_config(&config)
        .map(|client| Arc::new(client) as Arc<dyn IntegrationClient>);
    build_router_with_parts(config, store, integration)
}

pub fn build_router_with_parts(
    config: Config,
    store: RecordStore,
    integration: Option<Arc<dyn IntegrationClient>>,
) -> Router {
    let notifier = OutboundNotifier::from_config(&config);
    let state = AppState {
        config: Arc::new(config),
        store,
        integration,
        notifier,
        http: reqwest::Client::new(),
        started_at: SystemTime::now(),
    };
    let webhook_state = state.clone();

    let webhook_router = Router::new()
        .route(
            "/webhooks",
            post(webhooks::create_record)
                .patch(webhooks::update_record)
                .delete(webhooks::delete_record),
        )
        .route_layer(middleware::from_fn_with_state(
            webhook_state,
            webhook_secret_gate,
        ));

    Router::new()
        .route("/healthz", get(health))
        .merge(webhook_router)
        .route("/forms/submit", post(submit_form))
        .route("/records", get(listing::list_records))
        .route("/records/import", get(listing::import_records))
        .route("/records/download", post(resolve_download))
        .route("/records/download-proxy", get(proxy_download))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = match state.started_at.elapsed() {
        Ok(duration) => duration.as_secs(),
        Err(_) => 0,
    };

    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
    })
}

async fn webhook_secret_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.webhook_secret.as_deref() else {
        return next.run(request).await;
    };

    let presented = header_string(request.headers(), WEBHOOK_SECRET_HEADER);
    if presented.as_deref() != Some(expected) {
        tracing::warn!(
            target: "records.webhooks",
            method = %request.method(),
            "rejected webhook with missing or invalid secret",
        );
        return unauthorized_error().into_response();
    }

    next.run(request).await
}

async fn submit_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let tenant = tenant_from_headers(&headers)?;
    let payload = json_body(payload)?;
    tracing::info!(
        target: "records.outbound",
        customer_id = %tenant.customer_id,
        "forwarding form submission",
    );

    let delivery = state
        .notifier
        .notify(&payload)
        .await
        .map_err(map_outbound_error)?;

    tracing::info!(
        target: "records.outbound",
        customer_id = %tenant.customer_id,
        routing_key = %delivery.routing_key,
        status = delivery.status,
        "form submission delivered",
    );
    Ok(Json(json!({
        "success": true,
        "data": delivery.body,
    })))
}

async fn resolve_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiErrorTuple> {
    let tenant = tenant_from_headers(&headers)?;
    let payload = json_body(payload)?;
    let Some(file_id) = payload.get("fileId").and_then(records::record_identifier) else {
        return Err(validation_error("File ID is required"));
    };
    let integration = integration_client(&state)?;

    let resolution = download::resolve_download_uri(integration.as_ref(), &tenant, &file_id)
        .await
        .map_err(map_download_resolve_error)?;

    let body = match resolution {
        DownloadResolution::NoConnection => json!({
            "success": false,
            "error": "No connection found",
        }),
        DownloadResolution::Resolved { download_uri } => {
            tracing::info!(
                target: "records.download",
                customer_id = %tenant.customer_id,
                file_id = %file_id,
                "resolved download uri",
            );
            json!({
                "success": true,
                "data": { "downloadUri": download_uri },
            })
        }
    };
    Ok(Json(body).into_response())
}

async fn proxy_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DownloadProxyQuery>,
) -> Result<Response, ApiErrorTuple> {
    let tenant = tenant_from_headers(&headers)?;
    let Some(raw_uri) = query.uri.filter(|value| !value.trim().is_empty()) else {
        return Err(validation_error("Download URI is required"));
    };
    let url = download::validate_proxy_uri(&raw_uri).map_err(map_download_proxy_error)?;

    let file = download::fetch_file(&state.http, url)
        .await
        .map_err(map_download_proxy_error)?;

    tracing::info!(
        target: "records.download",
        customer_id = %tenant.customer_id,
        filename = %file.filename,
        bytes = file.body.len(),
        "proxied download",
    );
    Ok(proxied_file_response(file))
}

fn proxied_file_response(file: ProxiedFile) -> Response {
    let content_type = HeaderValue::from_str(&file.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(download::DEFAULT_CONTENT_TYPE));
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        file.filename.replace(['"', '\\'], "")
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"download\""));
    let length = HeaderValue::from(file.body.len());

    let mut response = (StatusCode::OK, file.body).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(CONTENT_TYPE, content_type);
    response_headers.insert(CONTENT_DISPOSITION, disposition);
    response_headers.insert(CONTENT_LENGTH, length);
    response
}

/// Malformed or mistyped JSON bodies get the standard error envelope.
fn json_body(payload: Result<Json<Value>, JsonRejection>) -> Result<Value, ApiErrorTuple> {
    payload.map(|Json(value)| value).map_err(|rejection| {
        error_response_with_status(
            rejection.status(),
            ApiErrorCode::InvalidRequest,
            rejection.body_text(),
        )
    })
}

fn integration_client(state: &AppState) -> Result<Arc<dyn IntegrationClient>, ApiErrorTuple> {
    state.integration.clone().ok_or_else(|| {
        error_response(
            ApiErrorCode::ServiceUnavailable,
            "Integration platform is not configured",
        )
    })
}

fn tenant_from_headers(headers: &HeaderMap) -> Result<TenantContext, ApiErrorTuple> {
    let customer_id = header_string(headers, CUSTOMER_ID_HEADER).ok_or_else(unauthorized_error)?;
    Ok(TenantContext {
        customer_id,
        customer_name: header_string(headers, CUSTOMER_NAME_HEADER),
    })
}

fn header_string(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn map_record_store_error(error: RecordStoreError, not_found_message: &str) -> ApiErrorTuple {
    match error {
        RecordStoreError::NotFound => not_found_error(not_found_message),
        RecordStoreError::Validation { field, message } => {
            validation_error(format!("{field}: {message}"))
        }
        RecordStoreError::Conflict { message } => conflict_error(message),
        RecordStoreError::Persistence { message } => {
            tracing::error!(target: "records.store", error = %message, "record store write failed");
            error_response_with_status(
                StatusCode::SERVICE_UNAVAILABLE,
                ApiErrorCode::ServiceUnavailable,
                message,
            )
        }
    }
}

fn map_outbound_error(error: OutboundError) -> ApiErrorTuple {
    match error {
        OutboundError::Configuration { .. } => {
            error_response(ApiErrorCode::ConfigurationError, error.to_string())
        }
        OutboundError::Delivery {
            status, ref body, ..
        } => error_response_with_details(
            StatusCode::BAD_GATEWAY,
            ApiErrorCode::DeliveryFailed,
            error.to_string(),
            Some(json!({
                "upstreamStatus": status,
                "body": body,
            })),
        ),
    }
}

fn map_integration_error(
    status: StatusCode,
    message: &str,
    error: &IntegrationError,
) -> ApiErrorTuple {
    tracing::warn!(target: "records.integration", error = %error, "integration call failed");
    error_response_with_details(
        status,
        ApiErrorCode::IntegrationFailed,
        message,
        Some(Value::String(error.to_string())),
    )
}

fn map_download_resolve_error(error: DownloadError) -> ApiErrorTuple {
    match error {
        DownloadError::MissingUri => {
            error_response(ApiErrorCode::MissingDownloadUri, error.to_string())
        }
        DownloadError::Integration(ref source) => map_integration_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to download file",
            source,
        ),
        other => error_response_with_details(
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError,
            "Failed to download file",
            Some(Value::String(other.to_string())),
        ),
    }
}

fn map_download_proxy_error(error: DownloadError) -> ApiErrorTuple {
    match error {
        DownloadError::InvalidUri { message } => validation_error(message),
        DownloadError::UpstreamFetch { status, .. } => {
            tracing::warn!(
                target: "records.download",
                status = status.as_u16(),
                "upstream download fetch failed",
            );
            error_response_with_status(status, ApiErrorCode::UpstreamFetchFailed, error.to_string())
        }
        other => {
            tracing::error!(target: "records.download", error = %other, "download proxy failed");
            error_response(ApiErrorCode::InternalError, other.to_string())
        }
    }
}

#[cfg(test)]
mod tests;
