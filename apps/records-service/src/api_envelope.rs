use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;

pub type ApiErrorTuple = (StatusCode, Json<ApiErrorResponse>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    InvalidRequest,
    Unauthorized,
    NotFound,
    Conflict,
    ConfigurationError,
    DeliveryFailed,
    IntegrationFailed,
    MissingDownloadUri,
    UpstreamFetchFailed,
    ServiceUnavailable,
    InternalError,
}

impl ApiErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::ConfigurationError => "configuration_error",
            Self::DeliveryFailed => "delivery_failed",
            Self::IntegrationFailed => "integration_failed",
            Self::MissingDownloadUri => "missing_download_uri",
            Self::UpstreamFetchFailed => "upstream_fetch_failed",
            Self::ServiceUnavailable => "service_unavailable",
            Self::InternalError => "internal_error",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DeliveryFailed => StatusCode::BAD_GATEWAY,
            Self::IntegrationFailed => StatusCode::BAD_GATEWAY,
            Self::MissingDownloadUri => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamFetchFailed => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body shared by every route: `{success:false, error, code, details?}`.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn error_response(code: ApiErrorCode, message: impl Into<String>) -> ApiErrorTuple {
    error_response_with_status(code.default_status(), code, message)
}

pub fn error_response_with_status(
    status: StatusCode,
    code: ApiErrorCode,
    message: impl Into<String>,
) -> ApiErrorTuple {
    error_response_with_details(status, code, message, None)
}

pub fn error_response_with_details(
    status: StatusCode,
    code: ApiErrorCode,
    message: impl Into<String>,
    details: Option<Value>,
) -> ApiErrorTuple {
    (
        status,
        Json(ApiErrorResponse {
            success: false,
            error: message.into(),
            code: code.as_str(),
            details,
        }),
    )
}

pub fn validation_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::InvalidRequest, message)
}

pub fn unauthorized_error() -> ApiErrorTuple {
    error_response(ApiErrorCode::Unauthorized, "Unauthorized")
}

pub fn not_found_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::NotFound, message)
}

pub fn conflict_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::Conflict, message)
}
