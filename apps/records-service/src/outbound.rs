use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::config::{Config, OutboundRoute};

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("No webhook URL configured for record type: {routing_key}")]
    Configuration { routing_key: String },
    #[error("Webhook failed: {reason}")]
    Delivery {
        status: Option<u16>,
        reason: String,
        body: String,
    },
}

#[derive(Debug, Clone)]
pub struct OutboundDelivery {
    pub routing_key: String,
    pub status: u16,
    pub body: Value,
}

/// Forwards payloads verbatim to the webhook URL registered for their record type.
#[derive(Debug, Clone)]
pub struct OutboundNotifier {
    routes: HashMap<String, String>,
    prefix: String,
    http: reqwest::Client,
}

impl OutboundNotifier {
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.outbound_routes, &config.outbound_route_prefix)
    }

    pub fn new(routes: &[OutboundRoute], prefix: &str) -> Self {
        Self {
            routes: routes
                .iter()
                .map(|route| (route.routing_key.to_lowercase(), route.url.clone()))
                .collect(),
            prefix: prefix.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn routing_key(&self, payload: &Value) -> String {
        let record_type = payload
            .get("data")
            .and_then(|data| data.get("recordType"))
            .and_then(Value::as_str)
            .or_else(|| payload.get("recordType").and_then(Value::as_str))
            .unwrap_or_default()
            .trim();
        record_type
            .strip_prefix(self.prefix.as_str())
            .unwrap_or(record_type)
            .to_lowercase()
    }

    pub async fn notify(&self, payload: &Value) -> Result<OutboundDelivery, OutboundError> {
        let routing_key = self.routing_key(payload);
        let Some(url) = self.routes.get(&routing_key) else {
            tracing::warn!(
                target: "records.outbound",
                routing_key = %routing_key,
                "no outbound webhook configured",
            );
            return Err(OutboundError::Configuration { routing_key });
        };

        let response = self
            .http
            .post(url.as_str())
            .json(payload)
            .send()
            .await
            .map_err(|error| OutboundError::Delivery {
                status: None,
                reason: "request error".to_string(),
                body: error.to_string(),
            })?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            tracing::warn!(
                target: "records.outbound",
                routing_key = %routing_key,
                status = status.as_u16(),
                "outbound webhook rejected payload",
            );
            return Err(OutboundError::Delivery {
                status: Some(status.as_u16()),
                reason: match status.canonical_reason() {
                    Some(text) => format!("{} {text}", status.as_u16()),
                    None => status.as_u16().to_string(),
                },
                body: text,
            });
        }

        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        tracing::info!(
            target: "records.outbound",
            routing_key = %routing_key,
            status = status.as_u16(),
            "outbound webhook delivered",
        );

        Ok(OutboundDelivery {
            routing_key,
            status: status.as_u16(),
            body,
        })
    }
}
