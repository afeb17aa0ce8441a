use super::*;

use crate::record_store::{CreateRecordInput, UpdateRecordInput};
use crate::records::{Patch, RecordDocument, RecordFields, record_identifier, scalar_text};

const MISSING_UPSERT_FIELDS: &str =
    "Missing required fields: customerId, data.id, and recordType are required";
const MISSING_DELETE_FIELDS: &str =
    "Missing required fields: customerId, recordId, and recordType are required";
const UPDATE_NOT_FOUND: &str = "Record not found. Use POST endpoint to create new records.";
const RECORD_NOT_FOUND: &str = "Record not found";

/// `data` as sent. Only `id` is required; other fields are read leniently.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEventData {
    #[serde(default)]
    name: Patch<Value>,
    #[serde(default)]
    fields: Patch<Value>,
    #[serde(default)]
    uri: Patch<Value>,
    #[serde(default)]
    created_time: Option<Value>,
    #[serde(default)]
    updated_time: Option<Value>,
}

#[derive(Debug, Default)]
struct RecordEventData {
    name: Patch<String>,
    fields: Patch<RecordFields>,
    uri: Patch<String>,
    created_time: Option<String>,
    updated_time: Option<String>,
}

impl From<RawEventData> for RecordEventData {
    fn from(raw: RawEventData) -> Self {
        Self {
            name: raw.name.and_then_value(|value| scalar_text(&value)),
            fields: raw.fields.and_then_value(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            }),
            uri: raw.uri.and_then_value(|value| scalar_text(&value)),
            created_time: raw.created_time.as_ref().and_then(record_identifier),
            updated_time: raw.updated_time.as_ref().and_then(record_identifier),
        }
    }
}

/// Identity plus the decoded `data` object of a create or update event.
struct RecordEvent {
    customer_id: String,
    record_type: String,
    id: String,
    data: RecordEventData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookAck {
    success: bool,
    record_id: String,
    #[serde(rename = "_id")]
    document_id: String,
    customer_id: String,
    record_type: String,
    status: &'static str,
}

impl WebhookAck {
    fn new(document: &RecordDocument, record_type: String, status: &'static str) -> Self {
        Self {
            success: true,
            record_id: document.id.clone(),
            document_id: document.document_id.clone(),
            customer_id: document.customer_id.clone(),
            record_type,
            status,
        }
    }
}

pub(super) async fn create_record(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let payload = json_body(payload)?;
    let event = parse_record_event(&payload)?;
    let RecordEventData {
        name,
        fields,
        uri,
        created_time,
        updated_time,
    } = event.data;

    let document = state
        .store
        .create_record(CreateRecordInput {
            customer_id: event.customer_id,
            record_type: event.record_type,
            id: event.id,
            name: name.into_option(),
            fields: fields.into_option(),
            uri: uri.into_option(),
            created_time,
            updated_time,
        })
        .await
        .map_err(|error| map_record_store_error(error, RECORD_NOT_FOUND))?;

    tracing::info!(
        target: "records.webhooks",
        customer_id = %document.customer_id,
        record_type = %document.record_type,
        record_id = %document.id,
        "record created",
    );
    let record_type = document.record_type.clone();
    Ok(Json(WebhookAck::new(&document, record_type, "created")))
}

pub(super) async fn update_record(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let payload = json_body(payload)?;
    let event = parse_record_event(&payload)?;

    let document = state
        .store
        .update_record(UpdateRecordInput {
            customer_id: event.customer_id,
            id: event.id,
            name: event.data.name,
            fields: event.data.fields,
            uri: event.data.uri,
            updated_time: event.data.updated_time,
        })
        .await
        .map_err(|error| map_record_store_error(error, UPDATE_NOT_FOUND))?;

    tracing::info!(
        target: "records.webhooks",
        customer_id = %document.customer_id,
        record_type = %event.record_type,
        record_id = %document.id,
        "record updated",
    );
    Ok(Json(WebhookAck::new(&document, event.record_type, "updated")))
}

pub(super) async fn delete_record(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let payload = json_body(payload)?;
    let customer_id = string_field(&payload, "customerId");
    let record_type = string_field(&payload, "recordType");
    let record_id = payload.get("recordId").and_then(record_identifier);
    let (Some(customer_id), Some(record_type), Some(record_id)) =
        (customer_id, record_type, record_id)
    else {
        return Err(validation_error(MISSING_DELETE_FIELDS));
    };

    let document = state
        .store
        .delete_record(&customer_id, &record_id)
        .await
        .map_err(|error| map_record_store_error(error, RECORD_NOT_FOUND))?;

    tracing::info!(
        target: "records.webhooks",
        customer_id = %document.customer_id,
        record_type = %record_type,
        record_id = %document.id,
        "record deleted",
    );
    Ok(Json(WebhookAck::new(&document, record_type, "deleted")))
}

fn parse_record_event(payload: &Value) -> Result<RecordEvent, ApiErrorTuple> {
    let customer_id = string_field(payload, "customerId");
    let record_type = string_field(payload, "recordType");
    let data = payload.get("data").filter(|data| data.is_object());
    let id = data
        .and_then(|data| data.get("id"))
        .and_then(record_identifier);

    let (Some(customer_id), Some(record_type), Some(data), Some(id)) =
        (customer_id, record_type, data, id)
    else {
        return Err(validation_error(MISSING_UPSERT_FIELDS));
    };

    let data = serde_json::from_value::<RawEventData>(data.clone())
        .map_err(|error| validation_error(format!("Invalid record data: {error}")))?
        .into();

    Ok(RecordEvent {
        customer_id,
        record_type,
        id,
        data,
    })
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
