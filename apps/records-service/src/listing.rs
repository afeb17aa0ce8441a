use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use super::*;

use crate::record_store::{ImportSummary, ImportedRecordInput, ListRecordsQuery};
use crate::records::{RecordDocument, record_identifier};

const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub(super) struct ListRecordsParams {
    action: Option<String>,
    cursor: Option<String>,
    search: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ImportRecordsParams {
    action: Option<String>,
}

#[derive(Debug, Serialize)]
struct RecordListResponse {
    records: Vec<RecordDocument>,
    cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct ListCursor {
    offset: usize,
}

#[derive(Debug, Serialize)]
struct ImportReport {
    imported: usize,
    created: usize,
    updated: usize,
    pages: usize,
}

pub(super) async fn list_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListRecordsParams>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let tenant = tenant_from_headers(&headers)?;
    let Some(action) = non_empty(params.action) else {
        return Err(validation_error("action is required"));
    };
    let offset = match non_empty(params.cursor) {
        Some(cursor) => decode_cursor(&cursor)
            .ok_or_else(|| validation_error("Invalid cursor"))?
            .offset,
        None => 0,
    };
    let limit = params
        .limit
        .unwrap_or(state.config.list_page_size)
        .clamp(1, MAX_PAGE_SIZE);

    let page = state
        .store
        .list_records(ListRecordsQuery {
            customer_id: tenant.customer_id,
            record_type: action,
            search: params.search,
            offset,
            limit,
        })
        .await
        .map_err(|error| map_record_store_error(error, "Record not found"))?;

    Ok(Json(RecordListResponse {
        records: page.records,
        cursor: page.next_offset.map(encode_cursor),
    }))
}

pub(super) async fn import_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ImportRecordsParams>,
) -> Result<Response, ApiErrorTuple> {
    let tenant = tenant_from_headers(&headers)?;
    let Some(action) = non_empty(params.action) else {
        return Err(validation_error("action is required"));
    };
    let integration = integration_client(&state)?;

    let connection = integration
        .first_connection(&tenant)
        .await
        .map_err(|error| {
            map_integration_error(StatusCode::BAD_GATEWAY, "Failed to import records", &error)
        })?;
    let Some(connection) = connection else {
        return Ok(Json(json!({
            "success": false,
            "error": "No connection found",
        }))
        .into_response());
    };

    let mut totals = ImportSummary::default();
    let mut pages = 0usize;
    let mut cursor: Option<String> = None;

    loop {
        let input = match cursor.as_deref() {
            Some(cursor) => json!({ "cursor": cursor }),
            None => json!({}),
        };
        let output = integration
            .run_action(&tenant, &connection.id, &action, input)
            .await
            .map_err(|error| {
                map_integration_error(StatusCode::BAD_GATEWAY, "Failed to import records", &error)
            })?;
        pages += 1;

        let batch = imported_records(&output);
        let summary = state
            .store
            .import_records(&tenant.customer_id, &action, batch)
            .await
            .map_err(|error| map_record_store_error(error, "Record not found"))?;
        totals.created += summary.created;
        totals.updated += summary.updated;

        cursor = output
            .get("cursor")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);
        if cursor.is_none() {
            break;
        }
        if pages >= state.config.import_max_pages {
            tracing::warn!(
                target: "records.listing",
                customer_id = %tenant.customer_id,
                action = %action,
                pages,
                "import stopped at page limit with more data pending",
            );
            break;
        }
    }

    tracing::info!(
        target: "records.listing",
        customer_id = %tenant.customer_id,
        action = %action,
        created = totals.created,
        updated = totals.updated,
        pages,
        "import finished",
    );

    Ok(Json(json!({
        "success": true,
        "data": ImportReport {
            imported: totals.created + totals.updated,
            created: totals.created,
            updated: totals.updated,
            pages,
        },
    }))
    .into_response())
}

/// Reads `output.records`, skipping entries without a usable id.
fn imported_records(output: &Value) -> Vec<ImportedRecordInput> {
    let Some(records) = output.get("records").and_then(Value::as_array) else {
        return Vec::new();
    };

    records
        .iter()
        .filter_map(|record| {
            let id = record.get("id").and_then(record_identifier)?;
            let text = |key: &str| {
                record
                    .get(key)
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            };
            Some(ImportedRecordInput {
                id,
                name: text("name"),
                fields: record.get("fields").and_then(Value::as_object).cloned(),
                uri: text("uri"),
                created_time: text("createdTime"),
                updated_time: text("updatedTime"),
            })
        })
        .collect()
}

fn encode_cursor(offset: usize) -> String {
    let payload = serde_json::to_vec(&ListCursor { offset }).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(payload)
}

fn decode_cursor(cursor: &str) -> Option<ListCursor> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor.trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
