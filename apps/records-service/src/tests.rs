use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use crate::config::{Config, OutboundRoute};
use crate::integration::{Connection, IntegrationClient, IntegrationError, TenantContext};
use crate::record_store::RecordStore;
use crate::{build_router, build_router_with_parts};

#[derive(Default)]
struct StubIntegration {
    connections: Vec<Connection>,
    outputs: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<Value>>,
}

impl StubIntegration {
    fn with_connection(outputs: Vec<Value>) -> Self {
        Self {
            connections: vec![Connection {
                id: "conn_1".to_string(),
                name: Some("Drive".to_string()),
            }],
            outputs: Mutex::new(outputs.into()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl IntegrationClient for StubIntegration {
    async fn list_connections(
        &self,
        _tenant: &TenantContext,
    ) -> Result<Vec<Connection>, IntegrationError> {
        Ok(self.connections.clone())
    }

    async fn run_action(
        &self,
        tenant: &TenantContext,
        connection_id: &str,
        action_key: &str,
        input: Value,
    ) -> Result<Value, IntegrationError> {
        self.calls.lock().await.push(json!({
            "customerId": tenant.customer_id,
            "connectionId": connection_id,
            "action": action_key,
            "input": input,
        }));
        self.outputs
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| IntegrationError::Request {
                message: "stub exhausted".to_string(),
            })
    }
}

fn router_with_integration(config: Config, integration: Arc<StubIntegration>) -> Router {
    let store = RecordStore::from_config(&config);
    let integration: Arc<dyn IntegrationClient> = integration;
    build_router_with_parts(config, store, Some(integration))
}

fn json_request(method: Method, uri: &str, body: &Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .header("x-customer-id", "c1")
        .body(Body::from(serde_json::to_vec(body)?))?)
}

fn tenant_get(uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .uri(uri)
        .header("x-customer-id", "c1")
        .body(Body::empty())?)
}

async fn read_json(response: axum::response::Response) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    let value = serde_json::from_slice::<Value>(&bytes)?;
    Ok(value)
}

async fn spawn_stub(app: Router) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("stub server failed");
    });
    Ok((addr, handle))
}

#[tokio::test]
async fn healthz_reports_service_identity() -> Result<()> {
    let app = build_router(Config::for_tests());
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty())?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = read_json(response).await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "records-service");
    Ok(())
}

#[tokio::test]
async fn create_then_patch_replaces_fields_and_keeps_name() -> Result<()> {
    let app = build_router(Config::for_tests());

    let created = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/webhooks",
            &json!({
                "customerId": "c1",
                "recordType": "get-files",
                "data": {"id": "f1", "name": "Report.pdf", "fields": {"owner": "ana"}}
            }),
        )?)
        .await?;
    assert_eq!(created.status(), StatusCode::OK);
    let created = read_json(created).await?;
    assert_eq!(created["success"], true);
    assert_eq!(created["status"], "created");
    assert_eq!(created["recordId"], "f1");
    assert_eq!(created["customerId"], "c1");
    assert_eq!(created["recordType"], "get-files");
    assert!(created["_id"].as_str().unwrap_or_default().starts_with("rec_"));

    let updated = app
        .clone()
        .oneshot(json_request(
            Method::PATCH,
            "/webhooks",
            &json!({
                "customerId": "c1",
                "recordType": "get-files",
                "data": {"id": "f1", "fields": {"size": 42}}
            }),
        )?)
        .await?;
    assert_eq!(updated.status(), StatusCode::OK);
    let updated = read_json(updated).await?;
    assert_eq!(updated["status"], "updated");
    assert_eq!(updated["_id"], created["_id"]);

    let listed = app.oneshot(tenant_get("/records?action=get-files")?).await?;
    assert_eq!(listed.status(), StatusCode::OK);
    let listed = read_json(listed).await?;
    let records = listed["records"].as_array().cloned().unwrap_or_default();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["name"], "Report.pdf");
    assert_eq!(records[0]["fields"], json!({"size": 42}));
    assert_eq!(listed["cursor"], Value::Null);
    Ok(())
}

#[tokio::test]
async fn duplicate_create_is_rejected_with_conflict() -> Result<()> {
    let app = build_router(Config::for_tests());
    let first = json!({
        "customerId": "c1",
        "recordType": "get-files",
        "data": {"id": "f1", "name": "Original"}
    });
    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/webhooks", &first)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let second = json!({
        "customerId": "c1",
        "recordType": "get-files",
        "data": {"id": "f1", "name": "Replacement"}
    });
    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/webhooks", &second)?)
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = read_json(response).await?;
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "conflict");
    assert_eq!(
        body["error"],
        "Record already exists. Use PATCH endpoint for updates."
    );

    let listed = read_json(app.oneshot(tenant_get("/records?action=get-files")?).await?).await?;
    assert_eq!(listed["records"][0]["name"], "Original");
    Ok(())
}

#[tokio::test]
async fn create_requires_identity_fields() -> Result<()> {
    let app = build_router(Config::for_tests());
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/webhooks",
            &json!({"customerId": "c1", "data": {"id": "f1"}}),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await?;
    assert_eq!(body["code"], "invalid_request");
    assert_eq!(
        body["error"],
        "Missing required fields: customerId, data.id, and recordType are required"
    );
    Ok(())
}

#[tokio::test]
async fn create_accepts_numeric_ids_and_defaults_name() -> Result<()> {
    let app = build_router(Config::for_tests());
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/webhooks",
            &json!({"customerId": "c1", "recordType": "get-orders", "data": {"id": 1001}}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await?["recordId"], "1001");

    let listed = read_json(app.oneshot(tenant_get("/records?action=get-orders")?).await?).await?;
    assert_eq!(listed["records"][0]["name"], "1001");
    assert_eq!(listed["records"][0]["fields"], json!({}));
    assert!(listed["records"][0].get("uri").is_none());
    Ok(())
}

#[tokio::test]
async fn update_of_missing_record_is_not_found() -> Result<()> {
    let app = build_router(Config::for_tests());
    let response = app
        .clone()
        .oneshot(json_request(
            Method::PATCH,
            "/webhooks",
            &json!({"customerId": "c1", "recordType": "get-files", "data": {"id": "ghost"}}),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = read_json(response).await?;
    assert_eq!(
        body["error"],
        "Record not found. Use POST endpoint to create new records."
    );

    let listed = read_json(app.oneshot(tenant_get("/records?action=get-files")?).await?).await?;
    assert_eq!(listed["records"], json!([]));
    Ok(())
}

#[tokio::test]
async fn delete_twice_reports_not_found_the_second_time() -> Result<()> {
    let app = build_router(Config::for_tests());
    let created = read_json(
        app.clone()
            .oneshot(json_request(
                Method::POST,
                "/webhooks",
                &json!({"customerId": "c1", "recordType": "get-files", "data": {"id": "f1"}}),
            )?)
            .await?,
    )
    .await?;

    let delete_body = json!({"customerId": "c1", "recordType": "get-files", "recordId": "f1"});
    let first = app
        .clone()
        .oneshot(json_request(Method::DELETE, "/webhooks", &delete_body)?)
        .await?;
    assert_eq!(first.status(), StatusCode::OK);
    let first = read_json(first).await?;
    assert_eq!(first["status"], "deleted");
    assert_eq!(first["_id"], created["_id"]);

    let second = app
        .clone()
        .oneshot(json_request(Method::DELETE, "/webhooks", &delete_body)?)
        .await?;
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_json(second).await?["error"], "Record not found");

    let patch = app
        .oneshot(json_request(
            Method::PATCH,
            "/webhooks",
            &json!({"customerId": "c1", "recordType": "get-files", "data": {"id": "f1"}}),
        )?)
        .await?;
    assert_eq!(patch.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn delete_requires_record_id() -> Result<()> {
    let app = build_router(Config::for_tests());
    let response = app
        .oneshot(json_request(
            Method::DELETE,
            "/webhooks",
            &json!({"customerId": "c1", "recordType": "get-files"}),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        read_json(response).await?["error"],
        "Missing required fields: customerId, recordId, and recordType are required"
    );
    Ok(())
}

#[tokio::test]
async fn webhook_secret_is_enforced_when_configured() -> Result<()> {
    let mut config = Config::for_tests();
    config.webhook_secret = Some("s3cret".to_string());
    let app = build_router(config);
    let body = json!({"customerId": "c1", "recordType": "get-files", "data": {"id": "f1"}});

    let rejected = app
        .clone()
        .oneshot(json_request(Method::POST, "/webhooks", &body)?)
        .await?;
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(rejected).await?["code"], "unauthorized");

    let mut request = json_request(Method::POST, "/webhooks", &body)?;
    request
        .headers_mut()
        .insert("x-webhook-secret", "s3cret".parse()?);
    let accepted = app.oneshot(request).await?;
    assert_eq!(accepted.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn listing_pages_with_opaque_cursor_and_search() -> Result<()> {
    let app = build_router(Config::for_tests());
    for (id, name, updated) in [
        ("a", "Alpha report", "2026-01-01T00:00:00.000Z"),
        ("b", "Beta sheet", "2026-01-02T00:00:00.000Z"),
        ("c", "Gamma report", "2026-01-03T00:00:00.000Z"),
    ] {
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/webhooks",
                &json!({
                    "customerId": "c1",
                    "recordType": "get-files",
                    "data": {"id": id, "name": name, "updatedTime": updated}
                }),
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let first =
        read_json(app.clone().oneshot(tenant_get("/records?action=get-files&limit=2")?).await?)
            .await?;
    assert_eq!(first["records"][0]["id"], "c");
    assert_eq!(first["records"][1]["id"], "b");
    let cursor = first["cursor"].as_str().unwrap_or_default().to_string();
    assert!(!cursor.is_empty());

    let second = read_json(
        app.clone()
            .oneshot(tenant_get(&format!(
                "/records?action=get-files&limit=2&cursor={cursor}"
            ))?)
            .await?,
    )
    .await?;
    assert_eq!(second["records"].as_array().map(Vec::len), Some(1));
    assert_eq!(second["records"][0]["id"], "a");
    assert_eq!(second["cursor"], Value::Null);

    let searched = read_json(
        app.clone()
            .oneshot(tenant_get("/records?action=get-files&search=REPORT")?)
            .await?,
    )
    .await?;
    assert_eq!(searched["records"].as_array().map(Vec::len), Some(2));

    let other_tenant = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/records?action=get-files")
                .header("x-customer-id", "c2")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(read_json(other_tenant).await?["records"], json!([]));

    let invalid = app
        .clone()
        .oneshot(tenant_get("/records?action=get-files&cursor=not-a-cursor")?)
        .await?;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    let anonymous = app
        .oneshot(
            Request::builder()
                .uri("/records?action=get-files")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn import_pages_through_integration_and_upserts() -> Result<()> {
    let integration = Arc::new(StubIntegration::with_connection(vec![
        json!({
            "records": [
                {"id": "f1", "name": "One", "fields": {"size": 1}},
                {"id": "f2", "name": "Two"}
            ],
            "cursor": "page-2"
        }),
        json!({
            "records": [{"id": "f3", "uri": "https://files.test/3"}],
            "cursor": null
        }),
    ]));
    let app = router_with_integration(Config::for_tests(), integration.clone());

    let response = app
        .clone()
        .oneshot(tenant_get("/records/import?action=get-files")?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["imported"], 3);
    assert_eq!(body["data"]["created"], 3);
    assert_eq!(body["data"]["pages"], 2);

    let calls = integration.calls.lock().await.clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0]["action"], "get-files");
    assert_eq!(calls[0]["connectionId"], "conn_1");
    assert_eq!(calls[0]["input"], json!({}));
    assert_eq!(calls[1]["input"], json!({"cursor": "page-2"}));

    let listed = read_json(app.oneshot(tenant_get("/records?action=get-files")?).await?).await?;
    assert_eq!(listed["records"].as_array().map(Vec::len), Some(3));
    Ok(())
}

#[tokio::test]
async fn import_stops_at_page_limit() -> Result<()> {
    let mut config = Config::for_tests();
    config.import_max_pages = 1;
    let integration = Arc::new(StubIntegration::with_connection(vec![
        json!({"records": [{"id": "f1"}], "cursor": "more"}),
        json!({"records": [{"id": "f2"}]}),
    ]));
    let app = router_with_integration(config, integration.clone());

    let body = read_json(
        app.oneshot(tenant_get("/records/import?action=get-files")?)
            .await?,
    )
    .await?;
    assert_eq!(body["data"]["pages"], 1);
    assert_eq!(body["data"]["imported"], 1);
    assert_eq!(integration.calls.lock().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn import_without_connection_is_a_soft_failure() -> Result<()> {
    let app = router_with_integration(Config::for_tests(), Arc::new(StubIntegration::default()));
    let response = app
        .oneshot(tenant_get("/records/import?action=get-files")?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "No connection found");
    Ok(())
}

#[tokio::test]
async fn download_resolution_runs_download_file_action() -> Result<()> {
    let integration = Arc::new(StubIntegration::with_connection(vec![
        json!({"downloadUri": "https://files.test/f1"}),
        json!({"somethingElse": true}),
    ]));
    let app = router_with_integration(Config::for_tests(), integration.clone());

    let resolved = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/records/download",
            &json!({"fileId": "f1"}),
        )?)
        .await?;
    assert_eq!(resolved.status(), StatusCode::OK);
    let resolved = read_json(resolved).await?;
    assert_eq!(resolved["success"], true);
    assert_eq!(resolved["data"]["downloadUri"], "https://files.test/f1");
    let calls = integration.calls.lock().await.clone();
    assert_eq!(calls[0]["action"], "download-file");
    assert_eq!(calls[0]["input"], json!({"fileId": "f1"}));

    let missing_uri = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/records/download",
            &json!({"fileId": "f2"}),
        )?)
        .await?;
    assert_eq!(missing_uri.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = read_json(missing_uri).await?;
    assert_eq!(body["code"], "missing_download_uri");
    assert_eq!(body["error"], "No download URI found in response");

    let integration_failure = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/records/download",
            &json!({"fileId": "f3"}),
        )?)
        .await?;
    assert_eq!(
        integration_failure.status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    let body = read_json(integration_failure).await?;
    assert_eq!(body["error"], "Failed to download file");
    assert!(body["details"].is_string());

    let missing_file_id = app
        .clone()
        .oneshot(json_request(Method::POST, "/records/download", &json!({}))?)
        .await?;
    assert_eq!(missing_file_id.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(missing_file_id).await?["error"], "File ID is required");

    let anonymous = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/records/download")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"fileId":"f1"}"#))?,
        )
        .await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(anonymous).await?["error"], "Unauthorized");
    Ok(())
}

#[tokio::test]
async fn download_resolution_without_connection_is_soft() -> Result<()> {
    let app = router_with_integration(Config::for_tests(), Arc::new(StubIntegration::default()));
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/records/download",
            &json!({"fileId": "f1"}),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        read_json(response).await?,
        json!({"success": false, "error": "No connection found"})
    );
    Ok(())
}

#[tokio::test]
async fn http_integration_client_sends_tenant_and_bearer_token() -> Result<()> {
    let captured = Arc::new(Mutex::new(Vec::<Value>::new()));
    let stub = Router::new()
        .route(
            "/connections",
            get(
                |State(captured): State<Arc<Mutex<Vec<Value>>>>, headers: HeaderMap| async move {
                    captured.lock().await.push(json!({
                        "path": "connections",
                        "customerId": header_value(&headers, "x-customer-id"),
                        "authorization": header_value(&headers, AUTHORIZATION.as_str()),
                    }));
                    Json(json!({"items": [{"id": "conn_9", "name": "Drive"}]}))
                },
            ),
        )
        .route(
            "/connections/conn_9/actions/download-file/run",
            post(
                |State(captured): State<Arc<Mutex<Vec<Value>>>>,
                 Json(payload): Json<Value>| async move {
                    captured.lock().await.push(json!({
                        "path": "run",
                        "payload": payload,
                    }));
                    Json(json!({"output": {"downloadUri": "https://files.test/conn_9/f1"}}))
                },
            ),
        )
        .with_state(captured.clone());
    let (addr, handle) = spawn_stub(stub).await?;

    let mut config = Config::for_tests();
    config.integration_base_url = Some(format!("http://{addr}/"));
    config.integration_api_token = Some("token_123".to_string());
    let app = build_router(config);

    let response = app
        .oneshot(json_request(
            Method::POST,
            "/records/download",
            &json!({"fileId": "f1"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        read_json(response).await?["data"]["downloadUri"],
        "https://files.test/conn_9/f1"
    );

    let captured = captured.lock().await.clone();
    assert_eq!(captured.len(), 2);
    assert_eq!(captured[0]["customerId"], "c1");
    assert_eq!(captured[0]["authorization"], "Bearer token_123");
    assert_eq!(captured[1]["payload"], json!({"input": {"fileId": "f1"}}));

    handle.abort();
    Ok(())
}

#[tokio::test]
async fn download_requires_configured_integration() -> Result<()> {
    let app = build_router(Config::for_tests());
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/records/download",
            &json!({"fileId": "f1"}),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(read_json(response).await?["code"], "service_unavailable");
    Ok(())
}

#[tokio::test]
async fn download_proxy_reemits_upstream_bytes_and_headers() -> Result<()> {
    let stub = Router::new()
        .route(
            "/files/report",
            get(|| async {
                (
                    [
                        (CONTENT_TYPE, "application/pdf"),
                        (CONTENT_DISPOSITION, "attachment; filename=\"Q1 report.pdf\""),
                    ],
                    b"%PDF-1.7 body".to_vec(),
                )
            }),
        )
        .route("/files/bare", get(|| async { b"raw".to_vec() }));
    let (addr, handle) = spawn_stub(stub).await?;
    let app = build_router(Config::for_tests());

    let response = app
        .clone()
        .oneshot(tenant_get(&format!(
            "/records/download-proxy?uri=http://{addr}/files/report"
        ))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"Q1 report.pdf\""
    );
    assert_eq!(response.headers()[CONTENT_LENGTH], "13");
    let bytes = response.into_body().collect().await?.to_bytes();
    assert_eq!(&bytes[..], b"%PDF-1.7 body");

    let bare = app
        .oneshot(tenant_get(&format!(
            "/records/download-proxy?uri=http://{addr}/files/bare"
        ))?)
        .await?;
    assert_eq!(bare.status(), StatusCode::OK);
    assert_eq!(bare.headers()[CONTENT_TYPE], "application/octet-stream");
    assert_eq!(
        bare.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"download\""
    );

    handle.abort();
    Ok(())
}

#[tokio::test]
async fn download_proxy_passes_through_upstream_failure_status() -> Result<()> {
    let stub = Router::new().route(
        "/files/missing",
        get(|| async { (StatusCode::NOT_FOUND, "gone") }),
    );
    let (addr, handle) = spawn_stub(stub).await?;
    let app = build_router(Config::for_tests());

    let response = app
        .oneshot(tenant_get(&format!(
            "/records/download-proxy?uri=http://{addr}/files/missing"
        ))?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = read_json(response).await?;
    assert_eq!(body["error"], "Failed to fetch file: Not Found");
    assert_eq!(body["code"], "upstream_fetch_failed");

    handle.abort();
    Ok(())
}

#[tokio::test]
async fn download_proxy_validates_uri_and_tenant() -> Result<()> {
    let app = build_router(Config::for_tests());

    let missing = app
        .clone()
        .oneshot(tenant_get("/records/download-proxy")?)
        .await?;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(missing).await?["error"], "Download URI is required");

    let relative = app
        .clone()
        .oneshot(tenant_get("/records/download-proxy?uri=/etc/passwd")?)
        .await?;
    assert_eq!(relative.status(), StatusCode::BAD_REQUEST);

    let anonymous = app
        .oneshot(
            Request::builder()
                .uri("/records/download-proxy?uri=https://files.test/a")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn form_submission_is_forwarded_to_routed_webhook() -> Result<()> {
    let captured = Arc::new(Mutex::new(Vec::<Value>::new()));
    let stub = Router::new()
        .route(
            "/hooks/files",
            post(
                |State(captured): State<Arc<Mutex<Vec<Value>>>>,
                 Json(payload): Json<Value>| async move {
                    captured.lock().await.push(payload);
                    Json(json!({"accepted": true}))
                },
            ),
        )
        .route(
            "/hooks/folders",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "try later") }),
        )
        .with_state(captured.clone());
    let (addr, handle) = spawn_stub(stub).await?;

    let mut config = Config::for_tests();
    config.outbound_routes = vec![
        OutboundRoute {
            routing_key: "files".to_string(),
            url: format!("http://{addr}/hooks/files"),
        },
        OutboundRoute {
            routing_key: "folders".to_string(),
            url: format!("http://{addr}/hooks/folders"),
        },
    ];
    let app = build_router(config);

    let payload = json!({
        "customerId": "c1",
        "data": {"recordType": "get-files", "id": "f1", "name": "New file"}
    });
    let delivered = app
        .clone()
        .oneshot(json_request(Method::POST, "/forms/submit", &payload)?)
        .await?;
    assert_eq!(delivered.status(), StatusCode::OK);
    let body = read_json(delivered).await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!({"accepted": true}));
    assert_eq!(captured.lock().await.clone(), vec![payload]);

    let failed = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/forms/submit",
            &json!({"data": {"recordType": "get-folders"}}),
        )?)
        .await?;
    assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);
    let body = read_json(failed).await?;
    assert_eq!(body["code"], "delivery_failed");
    assert_eq!(body["error"], "Webhook failed: 503 Service Unavailable");
    assert_eq!(body["details"]["upstreamStatus"], 503);
    assert_eq!(body["details"]["body"], "try later");

    let unrouted = app
        .oneshot(json_request(
            Method::POST,
            "/forms/submit",
            &json!({"data": {"recordType": "get-orders"}}),
        )?)
        .await?;
    assert_eq!(unrouted.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_json(unrouted).await?["code"], "configuration_error");

    handle.abort();
    Ok(())
}

fn header_value(headers: &HeaderMap, key: &str) -> String {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn webhook_identity_with_separators_stays_with_its_customer() -> Result<()> {
    let app = build_router(Config::for_tests());
    let create = json!({
        "customerId": "acme::eu",
        "recordType": "get-files",
        "data": {"id": "f1", "name": "EU report"}
    });
    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/webhooks", &create)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let patch = json!({
        "customerId": "acme",
        "recordType": "get-files",
        "data": {"id": "eu::f1", "name": "hijacked"}
    });
    let response = app
        .clone()
        .oneshot(json_request(Method::PATCH, "/webhooks", &patch)?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let delete = json!({"customerId": "acme", "recordType": "get-files", "recordId": "eu::f1"});
    let response = app
        .clone()
        .oneshot(json_request(Method::DELETE, "/webhooks", &delete)?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let owner_delete = json!({
        "customerId": "acme::eu",
        "recordType": "get-files",
        "recordId": "f1"
    });
    let response = app
        .oneshot(json_request(Method::DELETE, "/webhooks", &owner_delete)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["customerId"], "acme::eu");
    Ok(())
}

#[tokio::test]
async fn webhook_accepts_scalar_names_and_timestamps() -> Result<()> {
    let app = build_router(Config::for_tests());
    let create = json!({
        "customerId": "c1",
        "recordType": "get-files",
        "data": {"id": "f1", "name": 123, "createdTime": 1_700_000_000, "fields": "n/a"}
    });
    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/webhooks", &create)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let listed = read_json(
        app.oneshot(tenant_get("/records?action=get-files")?)
            .await?,
    )
    .await?;
    let record = &listed["records"][0];
    assert_eq!(record["name"], "123");
    assert_eq!(record["createdTime"], "1700000000");
    assert_eq!(record["fields"], json!({}));
    Ok(())
}

#[tokio::test]
async fn malformed_json_body_gets_error_envelope() -> Result<()> {
    let app = build_router(Config::for_tests());
    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{\"customerId\": "))?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await?;
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "invalid_request");
    assert!(body["error"].as_str().is_some_and(|message| !message.is_empty()));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/records/download")
        .header("x-customer-id", "c1")
        .body(Body::from("{\"fileId\": \"f1\"}"))?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let body = read_json(response).await?;
    assert_eq!(body["code"], "invalid_request");
    Ok(())
}
