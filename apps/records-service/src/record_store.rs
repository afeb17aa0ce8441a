use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use uuid::Uuid;

use crate::config::Config;
use crate::records::{Patch, RecordDocument, RecordFields, non_blank, now_timestamp};

static SHARED_RECORD_STORE: OnceCell<RecordStore> = OnceCell::const_new();

#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    #[error("record not found")]
    NotFound,
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("{message}")]
    Conflict { message: String },
    #[error("{message}")]
    Persistence { message: String },
}

#[derive(Clone)]
pub struct RecordStore {
    state: Arc<RwLock<RecordStoreState>>,
    path: Option<PathBuf>,
}

/// Records grouped by customer, then by external id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RecordStoreState {
    customers: HashMap<String, HashMap<String, RecordDocument>>,
}

impl RecordStoreState {
    fn get(&self, customer_id: &str, id: &str) -> Option<&RecordDocument> {
        self.customers.get(customer_id)?.get(id)
    }

    fn get_mut(&mut self, customer_id: &str, id: &str) -> Option<&mut RecordDocument> {
        self.customers.get_mut(customer_id)?.get_mut(id)
    }

    fn insert(&mut self, document: RecordDocument) {
        self.customers
            .entry(document.customer_id.clone())
            .or_default()
            .insert(document.id.clone(), document);
    }

    fn remove(&mut self, customer_id: &str, id: &str) -> Option<RecordDocument> {
        let records = self.customers.get_mut(customer_id)?;
        let removed = records.remove(id);
        if records.is_empty() {
            self.customers.remove(customer_id);
        }
        removed
    }

    fn customer_records(&self, customer_id: &str) -> impl Iterator<Item = &RecordDocument> {
        self.customers
            .get(customer_id)
            .into_iter()
            .flat_map(HashMap::values)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateRecordInput {
    pub customer_id: String,
    pub record_type: String,
    pub id: String,
    pub name: Option<String>,
    pub fields: Option<RecordFields>,
    pub uri: Option<String>,
    pub created_time: Option<String>,
    pub updated_time: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRecordInput {
    pub customer_id: String,
    pub id: String,
    pub name: Patch<String>,
    pub fields: Patch<RecordFields>,
    pub uri: Patch<String>,
    pub updated_time: Option<String>,
}

/// One record pulled from the integration platform during a bulk import.
#[derive(Debug, Clone, Default)]
pub struct ImportedRecordInput {
    pub id: String,
    pub name: Option<String>,
    pub fields: Option<RecordFields>,
    pub uri: Option<String>,
    pub created_time: Option<String>,
    pub updated_time: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
}

#[derive(Debug, Clone)]
pub struct ListRecordsQuery {
    pub customer_id: String,
    pub record_type: String,
    pub search: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<RecordDocument>,
    pub next_offset: Option<usize>,
}

/// Process-wide store handle, opened on first use and reused afterwards.
pub async fn connect_shared(config: &Config) -> RecordStore {
    SHARED_RECORD_STORE
        .get_or_init(|| async {
            tracing::info!(
                target: "records.store",
                path = ?config.store_path,
                "opening shared record store",
            );
            RecordStore::from_config(config)
        })
        .await
        .clone()
}

impl RecordStore {
    pub fn from_config(config: &Config) -> Self {
        let path = config.store_path.clone();
        let state = Self::load_state(path.as_ref());

        Self {
            state: Arc::new(RwLock::new(state)),
            path,
        }
    }

    pub async fn find_record(
        &self,
        customer_id: &str,
        id: &str,
    ) -> Result<Option<RecordDocument>, RecordStoreError> {
        let customer_id = normalize_non_empty(customer_id, "customerId")?;
        let id = normalize_non_empty(id, "id")?;
        let state = self.state.read().await;
        Ok(state.get(&customer_id, &id).cloned())
    }

    pub async fn create_record(
        &self,
        input: CreateRecordInput,
    ) -> Result<RecordDocument, RecordStoreError> {
        let customer_id = normalize_non_empty(&input.customer_id, "customerId")?;
        let record_type = normalize_non_empty(&input.record_type, "recordType")?;
        let id = normalize_non_empty(&input.id, "id")?;

        self.mutate(|state| {
            if state.get(&customer_id, &id).is_some() {
                return Err(RecordStoreError::Conflict {
                    message: "Record already exists. Use PATCH endpoint for updates.".to_string(),
                });
            }

            let now = now_timestamp();
            let created_time =
                non_blank(input.created_time.as_deref()).unwrap_or_else(|| now.clone());
            let updated_time = non_blank(input.updated_time.as_deref()).unwrap_or(now);
            let document = RecordDocument {
                document_id: format!("rec_{}", Uuid::new_v4().simple()),
                name: non_blank(input.name.as_deref()).unwrap_or_else(|| id.clone()),
                id,
                customer_id,
                record_type,
                fields: input.fields.unwrap_or_default(),
                uri: non_blank(input.uri.as_deref()),
                created_time,
                updated_time,
            };
            state.insert(document.clone());
            Ok(document)
        })
        .await
    }

    pub async fn update_record(
        &self,
        input: UpdateRecordInput,
    ) -> Result<RecordDocument, RecordStoreError> {
        let customer_id = normalize_non_empty(&input.customer_id, "customerId")?;
        let id = normalize_non_empty(&input.id, "id")?;

        self.mutate(|state| {
            let document = state
                .get_mut(&customer_id, &id)
                .ok_or(RecordStoreError::NotFound)?;

            match input.name {
                Patch::Absent => {}
                Patch::Null => document.name = document.id.clone(),
                Patch::Value(name) => {
                    document.name =
                        non_blank(Some(name.as_str())).unwrap_or_else(|| document.id.clone());
                }
            }
            match input.fields {
                Patch::Absent => {}
                Patch::Null => document.fields = RecordFields::new(),
                Patch::Value(fields) => document.fields = fields,
            }
            match input.uri {
                Patch::Absent => {}
                Patch::Null => document.uri = None,
                Patch::Value(uri) => document.uri = non_blank(Some(uri.as_str())),
            }
            document.updated_time =
                non_blank(input.updated_time.as_deref()).unwrap_or_else(now_timestamp);

            Ok(document.clone())
        })
        .await
    }

    pub async fn delete_record(
        &self,
        customer_id: &str,
        id: &str,
    ) -> Result<RecordDocument, RecordStoreError> {
        let customer_id = normalize_non_empty(customer_id, "customerId")?;
        let id = normalize_non_empty(id, "id")?;

        self.mutate(|state| {
            state
                .remove(&customer_id, &id)
                .ok_or(RecordStoreError::NotFound)
        })
        .await
    }

    pub async fn list_records(
        &self,
        query: ListRecordsQuery,
    ) -> Result<RecordPage, RecordStoreError> {
        let customer_id = normalize_non_empty(&query.customer_id, "customerId")?;
        let record_type = normalize_non_empty(&query.record_type, "recordType")?;
        let search = non_blank(query.search.as_deref()).map(|value| value.to_lowercase());
        let limit = query.limit.max(1);

        let mut matching = {
            let state = self.state.read().await;
            state
                .customer_records(&customer_id)
                .filter(|record| record.record_type == record_type)
                .filter(|record| match search.as_deref() {
                    Some(needle) => {
                        record.name.to_lowercase().contains(needle)
                            || record.id.to_lowercase().contains(needle)
                    }
                    None => true,
                })
                .cloned()
                .collect::<Vec<_>>()
        };

        matching.sort_by(|left, right| {
            right
                .updated_time
                .cmp(&left.updated_time)
                .then_with(|| left.id.cmp(&right.id))
        });

        let total = matching.len();
        let records = matching
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .collect::<Vec<_>>();
        let next_offset = query
            .offset
            .checked_add(limit)
            .filter(|next| *next < total);

        Ok(RecordPage {
            records,
            next_offset,
        })
    }

    /// Upserts a batch under `(customerId, id)` in a single write.
    pub async fn import_records(
        &self,
        customer_id: &str,
        record_type: &str,
        records: Vec<ImportedRecordInput>,
    ) -> Result<ImportSummary, RecordStoreError> {
        let customer_id = normalize_non_empty(customer_id, "customerId")?;
        let record_type = normalize_non_empty(record_type, "recordType")?;

        self.mutate(|state| {
            let mut summary = ImportSummary::default();
            for input in records {
                let Some(id) = non_blank(Some(input.id.as_str())) else {
                    continue;
                };
                let now = now_timestamp();
                let updated_time =
                    non_blank(input.updated_time.as_deref()).unwrap_or_else(|| now.clone());

                if let Some(existing) = state.get_mut(&customer_id, &id) {
                    if let Some(name) = non_blank(input.name.as_deref()) {
                        existing.name = name;
                    }
                    if let Some(fields) = input.fields {
                        existing.fields = fields;
                    }
                    if let Some(uri) = non_blank(input.uri.as_deref()) {
                        existing.uri = Some(uri);
                    }
                    existing.updated_time = updated_time;
                    summary.updated += 1;
                    continue;
                }

                let document = RecordDocument {
                    document_id: format!("rec_{}", Uuid::new_v4().simple()),
                    name: non_blank(input.name.as_deref()).unwrap_or_else(|| id.clone()),
                    id,
                    customer_id: customer_id.clone(),
                    record_type: record_type.clone(),
                    fields: input.fields.unwrap_or_default(),
                    uri: non_blank(input.uri.as_deref()),
                    created_time: non_blank(input.created_time.as_deref()).unwrap_or(now),
                    updated_time,
                };
                state.insert(document);
                summary.created += 1;
            }
            Ok(summary)
        })
        .await
    }

    fn load_state(path: Option<&PathBuf>) -> RecordStoreState {
        let Some(path) = path else {
            return RecordStoreState::default();
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return RecordStoreState::default();
            }
            Err(error) => {
                tracing::warn!(
                    target: "records.store",
                    path = %path.display(),
                    error = %error,
                    "failed to read record store; booting with empty state",
                );
                return RecordStoreState::default();
            }
        };

        match serde_json::from_str::<RecordStoreState>(&raw) {
            Ok(state) => state,
            Err(error) => {
                let quarantine =
                    path.with_extension(format!("corrupt-{}", Uuid::new_v4().simple()));
                match std::fs::rename(path, &quarantine) {
                    Ok(()) => tracing::error!(
                        target: "records.store",
                        path = %path.display(),
                        moved_to = %quarantine.display(),
                        error = %error,
                        "record store is unparseable; moved aside and booting with empty state",
                    ),
                    Err(rename_error) => tracing::error!(
                        target: "records.store",
                        path = %path.display(),
                        error = %error,
                        rename_error = %rename_error,
                        "record store is unparseable and could not be moved aside",
                    ),
                }
                RecordStoreState::default()
            }
        }
    }

    async fn persist_state(&self, snapshot: &RecordStoreState) -> Result<(), RecordStoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                RecordStoreError::Persistence {
                    message: format!("failed to prepare record store directory: {error}"),
                }
            })?;
        }

        let payload =
            serde_json::to_vec(snapshot).map_err(|error| RecordStoreError::Persistence {
                message: format!("failed to encode record store payload: {error}"),
            })?;

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|error| RecordStoreError::Persistence {
                message: format!("failed to write record store payload: {error}"),
            })?;

        tokio::fs::rename(&temp_path, path).await.map_err(|error| {
            RecordStoreError::Persistence {
                message: format!("failed to finalize record store payload: {error}"),
            }
        })?;

        Ok(())
    }

    /// Applies `operation` to a copy of the state and publishes it only after
    /// the copy is on disk. The write lock is held across the file write so
    /// snapshots land in mutation order.
    async fn mutate<T, F>(&self, operation: F) -> Result<T, RecordStoreError>
    where
        F: FnOnce(&mut RecordStoreState) -> Result<T, RecordStoreError>,
    {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let result = operation(&mut next)?;
        self.persist_state(&next).await?;
        *state = next;
        Ok(result)
    }
}

fn normalize_non_empty(value: &str, field: &'static str) -> Result<String, RecordStoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RecordStoreError::Validation {
            field,
            message: "value is required".to_string(),
        });
    }

    Ok(trimmed.to_string())
}
