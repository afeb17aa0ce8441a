use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListingError {
    #[error("records request failed: {message}")]
    Request { message: String },
    #[error("records service returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("records response could not be decoded: {message}")]
    Decode { message: String },
    #[error("{message}")]
    Rejected { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(rename = "_id", default)]
    pub document_id: String,
    pub id: String,
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub record_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default)]
    pub created_time: String,
    #[serde(default)]
    pub updated_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub created: usize,
    pub updated: usize,
    pub pages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMoreOutcome {
    /// No cursor, no selection, or a load already in flight.
    Skipped,
    Appended(usize),
    /// The selection changed while the page was in flight.
    Stale,
}

/// Source of record pages, usually [`crate::RecordsServiceClient`].
#[async_trait]
pub trait RecordsFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        action: &str,
        cursor: Option<&str>,
        search: Option<&str>,
    ) -> Result<RecordPage, ListingError>;

    async fn import(&self, action: &str) -> Result<ImportSummary, ListingError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingSnapshot {
    pub records: Vec<Record>,
    pub cursor: Option<String>,
    pub action_key: Option<String>,
    pub search: String,
    pub is_loading: bool,
    pub is_loading_more: bool,
    pub is_importing: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct ListingState {
    view: ListingSnapshot,
    generation: u64,
}

/// Accumulating, cursor-driven record list for one selected record type.
///
/// The mutex is never held across an await. Each in-flight fetch carries the
/// generation it started under; results from an older generation are dropped.
pub struct RecordListing<F> {
    fetcher: F,
    state: Mutex<ListingState>,
}

impl<F: RecordsFetcher> RecordListing<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            state: Mutex::new(ListingState::default()),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn snapshot(&self) -> ListingSnapshot {
        self.lock().view.clone()
    }

    /// Switches record type and search, clearing accumulated records even
    /// when a load is in flight, then fetches the first page.
    pub async fn select(&self, action: Option<&str>, search: &str) -> Result<(), ListingError> {
        {
            let mut state = self.lock();
            state.generation += 1;
            state.view = ListingSnapshot {
                action_key: action
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(ToString::to_string),
                search: search.trim().to_string(),
                is_importing: state.view.is_importing,
                ..ListingSnapshot::default()
            };
        }
        self.refresh().await
    }

    /// Replaces the accumulated records with the first page of the current selection.
    pub async fn refresh(&self) -> Result<(), ListingError> {
        let (generation, action, search) = {
            let mut state = self.lock();
            let Some(action) = state.view.action_key.clone() else {
                return Ok(());
            };
            state.view.is_loading = true;
            (state.generation, action, state.view.search.clone())
        };

        let result = self
            .fetcher
            .fetch_page(&action, None, non_empty(&search))
            .await;

        let mut state = self.lock();
        if state.generation != generation {
            return Ok(());
        }
        state.view.is_loading = false;
        match result {
            Ok(page) => {
                state.view.records = page.records;
                state.view.cursor = page.cursor;
                state.view.last_error = None;
                Ok(())
            }
            Err(error) => {
                tracing::warn!(action = %action, error = %error, "record listing refresh failed");
                state.view.records.clear();
                state.view.cursor = None;
                state.view.last_error = Some(error.to_string());
                Err(error)
            }
        }
    }

    /// Appends the next page. A call made while another is pending is dropped.
    pub async fn load_more(&self) -> Result<LoadMoreOutcome, ListingError> {
        let (generation, action, cursor, search) = {
            let mut state = self.lock();
            let (Some(action), Some(cursor)) =
                (state.view.action_key.clone(), state.view.cursor.clone())
            else {
                return Ok(LoadMoreOutcome::Skipped);
            };
            if state.view.is_loading_more {
                return Ok(LoadMoreOutcome::Skipped);
            }
            state.view.is_loading_more = true;
            (state.generation, action, cursor, state.view.search.clone())
        };

        let result = self
            .fetcher
            .fetch_page(&action, Some(&cursor), non_empty(&search))
            .await;

        let mut state = self.lock();
        if state.generation != generation {
            return Ok(LoadMoreOutcome::Stale);
        }
        state.view.is_loading_more = false;
        match result {
            Ok(page) => {
                let appended = page.records.len();
                state.view.records.extend(page.records);
                state.view.cursor = page.cursor;
                Ok(LoadMoreOutcome::Appended(appended))
            }
            Err(error) => {
                state.view.last_error = Some(error.to_string());
                Err(error)
            }
        }
    }

    /// Pulls fresh data into the service for the selected type, then reloads
    /// the first page. Returns `Ok(None)` when skipped.
    pub async fn import(&self) -> Result<Option<ImportSummary>, ListingError> {
        let action = {
            let mut state = self.lock();
            let Some(action) = state.view.action_key.clone() else {
                return Ok(None);
            };
            if state.view.is_importing {
                return Ok(None);
            }
            state.view.is_importing = true;
            action
        };

        let result = self.fetcher.import(&action).await;

        {
            let mut state = self.lock();
            state.view.is_importing = false;
            if let Err(error) = &result {
                state.view.last_error = Some(error.to_string());
            }
        }

        let summary = result?;
        self.refresh().await?;
        Ok(Some(summary))
    }

    fn lock(&self) -> MutexGuard<'_, ListingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
