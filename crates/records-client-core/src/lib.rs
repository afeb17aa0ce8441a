pub mod client;
pub mod downloads;
pub mod listing;

pub use client::RecordsServiceClient;
pub use downloads::{
    DOWNLOADS_STORAGE_KEY, DownloadItem, DownloadLog, DownloadLogError, JsonFileKeyValueStore,
    KeyValueStore, MemoryKeyValueStore,
};
pub use listing::{
    ImportSummary, ListingError, ListingSnapshot, LoadMoreOutcome, Record, RecordListing,
    RecordPage, RecordsFetcher,
};
