//! Download history ledger.
//!
//! Completed downloads are appended to a CSV file. Listing can collapse
//! repeated downloads of the same model version and sort by model type;
//! older 7- and 8-column ledgers and the plain-text format that preceded
//! them are still readable.

mod legacy;
mod record;
mod store;

pub use legacy::parse_legacy_line;
pub use record::{format_file_size, DownloadRecord, RecordKey, HEADER};
pub use store::{deduplicate, HistoryStore, ListOptions, MigrationSummary};
