//! Import scan results into the history ledger.

use crate::error::Result;
use crate::history::{DownloadRecord, HistoryStore, ListOptions};
use crate::scanner::ScanEntry;
use std::collections::HashSet;
use tracing::{debug, info};

/// Counts from [`import_scan_results`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub skipped: usize,
}

impl ScanEntry {
    /// Ledger row for this entry, stamped now.
    pub fn to_record(&self) -> DownloadRecord {
        let url = self
            .civitai_url
            .clone()
            .or_else(|| self.download_urls.first().cloned())
            .unwrap_or_default();

        let mut record = DownloadRecord::new(url, self.model_type, self.file_name.clone())
            .with_ids(self.model_id, self.version_id);
        if let Some(bytes) = self.file_size {
            record = record.with_size(bytes);
        }
        record.api_model_type = self.api_model_type.clone();
        record.lora_subcategory = self.lora_subcategory;
        record
    }
}

/// Append scan entries the ledger does not know yet.
///
/// An entry is skipped when its model and version IDs already appear in the
/// ledger or earlier in `entries`. Entries without both IDs are always added.
pub fn import_scan_results(store: &HistoryStore, entries: &[ScanEntry]) -> Result<ImportSummary> {
    let mut seen: HashSet<(u64, u64)> = store
        .list(ListOptions::raw())?
        .iter()
        .filter_map(|r| Some((r.model_id?, r.version_id?)))
        .collect();

    let mut summary = ImportSummary::default();
    for entry in entries {
        if let (Some(model_id), Some(version_id)) = (entry.model_id, entry.version_id) {
            if !seen.insert((model_id, version_id)) {
                debug!(
                    "Skipping {}: model {} version {} already recorded",
                    entry.file_name, model_id, version_id
                );
                summary.skipped += 1;
                continue;
            }
        }
        store.append(&entry.to_record())?;
        summary.added += 1;
    }

    info!(
        "Imported {} scan results into {} ({} skipped)",
        summary.added,
        store.path().display(),
        summary.skipped
    );
    Ok(summary)
}
