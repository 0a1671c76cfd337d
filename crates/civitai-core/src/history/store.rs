//! CSV-backed download ledger.

use crate::config::HistoryConfig;
use crate::error::{CivitaiError, Result};
use crate::history::legacy::parse_legacy_line;
use crate::history::record::{DownloadRecord, RecordKey, HEADER};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How [`HistoryStore::list`] shapes its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    /// Collapse rows for the same model version (or URL).
    pub remove_duplicates: bool,
    /// Stable sort by model type: checkpoint, lora, embedding, other.
    pub sort_by_type: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            remove_duplicates: true,
            sort_by_type: false,
        }
    }
}

impl ListOptions {
    /// Every row, in file order.
    pub fn raw() -> Self {
        Self {
            remove_duplicates: false,
            sort_by_type: false,
        }
    }

    pub fn with_sort_by_type(mut self, sort: bool) -> Self {
        self.sort_by_type = sort;
        self
    }
}

/// Outcome of converting a plain-text history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub converted: usize,
    pub skipped: usize,
}

/// Append-only CSV ledger of completed downloads.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Never deduplicates.
    pub fn append(&self, record: &DownloadRecord) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CivitaiError::io_with_path(e, parent))?;
        }

        let needs_header = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        if !needs_header {
            self.upgrade_schema()?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CivitaiError::io_with_path(e, &self.path))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(HEADER)?;
        }
        writer.write_record(record.to_row())?;
        writer.flush().map_err(|e| CivitaiError::io_with_path(e, &self.path))?;

        debug!("Recorded {} in {}", record.filename, self.path.display());
        Ok(())
    }

    /// Read the ledger.
    pub fn list(&self, options: ListOptions) -> Result<Vec<DownloadRecord>> {
        let mut records = self.read_all()?;
        if options.remove_duplicates {
            records = deduplicate(records);
        }
        if options.sort_by_type {
            records.sort_by_key(|r| r.model_type.sort_priority());
        }
        Ok(records)
    }

    /// 1-based lookup matching the numbering of `history list`.
    pub fn find_by_index(&self, index: usize, options: ListOptions) -> Result<DownloadRecord> {
        let mut records = self.list(options)?;
        let len = records.len();
        if index == 0 || index > len {
            return Err(CivitaiError::IndexOutOfRange { index, len });
        }
        Ok(records.swap_remove(index - 1))
    }

    pub fn find_by_url(&self, url: &str, options: ListOptions) -> Result<Option<DownloadRecord>> {
        let url = url.trim();
        Ok(self.list(options)?.into_iter().find(|r| r.url == url))
    }

    pub fn contains_model(&self, model_id: u64, version_id: u64) -> Result<bool> {
        Ok(self
            .read_all()?
            .iter()
            .any(|r| r.model_id == Some(model_id) && r.version_id == Some(version_id)))
    }

    pub fn contains_url(&self, url: &str) -> Result<bool> {
        Ok(self.read_all()?.iter().any(|r| r.url == url))
    }

    /// Last `count` rows in file order.
    pub fn recent(&self, count: usize) -> Result<Vec<DownloadRecord>> {
        let mut records = self.read_all()?;
        let skip = records.len().saturating_sub(count);
        Ok(records.split_off(skip))
    }

    /// Rewrite the ledger without duplicates, keeping a `.backup` of the
    /// original. Returns the number of rows removed.
    pub fn clean_duplicates(&self) -> Result<usize> {
        let original = self.read_all()?;
        let unique = deduplicate(original.clone());
        let removed = original.len() - unique.len();
        if removed == 0 {
            return Ok(0);
        }

        let backup = self.backup_path();
        write_ledger(&backup, &original)?;
        write_ledger(&self.path, &unique)?;
        info!(
            "Removed {} duplicate rows from {} (backup: {})",
            removed,
            self.path.display(),
            backup.display()
        );
        Ok(removed)
    }

    /// Convert a plain-text history at `old` into a CSV ledger at `new`.
    ///
    /// Refuses to overwrite a non-empty ledger.
    pub fn migrate_legacy_text(old: &Path, new: &Path) -> Result<MigrationSummary> {
        let file = std::fs::File::open(old).map_err(|e| CivitaiError::io_with_path(e, old))?;
        if std::fs::metadata(new).map(|m| m.len() > 0).unwrap_or(false) {
            return Err(CivitaiError::DuplicateFile(new.to_path_buf()));
        }

        let mut summary = MigrationSummary::default();
        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| CivitaiError::io_with_path(e, old))?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_legacy_line(&line) {
                Some(record) => records.push(record),
                None => {
                    warn!("Skipping unparseable history line {}: {}", line_no + 1, line);
                    summary.skipped += 1;
                }
            }
        }

        summary.converted = records.len();
        write_ledger(new, &records)?;
        info!(
            "Converted {} history entries from {} to {}",
            summary.converted,
            old.display(),
            new.display()
        );
        Ok(summary)
    }

    pub fn backup_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}{}",
            self.path.display(),
            HistoryConfig::BACKUP_SUFFIX
        ))
    }

    // Internal methods

    fn read_all(&self) -> Result<Vec<DownloadRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)?;
        let headers = reader.headers()?.clone();

        let mut records = Vec::new();
        for (i, row) in reader.records().enumerate() {
            let line = i + 2;
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!("Skipping unreadable history row {}: {}", line, e);
                    continue;
                }
            };
            if row.len() != headers.len() {
                warn!(
                    "Skipping malformed history row {}: expected {} columns, found {}",
                    line,
                    headers.len(),
                    row.len()
                );
                continue;
            }
            records.push(DownloadRecord::from_row(&headers, &row));
        }
        Ok(records)
    }

    /// Rewrite an older-schema ledger so appended rows line up with its header.
    fn upgrade_schema(&self) -> Result<()> {
        let current = {
            let mut reader = csv::ReaderBuilder::new()
                .flexible(true)
                .from_path(&self.path)?;
            let matches = reader.headers()?.iter().map(str::trim).eq(HEADER);
            matches
        };
        if current {
            return Ok(());
        }

        let records = self.read_all()?;
        info!(
            "Upgrading {} to the {}-column schema",
            self.path.display(),
            HEADER.len()
        );
        write_ledger(&self.path, &records)
    }
}

/// Collapse records sharing a key, keeping the most recent one in the slot of
/// the first occurrence. Ties go to the later row.
pub fn deduplicate(records: Vec<DownloadRecord>) -> Vec<DownloadRecord> {
    let mut slots: HashMap<RecordKey, usize> = HashMap::new();
    let mut unique: Vec<DownloadRecord> = Vec::with_capacity(records.len());

    for record in records {
        let Some(key) = record.key() else {
            unique.push(record);
            continue;
        };
        match slots.get(&key) {
            Some(&slot) => {
                if record.recency() >= unique[slot].recency() {
                    unique[slot] = record;
                }
            }
            None => {
                slots.insert(key, unique.len());
                unique.push(record);
            }
        }
    }
    unique
}

/// Write a full ledger through a temp file and rename it into place.
fn write_ledger(path: &Path, records: &[DownloadRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CivitaiError::io_with_path(e, parent))?;
    }

    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        writer.write_record(HEADER)?;
        for record in records {
            writer.write_record(record.to_row())?;
        }
        writer.flush().map_err(|e| CivitaiError::io_with_path(e, &tmp))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| CivitaiError::io_with_path(e, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ModelKind;
    use tempfile::TempDir;

    fn setup() -> (TempDir, HistoryStore) {
        let tmp = TempDir::new().unwrap();
        let store = HistoryStore::new(tmp.path().join("nested").join("history.csv"));
        (tmp, store)
    }

    fn record(kind: ModelKind, mid: u64, vid: u64, ts: &str) -> DownloadRecord {
        DownloadRecord::new(
            format!("https://civitai.com/models/{}?modelVersionId={}", mid, vid),
            kind,
            format!("{}-{}.safetensors", mid, vid),
        )
        .with_ids(Some(mid), Some(vid))
        .with_timestamp(ts)
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let (_tmp, store) = setup();
        assert!(store.list(ListOptions::default()).unwrap().is_empty());
        assert!(!store.contains_url("x").unwrap());
        assert!(matches!(
            store.find_by_index(1, ListOptions::default()),
            Err(CivitaiError::IndexOutOfRange { index: 1, len: 0 })
        ));
    }

    #[test]
    fn test_append_writes_header_once() {
        let (_tmp, store) = setup();
        store.append(&record(ModelKind::Lora, 1, 2, "2024-01-01 00:00:00")).unwrap();
        store.append(&record(ModelKind::Lora, 3, 4, "2024-01-01 00:00:01")).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER.join(","));
        assert_eq!(store.list(ListOptions::raw()).unwrap().len(), 2);
    }

    #[test]
    fn test_dedup_keeps_latest_in_first_slot() {
        let (_tmp, store) = setup();
        store.append(&record(ModelKind::Lora, 1, 2, "2024-01-01 10:00:00")).unwrap();
        store.append(&record(ModelKind::Checkpoint, 7, 8, "2024-01-01 11:00:00")).unwrap();
        let mut later = record(ModelKind::Lora, 1, 2, "2024-02-01 10:00:00");
        later.filename = "renamed.safetensors".to_string();
        store.append(&later).unwrap();

        let listed = store.list(ListOptions::default()).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].filename, "renamed.safetensors");
        assert_eq!(listed[0].timestamp, "2024-02-01 10:00:00");
        assert_eq!(listed[1].model_id, Some(7));

        // Raw listing and duplicate checks see every row
        assert_eq!(store.list(ListOptions::raw()).unwrap().len(), 3);
        assert!(store.contains_model(1, 2).unwrap());
        assert!(!store.contains_model(1, 3).unwrap());
    }

    #[test]
    fn test_dedup_tie_goes_to_later_row() {
        let first = record(ModelKind::Lora, 1, 2, "2024-01-01 10:00:00");
        let mut second = first.clone();
        second.filename = "second.safetensors".to_string();
        let unique = deduplicate(vec![first, second]);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].filename, "second.safetensors");
    }

    #[test]
    fn test_dedup_falls_back_to_url() {
        let a = DownloadRecord::new("https://civitai.com/models/9", ModelKind::Lora, "a")
            .with_timestamp("2024-01-01 00:00:00");
        let b = DownloadRecord::new("https://civitai.com/models/9", ModelKind::Lora, "b")
            .with_timestamp("2023-01-01 00:00:00");
        let unique = deduplicate(vec![a, b]);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].filename, "a");
    }

    #[test]
    fn test_sort_by_type_is_stable() {
        let (_tmp, store) = setup();
        let ts = "2024-01-01 00:00:00";
        store.append(&record(ModelKind::Lora, 1, 1, ts)).unwrap();
        store.append(&record(ModelKind::Checkpoint, 2, 2, ts)).unwrap();
        store.append(&record(ModelKind::Embedding, 3, 3, ts)).unwrap();
        store.append(&record(ModelKind::Lora, 4, 4, ts)).unwrap();

        let sorted = store
            .list(ListOptions::default().with_sort_by_type(true))
            .unwrap();
        let order: Vec<(ModelKind, Option<u64>)> =
            sorted.iter().map(|r| (r.model_type, r.model_id)).collect();
        assert_eq!(
            order,
            vec![
                (ModelKind::Checkpoint, Some(2)),
                (ModelKind::Lora, Some(1)),
                (ModelKind::Lora, Some(4)),
                (ModelKind::Embedding, Some(3)),
            ]
        );
    }

    #[test]
    fn test_find_by_index_and_url() {
        let (_tmp, store) = setup();
        let ts = "2024-01-01 00:00:00";
        store.append(&record(ModelKind::Lora, 1, 1, ts)).unwrap();
        store.append(&record(ModelKind::Checkpoint, 2, 2, ts)).unwrap();

        let second = store.find_by_index(2, ListOptions::default()).unwrap();
        assert_eq!(second.model_id, Some(2));
        assert!(store.find_by_index(3, ListOptions::default()).is_err());
        assert!(store.find_by_index(0, ListOptions::default()).is_err());

        let by_url = store
            .find_by_url(
                " https://civitai.com/models/1?modelVersionId=1 ",
                ListOptions::default(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(by_url.model_id, Some(1));
        assert!(store
            .find_by_url("https://nope", ListOptions::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_malformed_rows_skipped_and_legacy_schema_read() {
        let (tmp, _) = setup();
        let path = tmp.path().join("legacy.csv");
        std::fs::write(
            &path,
            "timestamp,model_type,url,filename,model_id,version_id,file_size,file_size_bytes\n\
             2023-01-01 00:00:00,lora,https://civitai.com/models/1,a.safetensors,1,2,1.00 KB,1024\n\
             broken,row\n\
             2023-01-02 00:00:00,checkpoint,https://civitai.com/models/3,b.safetensors,3,4,Unknown,\n",
        )
        .unwrap();

        let store = HistoryStore::new(&path);
        let records = store.list(ListOptions::raw()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file_size_bytes, Some(1024));
        assert_eq!(records[0].api_model_type, None);
        assert_eq!(records[1].model_type, ModelKind::Checkpoint);
    }

    #[test]
    fn test_append_upgrades_old_schema() {
        let (tmp, _) = setup();
        let path = tmp.path().join("old.csv");
        std::fs::write(
            &path,
            "timestamp,model_type,url,filename,model_id,version_id,file_size\n\
             2023-01-01 00:00:00,lora,https://civitai.com/models/1,a.safetensors,1,2,1.00 KB\n",
        )
        .unwrap();

        let store = HistoryStore::new(&path);
        store
            .append(&record(ModelKind::Embedding, 5, 6, "2024-01-01 00:00:00"))
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(&HEADER.join(",")));
        let records = store.list(ListOptions::raw()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].model_id, Some(1));
        assert_eq!(records[1].model_type, ModelKind::Embedding);
    }

    #[test]
    fn test_clean_duplicates_writes_backup() {
        let (_tmp, store) = setup();
        store.append(&record(ModelKind::Lora, 1, 2, "2024-01-01 00:00:00")).unwrap();
        store.append(&record(ModelKind::Lora, 1, 2, "2024-01-02 00:00:00")).unwrap();
        store.append(&record(ModelKind::Lora, 3, 4, "2024-01-03 00:00:00")).unwrap();

        assert_eq!(store.clean_duplicates().unwrap(), 1);
        assert_eq!(store.list(ListOptions::raw()).unwrap().len(), 2);

        let backup = HistoryStore::new(store.backup_path());
        assert_eq!(backup.list(ListOptions::raw()).unwrap().len(), 3);

        assert_eq!(store.clean_duplicates().unwrap(), 0);
    }

    #[test]
    fn test_recent() {
        let (_tmp, store) = setup();
        for i in 1..=5 {
            store
                .append(&record(ModelKind::Lora, i, i, "2024-01-01 00:00:00"))
                .unwrap();
        }
        let recent = store.recent(2).unwrap();
        let ids: Vec<Option<u64>> = recent.iter().map(|r| r.model_id).collect();
        assert_eq!(ids, vec![Some(4), Some(5)]);
        assert_eq!(store.recent(10).unwrap().len(), 5);
    }

    #[test]
    fn test_migrate_legacy_text() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("download_history.txt");
        let new = tmp.path().join("download_history.csv");
        std::fs::write(
            &old,
            "[2024-01-01 12:00:00] | Type: lora | URL: https://civitai.com/models/1 | File: a.safetensors | ModelID: 1 | VersionID: 2 | Size: 1.00 KB\n\
             \n\
             not a history line\n\
             [2024-01-02 12:00:00] | Type: embedding | URL: https://civitai.com/models/3 | File: e.pt\n",
        )
        .unwrap();

        let summary = HistoryStore::migrate_legacy_text(&old, &new).unwrap();
        assert_eq!(
            summary,
            MigrationSummary {
                converted: 2,
                skipped: 1
            }
        );

        let records = HistoryStore::new(&new).list(ListOptions::raw()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].version_id, Some(2));
        assert_eq!(records[1].model_type, ModelKind::Embedding);

        // Second run must not clobber the converted ledger
        assert!(matches!(
            HistoryStore::migrate_legacy_text(&old, &new),
            Err(CivitaiError::DuplicateFile(_))
        ));
    }
}
