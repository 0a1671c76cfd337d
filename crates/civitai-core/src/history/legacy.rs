//! Parser for the pre-CSV plain-text history.
//!
//! Lines look like
//! `[2024-01-01 12:00:00] | Type: lora | URL: ... | File: x.safetensors | ModelID: 1 | VersionID: 2 | Size: 144.11 MB`
//! with the trailing `ModelID`, `VersionID` and `Size` fields optional.

use crate::classifier::ModelKind;
use crate::history::record::DownloadRecord;
use regex::Regex;
use std::sync::LazyLock;

static LEGACY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[([^\]]+)\]\s*\|\s*Type:\s*([^|]+?)\s*\|\s*URL:\s*([^|]+?)\s*\|\s*File:\s*([^|]+?)\s*(?:\|\s*ModelID:\s*(\d+)\s*)?(?:\|\s*VersionID:\s*(\d+)\s*)?(?:\|\s*Size:\s*([^|]+?)\s*)?$",
    )
    .expect("legacy history regex must compile")
});

/// Parse one legacy line. Returns `None` for blank or unrecognised lines.
pub fn parse_legacy_line(line: &str) -> Option<DownloadRecord> {
    let caps = LEGACY_LINE.captures(line.trim())?;
    let text = |i: usize| caps.get(i).map(|m| m.as_str().trim());
    let id = |i: usize| text(i).and_then(|s| s.parse::<u64>().ok()).filter(|n| *n > 0);

    let mut record = DownloadRecord::new(
        text(3)?,
        ModelKind::from_ledger(text(2)?),
        text(4)?,
    )
    .with_timestamp(text(1)?)
    .with_ids(id(5), id(6));
    record.file_size = text(7).unwrap_or_default().to_string();
    Some(record)
}
