use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::cache::{CacheEntry, Precision};
use crate::errors::AppResult;
use crate::ingestion::RecordSet;
use crate::normalize::{normalize, AddressKey};

pub const ENRICHED_COLUMNS: [&str; 4] = ["clean_address", "latitude", "longitude", "precision"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputSummary {
    pub rows: usize,
    pub exact: usize,
    pub approximate: usize,
    pub unresolved: usize,
    /// Rows whose location was empty after normalization or never cached.
    pub unmatched: usize,
}

/// Left-joins every listing with its cached resolution and writes the input
/// columns followed by the enrichment columns.
pub fn write_enriched<W: Write>(
    writer: W,
    records: &RecordSet,
    entries: &HashMap<AddressKey, CacheEntry>,
) -> AppResult<OutputSummary> {
    let width = records.headers().len();
    let mut writer = csv::Writer::from_writer(writer);

    let mut header: Vec<&str> = records.headers().iter().map(String::as_str).collect();
    header.extend(ENRICHED_COLUMNS);
    writer.write_record(&header)?;

    let mut summary = OutputSummary::default();
    for row in records.rows() {
        let key = normalize(&records.location_of(row));
        let entry = if key.is_empty() { None } else { entries.get(&key) };

        let mut cells: Vec<String> = (0..width)
            .map(|idx| row.get(idx).unwrap_or("").to_string())
            .collect();
        cells.push(key.into_string());
        match entry {
            Some(entry) => {
                cells.push(format_coordinate(entry.latitude));
                cells.push(format_coordinate(entry.longitude));
                cells.push(entry.precision.as_str().to_string());
                match entry.precision {
                    Precision::Exact => summary.exact += 1,
                    Precision::Approximate => summary.approximate += 1,
                    Precision::None => summary.unresolved += 1,
                }
            }
            None => {
                cells.extend([String::new(), String::new(), String::new()]);
                summary.unmatched += 1;
            }
        }
        writer.write_record(&cells)?;
        summary.rows += 1;
    }

    writer.flush()?;
    Ok(summary)
}

pub fn write_enriched_file(
    path: &Path,
    records: &RecordSet,
    entries: &HashMap<AddressKey, CacheEntry>,
) -> AppResult<OutputSummary> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let summary = write_enriched(File::create(path)?, records, entries)?;
    info!(
        path = %path.display(),
        rows = summary.rows,
        unmatched = summary.unmatched,
        "wrote enriched listings"
    );
    Ok(summary)
}

fn format_coordinate(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
