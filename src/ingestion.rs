use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

const BYTE_ORDER_MARK: char = '\u{feff}';

/// Listing records as read from the source CSV. Cells are kept verbatim so
/// the enriched output can reproduce the input columns unchanged.
#[derive(Debug, Clone)]
pub struct RecordSet {
    headers: Vec<String>,
    rows: Vec<StringRecord>,
    location_index: usize,
}

impl RecordSet {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn location_column(&self) -> &str {
        &self.headers[self.location_index]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &StringRecord> + '_ {
        self.rows.iter()
    }

    /// Location cell of each row; short rows yield an empty string.
    pub fn locations(&self) -> impl Iterator<Item = &str> + '_ {
        self.rows
            .iter()
            .map(move |row| row.get(self.location_index).unwrap_or(""))
    }

    pub fn location_of(&self, row: &StringRecord) -> String {
        row.get(self.location_index).unwrap_or("").to_string()
    }
}

pub fn read_listings(path: &Path, location_column: &str) -> AppResult<RecordSet> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let records = parse_listings(&bytes, location_column)?;
    info!(
        path = %path.display(),
        rows = records.len(),
        column = location_column,
        "loaded listings"
    );
    Ok(records)
}

pub fn parse_listings(bytes: &[u8], location_column: &str) -> AppResult<RecordSet> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(idx, header)| {
            if idx == 0 {
                header.trim_start_matches(BYTE_ORDER_MARK).to_string()
            } else {
                header.to_string()
            }
        })
        .collect();

    let location_index = headers
        .iter()
        .position(|header| header.trim() == location_column)
        .ok_or_else(|| AppError::MissingColumn(location_column.to_string()))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            debug!("skipping blank listing row");
            continue;
        }
        rows.push(record);
    }

    Ok(RecordSet {
        headers,
        rows,
        location_index,
    })
}
