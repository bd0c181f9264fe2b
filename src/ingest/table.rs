//! Untyped CSV tables.
//!
//! Every input (telemetry, lap boundaries, race results) is first read into
//! a `RawTable` of trimmed string cells. Typing happens in the stages that
//! know what a column means.

use std::io::Read;
use std::path::Path;

use super::SchemaError;

/// Header plus string cells. Short records are padded with empty cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    /// Build a table directly (used by tests and in-memory callers).
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.resize(width, String::new());
                r
            })
            .collect();
        Self { headers, rows }
    }

    /// Read a CSV file. The delimiter (`,` or `;`) is sniffed from the header.
    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let bytes = std::fs::read(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }

    /// Parse CSV from an in-memory buffer (uploads).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SchemaError> {
        let delimiter = sniff_delimiter(bytes);
        Self::from_reader(bytes, delimiter)
    }

    fn from_reader<R: Read>(reader: R, delimiter: u8) -> Result<Self, SchemaError> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = rdr
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(SchemaError::EmptyTable);
        }

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self::new(headers, rows))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of `name`: exact match first, then case-insensitive.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h == name)
            .or_else(|| self.headers.iter().position(|h| h.eq_ignore_ascii_case(name)))
    }

    /// First candidate present in the header, with its index.
    pub fn resolve_column<'c>(&self, candidates: &'c [String]) -> Option<(usize, &'c str)> {
        candidates
            .iter()
            .filter(|c| !c.trim().is_empty())
            .find_map(|c| self.column_index(c).map(|idx| (idx, c.as_str())))
    }
}

/// Pick `;` when the header line has more semicolons than commas.
fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let first_line = bytes.split(|&b| b == b'\n').next().unwrap_or_default();
    let commas = first_line.iter().filter(|&&b| b == b',').count();
    let semis = first_line.iter().filter(|&&b| b == b';').count();
    if semis > commas {
        b';'
    } else {
        b','
    }
}
