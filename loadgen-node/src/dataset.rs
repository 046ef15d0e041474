//! Dataset provider
//!
//! Parses a delimited file with a header row into immutable [`Row`]s. Parsed
//! files are cached per location, so every caller after the first shares the
//! same frozen rows without reparsing.

use crate::assignment::assign;
use crate::error::{LoadgenError, Result};
use csv::ReaderBuilder;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One dataset record, column name to raw string value
///
/// Cloning is cheap; all clones share the same underlying map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: Arc<HashMap<String, String>>,
}

impl Row {
    pub fn new(fields: HashMap<String, String>) -> Self {
        Self {
            fields: Arc::new(fields),
        }
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    /// Value of `column` when present and not blank
    pub fn non_blank(&self, column: &str) -> Option<&str> {
        self.get(column).filter(|v| !v.trim().is_empty())
    }

    /// First non-blank value among `columns`
    pub fn first_non_blank(&self, columns: &[String]) -> Option<&str> {
        columns.iter().find_map(|c| self.non_blank(c))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Row acceptance predicate applied once at load time
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RowFilter {
    /// Keep rows with at least one non-blank value
    #[default]
    NonEmpty,
    /// Keep rows where every listed column is present and non-blank
    RequiredColumns(Vec<String>),
}

impl RowFilter {
    pub fn accepts(&self, row: &Row) -> bool {
        match self {
            RowFilter::NonEmpty => row.fields.values().any(|v| !v.trim().is_empty()),
            RowFilter::RequiredColumns(columns) => {
                columns.iter().all(|c| row.non_blank(c).is_some())
            }
        }
    }
}

/// Frozen, filtered rows for one run
#[derive(Debug, Clone)]
pub struct Dataset {
    location: PathBuf,
    rows: Arc<[Row]>,
}

impl Dataset {
    pub fn new(location: impl Into<PathBuf>, rows: Vec<Row>) -> Self {
        Self {
            location: location.into(),
            rows: rows.into(),
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Stable row for a VU, see [`assign`]
    ///
    /// Returns `None` only for an empty dataset, which callers reject before
    /// scheduling.
    pub fn row_for_vu(&self, vu_id: u64) -> Option<(usize, &Row)> {
        if self.rows.is_empty() {
            return None;
        }
        let index = assign(vu_id, self.rows.len());
        self.rows.get(index).map(|row| (index, row))
    }
}

/// Loads datasets and caches parsed files per location
#[derive(Debug, Default, Clone)]
pub struct DatasetProvider {
    parsed: Arc<DashMap<PathBuf, Arc<Vec<Row>>>>,
}

impl DatasetProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `location`, keep rows accepted by `filter`
    ///
    /// # Errors
    /// [`LoadgenError::DataSource`] when the file cannot be opened or parsed,
    /// [`LoadgenError::EmptyDataset`] when no row passes the filter.
    pub fn load(&self, location: &Path, filter: &RowFilter) -> Result<Dataset> {
        let parsed = self.parsed_rows(location)?;

        let rows: Vec<Row> = parsed
            .iter()
            .filter(|row| filter.accepts(row))
            .cloned()
            .collect();

        info!(
            location = %location.display(),
            parsed = parsed.len(),
            accepted = rows.len(),
            "Dataset loaded"
        );

        if rows.is_empty() {
            return Err(LoadgenError::EmptyDataset {
                location: location.display().to_string(),
            });
        }

        Ok(Dataset::new(location, rows))
    }

    /// Number of distinct locations parsed so far
    pub fn cached_locations(&self) -> usize {
        self.parsed.len()
    }

    fn parsed_rows(&self, location: &Path) -> Result<Arc<Vec<Row>>> {
        let key = location
            .canonicalize()
            .unwrap_or_else(|_| location.to_path_buf());

        if let Some(rows) = self.parsed.get(&key) {
            debug!(location = %location.display(), "Dataset cache hit");
            return Ok(Arc::clone(&rows));
        }

        let rows = Arc::new(parse_delimited(location)?);
        // Two racing first loads parse twice; the first insert wins for everyone.
        let entry = self.parsed.entry(key).or_insert(rows);
        Ok(Arc::clone(&entry))
    }
}

fn parse_delimited(location: &Path) -> Result<Vec<Row>> {
    let source_error = |reason: String| LoadgenError::DataSource {
        location: location.display().to_string(),
        reason,
    };

    let file = File::open(location).map_err(|e| source_error(e.to_string()))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| source_error(e.to_string()))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| source_error(e.to_string()))?;
        let fields: HashMap<String, String> = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();
        rows.push(Row::new(fields));
    }

    Ok(rows)
}
