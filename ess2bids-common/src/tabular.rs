//! TSV and JSON sidecar primitives
//!
//! Thin read/write helpers shared by the importer and exporter. Writes obey
//! the changeset rule: with no changeset everything is written; with one, a
//! path is written only if it is listed.

use crate::field_store::Fields;
use crate::{Error, Result};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Placeholder written for missing cells
pub const NOT_AVAILABLE: &str = "n/a";

/// Set of paths an export pass may overwrite
pub type Changeset = BTreeSet<PathBuf>;

/// Anything that renders as one TSV row
pub trait FieldRecord {
    fn record(&self) -> Cow<'_, Fields>;
}

impl FieldRecord for Fields {
    fn record(&self) -> Cow<'_, Fields> {
        Cow::Borrowed(self)
    }
}

/// Result of a guarded write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// New content reached the disk
    Written,
    /// Existing content already matched
    Unchanged,
    /// Changeset excluded the path
    Skipped,
}

/// Changeset write rule
pub fn should_write(path: &Path, changes: Option<&Changeset>) -> bool {
    match changes {
        None => true,
        Some(changes) => changes.contains(path),
    }
}

/// Text form of a value inside a TSV cell
pub fn cell_text(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => NOT_AVAILABLE.to_string(),
        other => other.to_string(),
    };
    text.replace(['\t', '\n', '\r'], " ")
}

/// Read a JSON object; `Ok(None)` if the file does not exist
pub fn read_json(path: &Path) -> Result<Option<Fields>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(Error::corrupt(path, "expected a JSON object")),
        Err(e) => Err(Error::corrupt(path, e)),
    }
}

/// Read a whole text file; `Ok(None)` if the file does not exist
pub fn read_text(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(fs::read_to_string(path)?))
}

/// A parsed tab-separated table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TsvTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TsvTable {
    /// Parse TSV text; rows wider than the header are rejected
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let header: Vec<String> = match lines.next() {
            Some(line) => line.split('\t').map(|s| s.trim().to_string()).collect(),
            None => return Ok(Self::default()),
        };

        let mut rows = Vec::new();
        for (number, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let cells: Vec<String> = line.split('\t').map(|s| s.trim().to_string()).collect();
            if cells.len() > header.len() {
                return Err(Error::corrupt(
                    path,
                    format!(
                        "row {} has {} cells but the header has {}",
                        number + 2,
                        cells.len(),
                        header.len()
                    ),
                ));
            }
            rows.push(cells);
        }
        Ok(Self { header, rows })
    }

    /// Rows keyed by the first column; `n/a` and missing cells are omitted
    pub fn keyed(&self) -> Vec<(String, Fields)> {
        self.rows
            .iter()
            .filter_map(|row| {
                let key = row.first()?.clone();
                Some((key, self.cells(row, 1)))
            })
            .collect()
    }

    /// Rows as records; `n/a` and missing cells are omitted
    pub fn records(&self) -> Vec<Fields> {
        self.rows.iter().map(|row| self.cells(row, 0)).collect()
    }

    fn cells(&self, row: &[String], skip: usize) -> Fields {
        self.header
            .iter()
            .zip(row.iter())
            .skip(skip)
            .filter(|(_, cell)| cell.as_str() != NOT_AVAILABLE)
            .map(|(column, cell)| (column.clone(), Value::String(cell.clone())))
            .collect()
    }
}

/// Read a TSV file; `Ok(None)` if the file does not exist
pub fn read_tsv(path: &Path) -> Result<Option<TsvTable>> {
    match read_text(path)? {
        Some(text) => Ok(Some(TsvTable::parse(path, &text)?)),
        None => Ok(None),
    }
}

/// Pretty JSON with two-space indentation and a trailing newline
pub fn render_json(fields: &Fields) -> Result<String> {
    let mut text = serde_json::to_string_pretty(fields)?;
    text.push('\n');
    Ok(text)
}

/// Render rows keyed by `primary_key`
///
/// The header is the union of row fields in first-seen order; a row missing
/// a column gets `n/a`.
pub fn render_keyed_tsv<'a, R>(
    primary_key: &str,
    rows: impl IntoIterator<Item = (String, &'a R)>,
) -> String
where
    R: FieldRecord + 'a,
{
    let rows: Vec<(Option<String>, Cow<'a, Fields>)> = rows
        .into_iter()
        .map(|(key, row)| (Some(key), row.record()))
        .collect();
    render_rows(Some(primary_key), &rows)
}

/// Render unkeyed records
pub fn render_tsv<'a, R>(rows: impl IntoIterator<Item = &'a R>) -> String
where
    R: FieldRecord + 'a,
{
    let rows: Vec<(Option<String>, Cow<'a, Fields>)> =
        rows.into_iter().map(|row| (None, row.record())).collect();
    render_rows(None, &rows)
}

fn render_rows(primary_key: Option<&str>, rows: &[(Option<String>, Cow<'_, Fields>)]) -> String {
    let mut header: Vec<&str> = Vec::new();
    for (_, fields) in rows {
        for column in fields.keys() {
            if !header.contains(&column.as_str()) {
                header.push(column);
            }
        }
    }

    let mut out = String::new();
    let mut head: Vec<&str> = primary_key.into_iter().collect();
    head.extend(header.iter().copied());
    out.push_str(&head.join("\t"));
    out.push('\n');

    for (key, fields) in rows {
        let mut cells: Vec<String> = key.iter().cloned().collect();
        cells.extend(header.iter().map(|column| {
            fields
                .get(*column)
                .map(cell_text)
                .unwrap_or_else(|| NOT_AVAILABLE.to_string())
        }));
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    out
}

/// Write `contents` under the changeset rule, skipping identical content
pub fn write_text(path: &Path, contents: &str, changes: Option<&Changeset>) -> Result<WriteOutcome> {
    if !should_write(path, changes) {
        return Ok(WriteOutcome::Skipped);
    }
    if let Ok(existing) = fs::read(path) {
        if existing == contents.as_bytes() {
            return Ok(WriteOutcome::Unchanged);
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(WriteOutcome::Written)
}

/// Append to a text file, creating it if needed
pub fn append_text(path: &Path, contents: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}
