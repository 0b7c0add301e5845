use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    error::{IngestError, Result},
    models::Column,
};

const COLUMN_NAME_HEADER: &str = "column_name";
const COLUMN_NAME_CN_HEADER: &str = "column_name_cn";
const COLUMN_COMMENT_HEADERS: [&str; 2] = ["column_comment", "comment"];

/// Source of per-table column definitions.
pub trait ColumnSource {
    /// Columns in declaration order. A table without a resource yields an
    /// empty list rather than an error.
    fn load_columns(&self, table_name: &str) -> Result<Vec<Column>>;
}

impl<T: ColumnSource + ?Sized> ColumnSource for &T {
    fn load_columns(&self, table_name: &str) -> Result<Vec<Column>> {
        (**self).load_columns(table_name)
    }
}

impl ColumnSource for HashMap<String, Vec<Column>> {
    fn load_columns(&self, table_name: &str) -> Result<Vec<Column>> {
        let table_name = require_table_name(table_name)?;
        Ok(self.get(table_name).cloned().unwrap_or_default())
    }
}

/// Column definitions stored as one delimited file per table under
/// `<root>/columns/<table>.csv`.
#[derive(Debug, Clone)]
pub struct CsvSchemaStore {
    root: PathBuf,
    delimiter: u8,
}

impl CsvSchemaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn column_path(&self, table_name: &str) -> Result<PathBuf> {
        let table_name = require_table_name(table_name)?;
        if table_name == "."
            || table_name == ".."
            || table_name.contains(['/', '\\', '\0'])
        {
            return Err(IngestError::InvalidArgument(format!(
                "table name `{table_name}` cannot address a schema resource"
            )));
        }
        Ok(self.root.join("columns").join(format!("{table_name}.csv")))
    }
}

impl ColumnSource for CsvSchemaStore {
    fn load_columns(&self, table_name: &str) -> Result<Vec<Column>> {
        let path = self.column_path(table_name)?;
        if !path.is_file() {
            warn!(table = %table_name.trim(), path = %path.display(), "No column resource found for table");
            return Ok(Vec::new());
        }

        let columns = parse_columns(&path, self.delimiter)?;
        debug!(table = %table_name.trim(), columns = columns.len(), "Loaded column definitions");
        Ok(columns)
    }
}

fn require_table_name(table_name: &str) -> Result<&str> {
    let trimmed = table_name.trim();
    if trimmed.is_empty() {
        return Err(IngestError::InvalidArgument(
            "table name cannot be empty".to_string(),
        ));
    }
    Ok(trimmed)
}

fn parse_columns(path: &Path, delimiter: u8) -> Result<Vec<Column>> {
    let schema_error =
        |err: csv::Error| IngestError::Schema(format!("failed reading {}: {err}", path.display()));

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(schema_error)?;

    let headers = reader.headers().map_err(schema_error)?.clone();
    let position = |name: &str| headers.iter().position(|h| h == name);

    let name_idx = position(COLUMN_NAME_HEADER).ok_or_else(|| {
        IngestError::Schema(format!(
            "missing `{COLUMN_NAME_HEADER}` header in {}",
            path.display()
        ))
    })?;
    let name_cn_idx = position(COLUMN_NAME_CN_HEADER).ok_or_else(|| {
        IngestError::Schema(format!(
            "missing `{COLUMN_NAME_CN_HEADER}` header in {}",
            path.display()
        ))
    })?;
    let comment_idx = COLUMN_COMMENT_HEADERS.iter().find_map(|&h| position(h));

    let mut columns = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(schema_error)?;
        // header is line 1
        let line = row + 2;
        let name = record.get(name_idx).unwrap_or_default().trim();
        if name.is_empty() {
            return Err(IngestError::Schema(format!(
                "column name is empty on line {line} of {}",
                path.display()
            )));
        }
        if let Some(first) = seen.insert(name.to_string(), line) {
            return Err(IngestError::Schema(format!(
                "column `{name}` is declared on line {first} and again on line {line} of {}",
                path.display()
            )));
        }

        let name_cn = record.get(name_cn_idx).unwrap_or_default().trim();
        let comment = comment_idx
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(ToString::to_string);

        columns.push(Column {
            name: name.to_string(),
            name_cn: name_cn.to_string(),
            comment,
        });
    }

    Ok(columns)
}
