use tracing::debug;

use crate::{
    error::{IngestError, Result},
    models::Table,
    schema_store::ColumnSource,
};

pub const TABLE_NAME_FIELD: &str = "table_name";
pub const TABLE_COMMENT_FIELD: &str = "table_comment";
pub const DEFAULT_DELIMITER: &str = ",";

const COMMENT_MARKERS: [char; 2] = ['#', ';'];

/// How a raw line is split into fields.
///
/// Without headers the line is positional: field 0 is the table name and
/// field 1, when present, the description. With headers every line must carry
/// exactly one field per header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFormat {
    pub headers: Option<Vec<String>>,
    pub delimiter: String,
}

impl Default for LineFormat {
    fn default() -> Self {
        Self {
            headers: None,
            delimiter: DEFAULT_DELIMITER.to_string(),
        }
    }
}

impl LineFormat {
    pub fn new(headers: Option<Vec<String>>, delimiter: Option<&str>) -> Self {
        let delimiter = delimiter
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_DELIMITER)
            .to_string();
        let headers = headers
            .filter(|h| !h.is_empty())
            .map(|h| h.into_iter().map(|name| name.trim().to_string()).collect());
        Self { headers, delimiter }
    }
}

pub struct TableResolver<C> {
    columns: C,
}

impl<C: ColumnSource> TableResolver<C> {
    pub fn new(columns: C) -> Self {
        Self { columns }
    }

    /// Resolves one line into a `Table`. `Ok(None)` means the line is blank or
    /// a comment and should be skipped.
    pub fn resolve(&self, text: &str, format: &LineFormat) -> Result<Option<Table>> {
        let text = text.trim();
        if text.is_empty() || text.starts_with(COMMENT_MARKERS) {
            debug!(text = %text, "Skipping blank or comment line");
            return Ok(None);
        }

        let (name, description) = split_record(text, format)?;

        let name = name.trim();
        if name.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "table name cannot be empty, content: {text}"
            )));
        }
        let description = description.unwrap_or_default().trim();

        let columns = self.columns.load_columns(name)?;
        Ok(Some(Table {
            name: name.to_string(),
            description: description.to_string(),
            columns,
        }))
    }
}

fn split_record<'a>(text: &'a str, format: &LineFormat) -> Result<(&'a str, Option<&'a str>)> {
    let fields: Vec<&str> = text.split(format.delimiter.as_str()).collect();

    let Some(headers) = format.headers.as_ref() else {
        return Ok((fields[0], fields.get(1).copied()));
    };

    if headers.len() != fields.len() {
        return Err(IngestError::Format(format!(
            "expected {} fields for headers {:?}, found {} in: {text}",
            headers.len(),
            headers,
            fields.len()
        )));
    }

    let field = |wanted: &str| {
        headers
            .iter()
            .position(|h| h == wanted)
            .map(|idx| fields[idx])
    };
    Ok((
        field(TABLE_NAME_FIELD).unwrap_or_default(),
        field(TABLE_COMMENT_FIELD),
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{LineFormat, TableResolver};
    use crate::{error::IngestError, models::Column};

    fn resolver() -> TableResolver<HashMap<String, Vec<Column>>> {
        let mut columns = HashMap::new();
        columns.insert(
            "orders".to_string(),
            vec![Column::new("order_id", "订单号"), Column::new("amount", "金额")],
        );
        TableResolver::new(columns)
    }

    fn headers(names: &[&str]) -> LineFormat {
        LineFormat::new(Some(names.iter().map(|h| h.to_string()).collect()), None)
    }

    #[test]
    fn comment_and_blank_lines_are_skipped() {
        let resolver = resolver();
        let format = LineFormat::default();
        assert_eq!(resolver.resolve("# comment", &format).expect("ok"), None);
        assert_eq!(resolver.resolve("  ; also a comment", &format).expect("ok"), None);
        assert_eq!(resolver.resolve("   ", &format).expect("ok"), None);
    }

    #[test]
    fn positional_line_resolves_name_description_and_columns() {
        let table = resolver()
            .resolve("orders,Customer order table", &LineFormat::default())
            .expect("ok")
            .expect("table");
        assert_eq!(table.name, "orders");
        assert_eq!(table.description, "Customer order table");
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.columns[0].name, "order_id");
    }

    #[test]
    fn positional_line_without_description_is_valid() {
        let table = resolver()
            .resolve(" users ", &LineFormat::default())
            .expect("ok")
            .expect("table");
        assert_eq!(table.name, "users");
        assert_eq!(table.description, "");
        assert!(table.columns.is_empty());
    }

    #[test]
    fn header_count_mismatch_is_a_format_error() {
        let err = resolver()
            .resolve(
                "orders,Customer order table,extra",
                &headers(&["table_name", "table_comment"]),
            )
            .expect_err("mismatch");
        assert!(matches!(err, IngestError::Format(_)));
    }

    #[test]
    fn header_driven_line_maps_fields_by_name() {
        let table = resolver()
            .resolve(
                "Customer order table|orders",
                &LineFormat::new(
                    Some(vec!["table_comment".into(), " table_name ".into()]),
                    Some("|"),
                ),
            )
            .expect("ok")
            .expect("table");
        assert_eq!(table.name, "orders");
        assert_eq!(table.description, "Customer order table");
    }

    #[test]
    fn empty_table_name_is_invalid() {
        let err = resolver()
            .resolve(" ,description only", &LineFormat::default())
            .expect_err("empty name");
        assert!(matches!(err, IngestError::InvalidArgument(_)));

        let err = resolver()
            .resolve("orders,desc", &headers(&["owner", "table_comment"]))
            .expect_err("no table_name header");
        assert!(matches!(err, IngestError::InvalidArgument(_)));
    }

    #[test]
    fn empty_delimiter_falls_back_to_comma() {
        let format = LineFormat::new(None, Some(""));
        assert_eq!(format.delimiter, ",");
    }
}
