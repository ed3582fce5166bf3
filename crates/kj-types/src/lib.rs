#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_casefold::UnicodeCaseFold;

/// One data row, every cell as text.
pub type Row = Vec<String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header row is empty")]
    EmptyHeader,
    #[error("column {column:?} not found; available columns: {available:?}")]
    ColumnNotFound {
        column: String,
        available: Vec<String>,
    },
}

/// Folds a column name for case-insensitive comparison.
#[must_use]
pub fn fold_name(name: &str) -> String {
    name.trim().chars().case_fold().collect()
}

/// Pads a short row with empty cells and truncates a long one so the result
/// has exactly `width` cells.
#[must_use]
pub fn align_row(mut row: Row, width: usize) -> Row {
    if row.len() < width {
        row.resize(width, String::new());
    } else {
        row.truncate(width);
    }
    row
}

/// The header row of a tabular source, with folded names cached for lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    names: Vec<String>,
    folded: Vec<String>,
}

impl Header {
    pub fn new(names: Vec<String>) -> Result<Self, HeaderError> {
        let names: Vec<String> = names.into_iter().map(|name| name.trim().to_owned()).collect();
        if names.is_empty() || names.iter().all(String::is_empty) {
            return Err(HeaderError::EmptyHeader);
        }
        let folded = names.iter().map(|name| fold_name(name)).collect();
        Ok(Self { names, folded })
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Exact match wins; otherwise the first case-insensitive match.
    #[must_use]
    pub fn position(&self, column: &str) -> Option<usize> {
        let wanted = column.trim();
        if let Some(pos) = self.names.iter().position(|name| name == wanted) {
            return Some(pos);
        }
        let folded = fold_name(wanted);
        self.folded.iter().position(|name| *name == folded)
    }

    pub fn require(&self, column: &str) -> Result<usize, HeaderError> {
        self.position(column)
            .ok_or_else(|| HeaderError::ColumnNotFound {
                column: column.to_owned(),
                available: self.names.clone(),
            })
    }

    #[must_use]
    pub fn resolve_projection(&self, requested: &[String]) -> Projection {
        let columns = requested
            .iter()
            .map(|name| ProjectedColumn {
                name: name.clone(),
                position: self.position(name),
            })
            .collect();
        Projection { columns }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedColumn {
    pub name: String,
    pub position: Option<usize>,
}

/// A requested projection resolved against one header. Unresolved entries are
/// kept so callers can decide between dropping them and failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    columns: Vec<ProjectedColumn>,
}

impl Projection {
    #[must_use]
    pub fn columns(&self) -> &[ProjectedColumn] {
        &self.columns
    }

    #[must_use]
    pub fn missing(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|column| column.position.is_none())
            .map(|column| column.name.as_str())
            .collect()
    }

    /// Resolved entries only, in projection order.
    pub fn resolved(&self) -> impl Iterator<Item = (&str, usize)> {
        self.columns
            .iter()
            .filter_map(|column| column.position.map(|pos| (column.name.as_str(), pos)))
    }

    /// Cells for every requested column; unresolved columns yield "".
    #[must_use]
    pub fn extract_all(&self, row: &[String]) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| {
                column
                    .position
                    .and_then(|pos| row.get(pos))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Cells for the resolved columns only, in projection order.
    #[must_use]
    pub fn extract_resolved(&self, row: &[String]) -> Record {
        Record::new(
            self.resolved()
                .map(|(_, pos)| row.get(pos).cloned().unwrap_or_default())
                .collect(),
        )
    }
}

/// Projected values for one key, aligned to the owning index's column list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    values: Vec<String>,
}

impl Record {
    #[must_use]
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn values(&self) -> &[String] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A record paired with the column names it is aligned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView<'a> {
    columns: &'a [String],
    record: &'a Record,
}

impl<'a> RecordView<'a> {
    #[must_use]
    pub fn new(columns: &'a [String], record: &'a Record) -> Self {
        Self { columns, record }
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|pos| self.record.values().get(pos))
            .map(String::as_str)
    }

    #[must_use]
    pub fn value_at(&self, pos: usize) -> Option<&'a str> {
        self.record.values().get(pos).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let columns = self.columns;
        let values = self.record.values();
        columns
            .iter()
            .zip(values.iter())
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn record(&self) -> &'a Record {
        self.record
    }

    #[must_use]
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.iter()
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect()
    }
}

impl fmt::Display for RecordView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (name, value)) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::{Header, HeaderError, Record, RecordView, align_row};

    fn header(names: &[&str]) -> Header {
        Header::new(names.iter().map(|s| (*s).to_owned()).collect()).expect("header")
    }

    #[test]
    fn column_lookup_is_case_insensitive_with_exact_preference() {
        let header = header(&["ID", "id", " City "]);
        assert_eq!(header.position("id"), Some(1));
        assert_eq!(header.position("Id"), Some(0));
        assert_eq!(header.position("city"), Some(2));
        assert_eq!(header.names()[2], "City");
    }

    #[test]
    fn missing_join_column_reports_available_names() {
        let header = header(&["id", "name"]);
        let err = header.require("email").expect_err("must fail");
        assert_eq!(
            err,
            HeaderError::ColumnNotFound {
                column: "email".to_owned(),
                available: vec!["id".to_owned(), "name".to_owned()],
            }
        );
    }

    #[test]
    fn blank_header_is_rejected() {
        assert_eq!(
            Header::new(vec![" ".to_owned(), String::new()]),
            Err(HeaderError::EmptyHeader)
        );
    }

    #[test]
    fn projection_keeps_unresolved_columns_visible() {
        let header = header(&["id", "city", "zip"]);
        let projection = header.resolve_projection(&["zip".to_owned(), "country".to_owned()]);
        assert_eq!(projection.missing(), vec!["country"]);

        let row = vec!["1".to_owned(), "Paris".to_owned(), "75001".to_owned()];
        assert_eq!(projection.extract_all(&row), vec!["75001", ""]);
        assert_eq!(projection.extract_resolved(&row).values(), &["75001"]);
    }

    #[test]
    fn rows_are_padded_and_truncated_to_header_width() {
        assert_eq!(align_row(vec!["a".to_owned()], 3), vec!["a", "", ""]);
        assert_eq!(
            align_row(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()], 2),
            vec!["a", "b"]
        );
    }

    #[test]
    fn record_view_reads_by_name_and_serializes_as_plain_array() {
        let columns = vec!["city".to_owned(), "zip".to_owned()];
        let record = Record::new(vec!["Rome".to_owned(), "00100".to_owned()]);
        let view = RecordView::new(&columns, &record);
        assert_eq!(view.get("zip"), Some("00100"));
        assert_eq!(view.get("country"), None);
        assert_eq!(view.to_string(), r#"{city="Rome", zip="00100"}"#);

        let json = serde_json::to_string(&record).expect("serialize");
        assert_eq!(json, r#"["Rome","00100"]"#);
    }
}
