#![forbid(unsafe_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use calamine::{Data, Range, Reader, open_workbook_auto};
use csv::{ByteRecord, ReaderBuilder, WriterBuilder};
use kj_types::{Header, HeaderError, Row, align_row};
use thiserror::Error;

const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];
const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source file does not exist: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("source {} has no header row", path.display())]
    MissingHeaders { path: PathBuf },
    #[error("workbook {} contains no worksheet", path.display())]
    EmptyWorkbook { path: PathBuf },
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Spreadsheet(#[from] calamine::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Csv,
    Tsv,
    Spreadsheet,
}

impl SourceKind {
    /// Routes by file extension; anything unrecognised is read as CSV.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
            Self::Spreadsheet
        } else if ext == "tsv" {
            Self::Tsv
        } else {
            Self::Csv
        }
    }
}

/// A header plus a forward-only sequence of rows aligned to it.
///
/// Every row returned by [`TabularSource::next_row`] has exactly
/// `header().len()` cells.
pub trait TabularSource {
    fn path(&self) -> &Path;

    fn header(&self) -> &Header;

    fn next_row(&mut self) -> Result<Option<Row>, SourceError>;

    /// Restarts the row sequence at the first data row.
    fn rewind(&mut self) -> Result<(), SourceError>;

    /// Data rows returned since open or the last rewind.
    fn rows_read(&self) -> usize;
}

pub type BoxedSource = Box<dyn TabularSource + Send>;

pub fn open_source(path: &Path) -> Result<BoxedSource, SourceError> {
    if !path.exists() {
        return Err(SourceError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let source: BoxedSource = match SourceKind::from_path(path) {
        SourceKind::Csv => Box::new(CsvSource::open(path, b',')?),
        SourceKind::Tsv => Box::new(CsvSource::open(path, b'\t')?),
        SourceKind::Spreadsheet => Box::new(SheetSource::open(path)?),
    };
    #[cfg(feature = "tracing")]
    tracing::debug!(
        path = %path.display(),
        columns = source.header().len(),
        "opened tabular source"
    );
    Ok(source)
}

pub struct CsvSource {
    path: PathBuf,
    delimiter: u8,
    reader: csv::Reader<File>,
    header: Header,
    record: ByteRecord,
    rows_read: usize,
}

impl CsvSource {
    pub fn open(path: &Path, delimiter: u8) -> Result<Self, SourceError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(delimiter)
            .from_path(path)?;

        let names = reader
            .byte_headers()?
            .iter()
            .enumerate()
            .map(|(idx, raw)| {
                let name = String::from_utf8_lossy(raw);
                if idx == 0 {
                    name.trim_start_matches(UTF8_BOM).to_owned()
                } else {
                    name.into_owned()
                }
            })
            .collect::<Vec<_>>();

        let header = Header::new(names).map_err(|_| SourceError::MissingHeaders {
            path: path.to_path_buf(),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            delimiter,
            reader,
            header,
            record: ByteRecord::new(),
            rows_read: 0,
        })
    }
}

impl TabularSource for CsvSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn next_row(&mut self) -> Result<Option<Row>, SourceError> {
        if !self.reader.read_byte_record(&mut self.record)? {
            return Ok(None);
        }
        self.rows_read += 1;
        let row = self
            .record
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect();
        Ok(Some(align_row(row, self.header.len())))
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        *self = Self::open(&self.path, self.delimiter)?;
        Ok(())
    }

    fn rows_read(&self) -> usize {
        self.rows_read
    }
}

/// First worksheet of a workbook. The used range is loaded whole; the header
/// is its first row.
pub struct SheetSource {
    path: PathBuf,
    range: Range<Data>,
    header: Header,
    cursor: usize,
}

impl SheetSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let mut workbook = open_workbook_auto(path)?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| SourceError::EmptyWorkbook {
                path: path.to_path_buf(),
            })??;

        if range.height() == 0 {
            return Err(SourceError::MissingHeaders {
                path: path.to_path_buf(),
            });
        }

        let names = sheet_row(&range, 0);
        let header = Header::new(names).map_err(|_| SourceError::MissingHeaders {
            path: path.to_path_buf(),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            range,
            header,
            cursor: 1,
        })
    }
}

impl TabularSource for SheetSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn next_row(&mut self) -> Result<Option<Row>, SourceError> {
        if self.cursor >= self.range.height() {
            return Ok(None);
        }
        let row = sheet_row(&self.range, self.cursor);
        self.cursor += 1;
        Ok(Some(align_row(row, self.header.len())))
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.cursor = 1;
        Ok(())
    }

    fn rows_read(&self) -> usize {
        self.cursor - 1
    }
}

/// Rows held in memory, for callers that already have the data and for tests.
pub struct MemorySource {
    path: PathBuf,
    header: Header,
    rows: Vec<Row>,
    cursor: usize,
}

impl MemorySource {
    pub fn new(
        path: impl Into<PathBuf>,
        header: Vec<String>,
        rows: Vec<Row>,
    ) -> Result<Self, SourceError> {
        let path = path.into();
        let header = Header::new(header).map_err(|_| SourceError::MissingHeaders {
            path: path.clone(),
        })?;
        Ok(Self {
            path,
            header,
            rows,
            cursor: 0,
        })
    }
}

impl TabularSource for MemorySource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn next_row(&mut self) -> Result<Option<Row>, SourceError> {
        let Some(row) = self.rows.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(Some(align_row(row.clone(), self.header.len())))
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.cursor = 0;
        Ok(())
    }

    fn rows_read(&self) -> usize {
        self.cursor
    }
}

fn sheet_row(range: &Range<Data>, row: usize) -> Row {
    (0..range.width())
        .map(|col| range.get((row, col)).map_or_else(String::new, cell_to_text))
        .collect()
}

fn cell_to_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(v) => v.clone(),
        Data::Int(v) => v.to_string(),
        Data::Float(v) => v.to_string(),
        Data::Bool(v) => (if *v { "TRUE" } else { "FALSE" }).to_owned(),
        other => other.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("row {row} could not be encoded: {detail}")]
    Encoding { row: usize, detail: String },
    #[error("header already written")]
    HeaderRewritten,
    #[error("row written before header")]
    HeaderMissing,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SinkError {
    /// Encoding failures affect one row only; everything else is fatal.
    #[must_use]
    pub fn is_row_local(&self) -> bool {
        matches!(self, Self::Encoding { .. })
    }
}

/// Destination for merged rows: one header, then data rows.
pub trait RowSink {
    fn write_header(&mut self, columns: &[String]) -> Result<(), SinkError>;

    fn write_row(&mut self, values: &[String]) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError>;
}

/// Delimited-text sink with standard quoting of delimiters, quotes and
/// newlines inside cells.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    width: Option<usize>,
    rows_written: usize,
}

impl CsvSink<File> {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Self {
        Self::with_delimiter(inner, b',')
    }

    pub fn with_delimiter(inner: W, delimiter: u8) -> Self {
        Self {
            writer: WriterBuilder::new().delimiter(delimiter).from_writer(inner),
            width: None,
            rows_written: 0,
        }
    }

    #[must_use]
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|err| SinkError::Io(err.into_error()))
    }

    fn classify(err: csv::Error, row: usize) -> SinkError {
        match err.into_kind() {
            csv::ErrorKind::Io(io) => SinkError::Io(io),
            other => SinkError::Encoding {
                row,
                detail: format!("{other:?}"),
            },
        }
    }
}

impl<W: Write> RowSink for CsvSink<W> {
    fn write_header(&mut self, columns: &[String]) -> Result<(), SinkError> {
        if self.width.is_some() {
            return Err(SinkError::HeaderRewritten);
        }
        self.writer
            .write_record(columns)
            .map_err(|err| Self::classify(err, 0))?;
        self.width = Some(columns.len());
        Ok(())
    }

    fn write_row(&mut self, values: &[String]) -> Result<(), SinkError> {
        let width = self.width.ok_or(SinkError::HeaderMissing)?;
        let row = self.rows_written + 1;
        if values.len() != width {
            return Err(SinkError::Encoding {
                row,
                detail: format!("expected {width} cells, found {}", values.len()),
            });
        }
        self.writer
            .write_record(values)
            .map_err(|err| Self::classify(err, row))?;
        self.rows_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}
