#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use kj_index::{IndexError, KeyIndex};
use kj_io::{RowSink, SinkError, SourceError, TabularSource};
use kj_runtime::{
    CancelToken, JoinPolicy, Phase, ProgressEvent, ProgressSink, ProjectionMode, RuntimeError,
};
use kj_types::{HeaderError, Projection, Row};
use thiserror::Error;

mod request;

pub use request::{
    JoinOutcome, JoinRequest, JoinRunner, OUTPUT_PREFIX, OUTPUT_TIMESTAMP_FORMAT, OutputTarget,
    ParticipatingSource, SkippedSource, SourceEntry, default_output_name,
};

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("source {label:?} does not exist: {}", path.display())]
    SourceNotFound { label: String, path: PathBuf },
    #[error("join key column {column:?} not found in source {label:?} ({}); available columns: {available:?}", path.display())]
    ColumnNotFound {
        label: String,
        path: PathBuf,
        column: String,
        available: Vec<String>,
    },
    #[error("projected columns {columns:?} not found in source {label:?} ({})", path.display())]
    ProjectionColumnMissing {
        label: String,
        path: PathBuf,
        columns: Vec<String>,
    },
    #[error("resource limit exceeded while processing {label:?}: {detail}")]
    ResourceExhausted { label: String, detail: String },
    #[error("join cancelled during {phase:?} after {rows} rows")]
    Cancelled { phase: Phase, rows: usize },
    #[error("failed reading source {label:?} ({}){}: {source}", path.display(), row.map(|r| format!(" at row {r}")).unwrap_or_default())]
    Source {
        label: String,
        path: PathBuf,
        row: Option<usize>,
        #[source]
        source: SourceError,
    },
    #[error("index for source {label:?} failed: {source}")]
    Index {
        label: String,
        #[source]
        source: IndexError,
    },
    #[error("index build worker for {label:?} panicked")]
    WorkerPanicked { label: String },
    #[error("output {} could not be written: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("invalid join request: {0}")]
    InvalidRequest(String),
}

impl JoinError {
    /// Lifts an index failure into the run-level taxonomy.
    #[must_use]
    pub fn from_index(label: &str, err: IndexError) -> Self {
        match err {
            IndexError::SourceNotFound { path } => Self::SourceNotFound {
                label: label.to_owned(),
                path,
            },
            IndexError::ColumnNotFound {
                path,
                column,
                available,
            } => Self::ColumnNotFound {
                label: label.to_owned(),
                path,
                column,
                available,
            },
            IndexError::ProjectionColumnMissing { path, columns } => {
                Self::ProjectionColumnMissing {
                    label: label.to_owned(),
                    path,
                    columns,
                }
            }
            IndexError::ResourceExhausted { path, detail } => Self::ResourceExhausted {
                label: label.to_owned(),
                detail: format!("{}: {detail}", path.display()),
            },
            IndexError::Cancelled { rows, .. } => Self::Cancelled {
                phase: Phase::Building,
                rows,
            },
            IndexError::Policy(err) => Self::Runtime(err),
            other => Self::Index {
                label: label.to_owned(),
                source: other,
            },
        }
    }
}

/// What one merge pass produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub header: Vec<String>,
    pub rows_read: usize,
    pub rows_written: usize,
    pub rows_skipped: usize,
    /// Matched rows per secondary index, in input order.
    pub matches: Vec<usize>,
}

/// Streams the primary source once, enriching each row from the secondary
/// indexes and writing it to the sink before the next row is read.
pub struct JoinStreamer<'a> {
    policy: &'a JoinPolicy,
    progress: &'a dyn ProgressSink,
    cancel: &'a CancelToken,
}

struct SecondarySlots<'i> {
    index: &'i KeyIndex,
    /// For each declared output column, its position in the index records.
    positions: Vec<Option<usize>>,
}

impl<'a> JoinStreamer<'a> {
    pub fn new(
        policy: &'a JoinPolicy,
        progress: &'a dyn ProgressSink,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            policy,
            progress,
            cancel,
        }
    }

    /// `projections[0]` is the primary's own projection; `projections[i + 1]`
    /// belongs to `indexes[i]`. Every secondary is probed with the primary
    /// row's join-key cell.
    pub fn merge(
        &self,
        label: &str,
        primary: &mut dyn TabularSource,
        indexes: &[Arc<KeyIndex>],
        primary_key_column: &str,
        projections: &[Vec<String>],
        sink: &mut dyn RowSink,
    ) -> Result<MergeReport, JoinError> {
        self.policy.validate()?;
        if projections.len() != indexes.len() + 1 {
            return Err(JoinError::InvalidRequest(format!(
                "expected {} projections for {} secondary indexes, found {}",
                indexes.len() + 1,
                indexes.len(),
                projections.len()
            )));
        }

        let header = primary.header();
        let key_pos = header
            .require(primary_key_column)
            .map_err(|err| primary_header_error(label, primary.path().to_path_buf(), err))?;
        let primary_projection = header.resolve_projection(&projections[0]);
        self.check_primary_projection(label, primary, &primary_projection)?;

        let secondaries = indexes
            .iter()
            .zip(&projections[1..])
            .map(|(index, columns)| SecondarySlots {
                index: index.as_ref(),
                positions: columns
                    .iter()
                    .map(|name| index.columns().iter().position(|col| col == name))
                    .collect(),
            })
            .collect::<Vec<_>>();

        let output_header = projections.iter().flatten().cloned().collect::<Vec<_>>();
        sink.write_header(&output_header)?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            source = %label,
            secondaries = indexes.len(),
            columns = output_header.len(),
            "streaming primary source"
        );

        let mut report = MergeReport {
            header: output_header,
            rows_read: 0,
            rows_written: 0,
            rows_skipped: 0,
            matches: vec![0; indexes.len()],
        };

        loop {
            let row_no = report.rows_read + 1;
            let row = match primary.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(source) => {
                    let _ = sink.flush();
                    return Err(JoinError::Source {
                        label: label.to_owned(),
                        path: primary.path().to_path_buf(),
                        row: Some(row_no),
                        source,
                    });
                }
            };
            report.rows_read = row_no;

            let merged = merge_row(&row, key_pos, &primary_projection, &secondaries, &mut report.matches);
            match sink.write_row(&merged) {
                Ok(()) => report.rows_written += 1,
                Err(err) if err.is_row_local() => {
                    report.rows_skipped += 1;
                    #[cfg(feature = "tracing")]
                    tracing::warn!(source = %label, row = row_no, error = %err, "skipping row that failed to encode");
                }
                Err(err) => return Err(err.into()),
            }

            if row_no % self.policy.batch_size == 0 {
                sink.flush()?;
                if self.cancel.is_cancelled() {
                    return Err(JoinError::Cancelled {
                        phase: Phase::Streaming,
                        rows: row_no,
                    });
                }
            }
            if row_no % self.policy.progress_interval == 0 {
                self.observe(label, row_no);
            }
        }

        sink.flush()?;
        if report.rows_read % self.policy.progress_interval != 0 {
            self.observe(label, report.rows_read);
        }
        #[cfg(feature = "tracing")]
        tracing::info!(
            source = %label,
            rows = report.rows_written,
            skipped = report.rows_skipped,
            "merge complete"
        );
        Ok(report)
    }

    fn check_primary_projection(
        &self,
        label: &str,
        primary: &dyn TabularSource,
        projection: &Projection,
    ) -> Result<(), JoinError> {
        let missing = projection.missing();
        if missing.is_empty() {
            return Ok(());
        }
        match self.policy.projection_mode {
            ProjectionMode::Strict => Err(JoinError::ProjectionColumnMissing {
                label: label.to_owned(),
                path: primary.path().to_path_buf(),
                columns: missing.into_iter().map(str::to_owned).collect(),
            }),
            ProjectionMode::Lenient => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    source = %label,
                    columns = ?missing,
                    "primary projection columns not in header; they will stay empty"
                );
                Ok(())
            }
        }
    }

    fn observe(&self, label: &str, rows: usize) {
        self.progress.observe(&ProgressEvent {
            phase: Phase::Streaming,
            source_label: label.to_owned(),
            rows,
        });
    }
}

fn merge_row(
    row: &Row,
    key_pos: usize,
    primary_projection: &Projection,
    secondaries: &[SecondarySlots<'_>],
    matches: &mut [usize],
) -> Row {
    let key = row.get(key_pos).map_or("", String::as_str);
    let mut merged = primary_projection.extract_all(row);

    for (slot, matched) in secondaries.iter().zip(matches.iter_mut()) {
        match slot.index.lookup(key) {
            Some(view) => {
                *matched += 1;
                merged.extend(slot.positions.iter().map(|pos| {
                    pos.and_then(|pos| view.value_at(pos))
                        .unwrap_or_default()
                        .to_owned()
                }));
            }
            None => merged.extend(std::iter::repeat_n(String::new(), slot.positions.len())),
        }
    }
    merged
}

pub(crate) fn primary_header_error(label: &str, path: PathBuf, err: HeaderError) -> JoinError {
    match err {
        HeaderError::ColumnNotFound { column, available } => JoinError::ColumnNotFound {
            label: label.to_owned(),
            path,
            column,
            available,
        },
        HeaderError::EmptyHeader => JoinError::Source {
            label: label.to_owned(),
            path,
            row: None,
            source: SourceError::Header(HeaderError::EmptyHeader),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kj_index::KeyIndex;
    use kj_io::{CsvSink, MemorySource, RowSink, SinkError};
    use kj_runtime::{CancelToken, JoinPolicy, NoopProgress, Phase, ProgressLedger};
    use kj_types::Record;

    use super::{JoinError, JoinStreamer};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_owned()).collect()
    }

    fn people() -> MemorySource {
        MemorySource::new(
            "people.csv",
            strings(&["id", "name"]),
            vec![strings(&["1", "Alice"]), strings(&["2", "Bob"]), strings(&["3"])],
        )
        .expect("source")
    }

    fn cities() -> Arc<KeyIndex> {
        Arc::new(KeyIndex::from_entries(
            "cities",
            strings(&["city", "zip"]),
            vec![
                ("1".to_owned(), Record::new(strings(&["Paris", "75001"]))),
                ("3".to_owned(), Record::new(strings(&["Rome", "00100"]))),
            ],
        ))
    }

    fn run(
        policy: &JoinPolicy,
        indexes: &[Arc<KeyIndex>],
        projections: &[Vec<String>],
    ) -> Result<(super::MergeReport, String), JoinError> {
        let cancel = CancelToken::new();
        let streamer = JoinStreamer::new(policy, &NoopProgress, &cancel);
        let mut sink = CsvSink::new(Vec::new());
        let mut source = people();
        let report = streamer.merge("people", &mut source, indexes, "ID", projections, &mut sink)?;
        let text = String::from_utf8(sink.into_inner()?).expect("utf8");
        Ok((report, text))
    }

    #[test]
    fn unmatched_rows_are_kept_with_empty_fields() {
        let policy = JoinPolicy::default();
        let (report, text) = run(
            &policy,
            &[cities()],
            &[strings(&["id", "name"]), strings(&["city"])],
        )
        .expect("merge");
        assert_eq!(text, "id,name,city\n1,Alice,Paris\n2,Bob,\n3,,Rome\n");
        assert_eq!(report.rows_written, 3);
        assert_eq!(report.matches, vec![2]);
    }

    #[test]
    fn declared_columns_the_index_lacks_stay_empty() {
        let policy = JoinPolicy::default();
        let (report, text) = run(
            &policy,
            &[cities()],
            &[strings(&["name", "nickname"]), strings(&["zip", "country", "city"])],
        )
        .expect("merge");
        assert_eq!(report.header.len(), 5);
        assert_eq!(
            text,
            "name,nickname,zip,country,city\nAlice,,75001,,Paris\nBob,,,,\n,,00100,,Rome\n"
        );
    }

    #[test]
    fn every_index_is_probed_with_the_primary_key() {
        let policy = JoinPolicy::default();
        let scores = Arc::new(KeyIndex::from_entries(
            "scores",
            strings(&["score"]),
            vec![("2".to_owned(), Record::new(strings(&["99"])))],
        ));
        let (report, text) = run(
            &policy,
            &[cities(), scores],
            &[strings(&["id"]), strings(&["city"]), strings(&["score"])],
        )
        .expect("merge");
        assert_eq!(text, "id,city,score\n1,Paris,\n2,,99\n3,Rome,\n");
        assert_eq!(report.matches, vec![2, 1]);
    }

    #[test]
    fn missing_primary_key_column_aborts_before_output() {
        let policy = JoinPolicy::default();
        let cancel = CancelToken::new();
        let streamer = JoinStreamer::new(&policy, &NoopProgress, &cancel);
        let mut sink = CsvSink::new(Vec::new());
        let mut source = people();
        let err = streamer
            .merge("people", &mut source, &[], "email", &[strings(&["id"])], &mut sink)
            .expect_err("must fail");
        assert!(matches!(err, JoinError::ColumnNotFound { ref column, .. } if column == "email"));
        assert!(sink.into_inner().expect("inner").is_empty());
    }

    #[test]
    fn strict_mode_rejects_unknown_primary_columns() {
        let policy = JoinPolicy::strict();
        let err = run(&policy, &[], &[strings(&["id", "nickname"])]).expect_err("must fail");
        assert!(matches!(err, JoinError::ProjectionColumnMissing { .. }));
    }

    #[test]
    fn projection_count_must_match_indexes() {
        let policy = JoinPolicy::default();
        let err = run(&policy, &[cities()], &[strings(&["id"])]).expect_err("must fail");
        assert!(matches!(err, JoinError::InvalidRequest(_)));
    }

    struct FlakySink {
        inner: CsvSink<Vec<u8>>,
        fail_on: usize,
        calls: usize,
    }

    impl RowSink for FlakySink {
        fn write_header(&mut self, columns: &[String]) -> Result<(), SinkError> {
            self.inner.write_header(columns)
        }

        fn write_row(&mut self, values: &[String]) -> Result<(), SinkError> {
            self.calls += 1;
            if self.calls == self.fail_on {
                return Err(SinkError::Encoding {
                    row: self.calls,
                    detail: "unencodable".to_owned(),
                });
            }
            self.inner.write_row(values)
        }

        fn flush(&mut self) -> Result<(), SinkError> {
            self.inner.flush()
        }
    }

    #[test]
    fn encoding_failures_skip_only_that_row() {
        let policy = JoinPolicy::default();
        let cancel = CancelToken::new();
        let streamer = JoinStreamer::new(&policy, &NoopProgress, &cancel);
        let mut sink = FlakySink {
            inner: CsvSink::new(Vec::new()),
            fail_on: 2,
            calls: 0,
        };
        let mut source = people();
        let report = streamer
            .merge("people", &mut source, &[cities()], "id", &[strings(&["id"]), strings(&["city"])], &mut sink)
            .expect("merge");
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.rows_skipped, 1);
        let text = String::from_utf8(sink.inner.into_inner().expect("inner")).expect("utf8");
        assert_eq!(text, "id,city\n1,Paris\n3,Rome\n");
    }

    #[test]
    fn zero_batch_size_is_rejected_before_any_row() {
        let policy = JoinPolicy::default().with_batch_size(0);
        let cancel = CancelToken::new();
        let streamer = JoinStreamer::new(&policy, &NoopProgress, &cancel);
        let mut sink = CsvSink::new(Vec::new());
        let mut source = people();

        let err = streamer
            .merge("people", &mut source, &[], "id", &[strings(&["name"])], &mut sink)
            .expect_err("invalid policy");
        assert!(matches!(err, JoinError::Runtime(_)));
        assert!(sink.into_inner().expect("inner").is_empty());
    }

    #[test]
    fn cancellation_keeps_flushed_rows() {
        let mut policy = JoinPolicy::default().with_batch_size(2);
        policy.progress_interval = 1;
        let cancel = CancelToken::new();
        cancel.cancel();
        let ledger = ProgressLedger::new();
        let streamer = JoinStreamer::new(&policy, &ledger, &cancel);
        let mut sink = CsvSink::new(Vec::new());
        let mut source = people();

        let err = streamer
            .merge("people", &mut source, &[], "id", &[strings(&["name"])], &mut sink)
            .expect_err("must cancel");
        assert!(matches!(
            err,
            JoinError::Cancelled {
                phase: Phase::Streaming,
                rows: 2
            }
        ));
        let text = String::from_utf8(sink.into_inner().expect("inner")).expect("utf8");
        assert_eq!(text, "name\nAlice\nBob\n");
        assert_eq!(ledger.for_phase(Phase::Streaming).len(), 1);
    }
}
