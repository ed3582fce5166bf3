#![forbid(unsafe_code)]

//! Streaming key-indexed multi-file join.
//!
//! A request names one primary source and any number of secondary sources,
//! each with a join-key column and the columns to carry into the output.
//! Every secondary source is indexed once; the primary is then streamed once
//! and every row is enriched from the indexes and written immediately.
//!
//! ```no_run
//! use keyjoin::{JoinPolicy, JoinRequest, OutputTarget, SourceEntry};
//!
//! let request = JoinRequest::new(vec![
//!     SourceEntry::new("people", "people.csv").with_key("id").with_columns(["id", "name"]),
//!     SourceEntry::new("cities", "cities.xlsx").with_key("id").with_columns(["city"]),
//! ]);
//! let outcome = keyjoin::join(&JoinPolicy::default(), &request, &OutputTarget::Directory("out".into()))?;
//! println!("{} rows -> {}", outcome.rows_written, outcome.output.display());
//! # Ok::<(), keyjoin::JoinError>(())
//! ```

pub use kj_index::{
    CHUNK_WIDTH, IndexBuilder, IndexError, IndexRegistry, IndexSpec, IndexStats, KeyIndex,
    PAD_CHAR, decompose_key,
};
pub use kj_io::{
    BoxedSource, CsvSink, CsvSource, MemorySource, RowSink, SheetSource, SinkError, SourceError,
    SourceKind, TabularSource, open_source,
};
pub use kj_join::{
    JoinError, JoinOutcome, JoinRequest, JoinRunner, JoinStreamer, MergeReport, OutputTarget,
    ParticipatingSource, SkippedSource, SourceEntry, default_output_name,
};
pub use kj_runtime::{
    BackingKind, CancelToken, IndexBacking, JoinPolicy, NoopProgress, Phase, ProgressEvent,
    ProgressLedger, ProgressSink, ProjectionMode, RunLifecycle, RunState, RuntimeError,
    TracingProgress,
};
pub use kj_types::{Header, HeaderError, Record, RecordView, Row};

/// Runs one request with a fresh registry, logging progress through
/// `tracing`. Callers that want to share indexes across requests or cancel
/// a run hold their own [`IndexRegistry`] and [`CancelToken`] and use
/// [`JoinRunner`] directly.
pub fn join(
    policy: &JoinPolicy,
    request: &JoinRequest,
    target: &OutputTarget,
) -> Result<JoinOutcome, JoinError> {
    let registry = IndexRegistry::new();
    let cancel = CancelToken::new();
    JoinRunner::new(policy, &registry, &TracingProgress, &cancel).run(request, target)
}
