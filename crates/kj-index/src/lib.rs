#![forbid(unsafe_code)]

//! Key indexes for secondary sources.
//!
//! A join key is decomposed into two-character chunks ([`decompose_key`]) and
//! the chunks form a path through a trie of [`KeyNode`]s whose terminal slots
//! hold projected [`Record`]s. An index is either built fully in memory or
//! flushed batch by batch to an append-only artifact and reloaded; lookups
//! behave the same either way.

use std::path::{Path, PathBuf};

use kj_io::SourceError;
use kj_runtime::{BackingKind, ProjectionMode, RuntimeError};
use kj_types::{Record, RecordView};
use thiserror::Error;

pub mod artifact;
mod builder;
mod key;
mod node;
mod registry;

pub use artifact::{ArtifactHeader, ArtifactSummary, ArtifactWriter, artifact_path, read_artifact};
pub use builder::{IndexBuilder, IndexSpec};
pub use key::{CHUNK_WIDTH, PAD_CHAR, decompose_key};
pub use node::KeyNode;
pub use registry::IndexRegistry;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("source file does not exist: {}", path.display())]
    SourceNotFound { path: PathBuf },
    #[error("failed reading {}{}: {source}", path.display(), row.map(|r| format!(" at row {r}")).unwrap_or_default())]
    Source {
        path: PathBuf,
        row: Option<usize>,
        #[source]
        source: SourceError,
    },
    #[error("join key column {column:?} not found in {}; available columns: {available:?}", path.display())]
    ColumnNotFound {
        path: PathBuf,
        column: String,
        available: Vec<String>,
    },
    #[error("projected columns {columns:?} not found in {}", path.display())]
    ProjectionColumnMissing { path: PathBuf, columns: Vec<String> },
    #[error("resource limit exceeded for {}: {detail}", path.display())]
    ResourceExhausted { path: PathBuf, detail: String },
    #[error("index build for {} cancelled after {rows} rows", path.display())]
    Cancelled { path: PathBuf, rows: usize },
    #[error("index artifact {} is corrupt at line {line}: {detail}", path.display())]
    ArtifactCorrupt {
        path: PathBuf,
        line: usize,
        detail: String,
    },
    #[error("index artifact {} has no end frame", path.display())]
    ArtifactIncomplete { path: PathBuf },
    #[error("io failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Policy(#[from] RuntimeError),
    #[error("index registry lock poisoned")]
    LockPoisoned,
}

impl IndexError {
    /// Failures confined to one source's inputs. A secondary source failing
    /// this way is skipped; anything else aborts the run.
    #[must_use]
    pub fn is_source_local(&self) -> bool {
        matches!(
            self,
            Self::SourceNotFound { .. }
                | Self::Source { .. }
                | Self::ColumnNotFound { .. }
                | Self::ProjectionColumnMissing { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub backing: BackingKind,
    pub rows_indexed: usize,
    pub distinct_keys: usize,
    pub skipped_empty_keys: usize,
    pub batches: usize,
    pub artifact: Option<PathBuf>,
    pub from_cache: bool,
}

impl IndexStats {
    #[must_use]
    pub fn new(backing: BackingKind) -> Self {
        Self {
            backing,
            rows_indexed: 0,
            distinct_keys: 0,
            skipped_empty_keys: 0,
            batches: 0,
            artifact: None,
            from_cache: false,
        }
    }
}

/// Immutable join-key lookup structure for one secondary source.
#[derive(Debug, Clone)]
pub struct KeyIndex {
    label: String,
    source: PathBuf,
    key_column: String,
    requested: Vec<String>,
    columns: Vec<String>,
    root: KeyNode,
    stats: IndexStats,
}

impl KeyIndex {
    fn assemble(spec: &IndexSpec, columns: Vec<String>, root: KeyNode, stats: IndexStats) -> Self {
        Self {
            label: spec.label.clone(),
            source: spec.path.clone(),
            key_column: spec.key_column.clone(),
            requested: spec.columns.clone(),
            columns,
            root,
            stats,
        }
    }

    /// An in-memory index over explicit entries; later entries for the same
    /// key replace earlier ones and empty keys are skipped.
    pub fn from_entries<I>(label: impl Into<String>, columns: Vec<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Record)>,
    {
        let mut root = KeyNode::new();
        let mut stats = IndexStats::new(BackingKind::Memory);
        for (key, record) in entries {
            stats.rows_indexed += 1;
            if key.is_empty() {
                stats.skipped_empty_keys += 1;
            } else if root.insert(&decompose_key(&key), record) {
                stats.distinct_keys += 1;
            }
        }
        Self {
            label: label.into(),
            source: PathBuf::new(),
            key_column: String::new(),
            requested: columns.clone(),
            columns,
            root,
            stats,
        }
    }

    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<RecordView<'_>> {
        self.root
            .get(&decompose_key(key))
            .map(|record| RecordView::new(&self.columns, record))
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    #[must_use]
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Columns as requested, including any the source header lacked.
    #[must_use]
    pub fn requested_columns(&self) -> &[String] {
        &self.requested
    }

    /// Columns actually populated in every record, in projection order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stats.distinct_keys
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Whether every requested column was found in the source header.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.columns.len() == self.requested.len()
    }

    /// Whether this index answers `spec` (same key column and projection).
    /// Under [`ProjectionMode::Strict`] an index that was built leniently
    /// around missing columns does not.
    #[must_use]
    pub fn serves(&self, spec: &IndexSpec, mode: ProjectionMode) -> bool {
        self.key_column == spec.key_column
            && self.requested == spec.columns
            && (mode == ProjectionMode::Lenient || self.is_complete())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use kj_runtime::{
        BackingKind, CancelToken, IndexBacking, JoinPolicy, NoopProgress, Phase, ProgressLedger,
    };
    use kj_io::MemorySource;
    use kj_types::Record;

    use super::{IndexBuilder, IndexError, IndexRegistry, IndexSpec, KeyIndex};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_owned()).collect()
    }

    fn write_cities(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("cities.csv");
        fs::write(
            &path,
            "ID,City,Zip\n1,Paris,75001\n3,Rome,00100\n1,Nice,06000\n,Nowhere,0\n12345,Oslo,0150\n",
        )
        .expect("write");
        path
    }

    fn policy(dir: &std::path::Path, backing: IndexBacking) -> JoinPolicy {
        JoinPolicy::lenient()
            .with_backing(backing)
            .with_artifact_dir(dir.join("artifacts"))
            .with_batch_size(2)
    }

    #[test]
    fn lookup_misses_are_not_errors() {
        let index = KeyIndex::from_entries(
            "t",
            strings(&["v"]),
            vec![("abc".to_owned(), Record::new(strings(&["1"])))],
        );
        assert_eq!(index.lookup("abc").and_then(|r| r.get("v")), Some("1"));
        assert!(index.lookup("ab").is_none());
        assert!(index.lookup("abcd").is_none());
        assert!(index.lookup("").is_none());
    }

    #[test]
    fn explicit_entries_skip_empty_keys() {
        let index = KeyIndex::from_entries(
            "t",
            strings(&["v"]),
            vec![
                (String::new(), Record::new(strings(&["x"]))),
                ("ab".to_owned(), Record::new(strings(&["y"]))),
            ],
        );
        assert!(index.lookup("").is_none());
        assert_eq!(index.lookup("ab").and_then(|r| r.get("v")), Some("y"));
        assert_eq!(index.len(), 1);
        assert_eq!(index.stats().rows_indexed, 2);
        assert_eq!(index.stats().skipped_empty_keys, 1);
    }

    #[test]
    fn zero_batch_size_is_an_invalid_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_cities(dir.path());
        let policy = policy(dir.path(), IndexBacking::Memory).with_batch_size(0);
        let cancel = CancelToken::new();
        let builder = IndexBuilder::new(&policy, &NoopProgress, &cancel);
        let spec = IndexSpec::new("cities", &path, "id", strings(&["city"]));

        let err = builder.build(&spec).expect_err("invalid policy");
        assert!(matches!(err, IndexError::Policy(_)));
        assert!(!err.is_source_local());

        let mut source = MemorySource::new(
            "cities.csv",
            strings(&["id", "city"]),
            vec![strings(&["1", "Paris"])],
        )
        .expect("source");
        let err = builder
            .build_from_source(&spec, &mut source, BackingKind::Memory)
            .expect_err("invalid policy");
        assert!(matches!(err, IndexError::Policy(_)));
    }

    #[test]
    fn memory_build_is_last_write_wins_and_case_insensitive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_cities(dir.path());
        let policy = policy(dir.path(), IndexBacking::Memory);
        let cancel = CancelToken::new();
        let builder = IndexBuilder::new(&policy, &NoopProgress, &cancel);

        let spec = IndexSpec::new("cities", &path, "id", strings(&["city", "country"]));
        let index = builder.build(&spec).expect("build");

        assert_eq!(index.columns(), &["city"]);
        assert_eq!(index.requested_columns(), &["city", "country"]);
        assert_eq!(index.lookup("1").and_then(|r| r.get("city")), Some("Nice"));
        assert_eq!(index.lookup("12345").and_then(|r| r.get("city")), Some("Oslo"));
        assert!(index.lookup("2").is_none());
        assert!(index.lookup("").is_none());

        let stats = index.stats();
        assert_eq!(stats.backing, BackingKind::Memory);
        assert_eq!(stats.rows_indexed, 5);
        assert_eq!(stats.distinct_keys, 3);
        assert_eq!(stats.skipped_empty_keys, 1);
    }

    #[test]
    fn stored_build_matches_memory_build_and_is_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_cities(dir.path());
        let cancel = CancelToken::new();
        let spec = IndexSpec::new("cities", &path, "id", strings(&["zip", "city"]));

        let memory_policy = policy(dir.path(), IndexBacking::Memory);
        let memory = IndexBuilder::new(&memory_policy, &NoopProgress, &cancel)
            .build(&spec)
            .expect("memory");

        let stored_policy = policy(dir.path(), IndexBacking::Stored);
        let ledger = ProgressLedger::new();
        let stored = IndexBuilder::new(&stored_policy, &ledger, &cancel)
            .build(&spec)
            .expect("stored");

        for key in ["1", "3", "12345", "2", "", "_1"] {
            assert_eq!(
                memory.lookup(key).map(|r| r.to_pairs()),
                stored.lookup(key).map(|r| r.to_pairs()),
                "key {key:?}"
            );
        }
        assert_eq!(stored.stats().batches, 3);
        assert!(stored.stats().artifact.as_ref().is_some_and(|p| p.exists()));
        let building = ledger.for_phase(Phase::Building);
        assert_eq!(building.len(), 3);
        assert_eq!(building.last().map(|event| event.rows), Some(5));

        let reused = IndexBuilder::new(&stored_policy, &NoopProgress, &cancel)
            .build(&spec)
            .expect("reuse");
        assert!(reused.stats().from_cache);
        assert_eq!(reused.lookup("1").and_then(|r| r.get("zip")), Some("06000"));

        let other = IndexSpec::new("cities", &path, "id", strings(&["city"]));
        let rebuilt = IndexBuilder::new(&stored_policy, &NoopProgress, &cancel)
            .build(&other)
            .expect("rebuild");
        assert!(!rebuilt.stats().from_cache);
        assert_eq!(rebuilt.columns(), &["city"]);
    }

    #[test]
    fn missing_key_column_is_source_local() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_cities(dir.path());
        let policy = policy(dir.path(), IndexBacking::Memory);
        let cancel = CancelToken::new();
        let builder = IndexBuilder::new(&policy, &NoopProgress, &cancel);

        let err = builder
            .build(&IndexSpec::new("cities", &path, "code", strings(&["city"])))
            .expect_err("must fail");
        assert!(matches!(err, IndexError::ColumnNotFound { ref column, .. } if column == "code"));
        assert!(err.is_source_local());

        let err = builder
            .build(&IndexSpec::new("x", dir.path().join("nope.csv"), "id", vec![]))
            .expect_err("must fail");
        assert!(matches!(err, IndexError::SourceNotFound { .. }));
    }

    #[test]
    fn strict_projection_rejects_unknown_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_cities(dir.path());
        let policy = JoinPolicy::strict();
        let cancel = CancelToken::new();
        let builder = IndexBuilder::new(&policy, &NoopProgress, &cancel);

        let err = builder
            .build(&IndexSpec::new("cities", &path, "id", strings(&["city", "country"])))
            .expect_err("must fail");
        assert!(
            matches!(err, IndexError::ProjectionColumnMissing { ref columns, .. } if columns == &["country"])
        );
    }

    #[test]
    fn strict_build_does_not_reuse_a_lenient_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_cities(dir.path());
        let spec = IndexSpec::new("cities", &path, "id", strings(&["city", "country"]));
        let cancel = CancelToken::new();

        let lenient = policy(dir.path(), IndexBacking::Stored);
        let built = IndexBuilder::new(&lenient, &NoopProgress, &cancel)
            .build(&spec)
            .expect("lenient build");
        assert!(!built.is_complete());

        let strict = JoinPolicy::strict()
            .with_backing(IndexBacking::Stored)
            .with_artifact_dir(dir.path().join("artifacts"))
            .with_batch_size(2);
        let err = IndexBuilder::new(&strict, &NoopProgress, &cancel)
            .build(&spec)
            .expect_err("strict build");
        assert!(
            matches!(err, IndexError::ProjectionColumnMissing { ref columns, .. } if columns == &["country"])
        );

        let reused = IndexBuilder::new(&lenient, &NoopProgress, &cancel)
            .build(&spec)
            .expect("lenient reuse");
        assert!(reused.stats().from_cache);
    }

    #[test]
    fn strict_registry_lookup_rejects_incomplete_cached_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_cities(dir.path());
        let spec = IndexSpec::new("cities", &path, "id", strings(&["city", "country"]));
        let cancel = CancelToken::new();
        let registry = IndexRegistry::new();

        let lenient = policy(dir.path(), IndexBacking::Memory);
        registry
            .get_or_build(&IndexBuilder::new(&lenient, &NoopProgress, &cancel), &spec)
            .expect("lenient build");

        let strict = JoinPolicy::strict()
            .with_artifact_dir(dir.path().join("artifacts"))
            .with_batch_size(2);
        let err = registry
            .get_or_build(&IndexBuilder::new(&strict, &NoopProgress, &cancel), &spec)
            .expect_err("strict build");
        assert!(matches!(err, IndexError::ProjectionColumnMissing { .. }));
    }

    #[test]
    fn cancellation_is_checked_at_batch_boundaries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_cities(dir.path());
        let policy = policy(dir.path(), IndexBacking::Stored);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = IndexBuilder::new(&policy, &NoopProgress, &cancel)
            .build(&IndexSpec::new("cities", &path, "id", strings(&["city"])))
            .expect_err("must cancel");
        assert!(matches!(err, IndexError::Cancelled { rows: 2, .. }));
        assert!(!err.is_source_local());
    }

    #[test]
    fn key_budget_is_a_resource_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_cities(dir.path());
        let mut policy = policy(dir.path(), IndexBacking::Memory);
        policy.max_index_keys = Some(1);
        let cancel = CancelToken::new();

        let err = IndexBuilder::new(&policy, &NoopProgress, &cancel)
            .build(&IndexSpec::new("cities", &path, "id", strings(&["city"])))
            .expect_err("must exceed");
        assert!(matches!(err, IndexError::ResourceExhausted { .. }));
    }
}
