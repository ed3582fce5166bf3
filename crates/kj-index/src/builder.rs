use std::fs;
use std::path::PathBuf;

use kj_io::{SourceError, TabularSource, open_source};
use kj_runtime::{
    BackingKind, CancelToken, JoinPolicy, Phase, ProgressEvent, ProgressSink, ProjectionMode,
};
use kj_types::{HeaderError, Projection};

use crate::artifact::{
    ARTIFACT_FORMAT, ArtifactHeader, ArtifactWriter, artifact_path, read_artifact,
    resolve_source_path,
};
use crate::node::KeyNode;
use crate::{IndexError, IndexStats, KeyIndex, decompose_key};

/// What to index for one secondary source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub label: String,
    pub path: PathBuf,
    pub key_column: String,
    pub columns: Vec<String>,
}

impl IndexSpec {
    pub fn new(
        label: impl Into<String>,
        path: impl Into<PathBuf>,
        key_column: impl Into<String>,
        columns: Vec<String>,
    ) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
            key_column: key_column.into(),
            columns,
        }
    }
}

/// Builds [`KeyIndex`]es under one policy, reporting to one progress sink.
pub struct IndexBuilder<'a> {
    policy: &'a JoinPolicy,
    progress: &'a dyn ProgressSink,
    cancel: &'a CancelToken,
}

impl<'a> IndexBuilder<'a> {
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

    #[must_use]
    pub fn policy(&self) -> &JoinPolicy {
        self.policy
    }

    /// Opens the source and builds its index with the backing the policy
    /// selects for the file's size. A stored build first tries to reuse a
    /// complete artifact built for the same key column and projection.
    pub fn build(&self, spec: &IndexSpec) -> Result<KeyIndex, IndexError> {
        self.policy.validate()?;
        let metadata = fs::metadata(&spec.path).map_err(|_| IndexError::SourceNotFound {
            path: spec.path.clone(),
        })?;
        let backing = self.policy.backing.resolve(metadata.len());

        if backing == BackingKind::Stored {
            if let Some(index) = self.try_reuse(spec) {
                return Ok(index);
            }
        }

        let mut source = open_source(&spec.path).map_err(|err| source_error(spec, None, err))?;
        self.build_from_source(spec, source.as_mut(), backing)
    }

    /// Builds from an already opened source, reading it exactly once.
    pub fn build_from_source(
        &self,
        spec: &IndexSpec,
        source: &mut dyn TabularSource,
        backing: BackingKind,
    ) -> Result<KeyIndex, IndexError> {
        self.policy.validate()?;
        let header = source.header();
        let key_pos = header.require(&spec.key_column).map_err(|err| match err {
            HeaderError::ColumnNotFound { column, available } => IndexError::ColumnNotFound {
                path: spec.path.clone(),
                column,
                available,
            },
            HeaderError::EmptyHeader => IndexError::Source {
                path: spec.path.clone(),
                row: None,
                source: SourceError::Header(HeaderError::EmptyHeader),
            },
        })?;
        let projection = header.resolve_projection(&spec.columns);
        self.check_projection(spec, &projection)?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            source = %spec.label,
            path = %spec.path.display(),
            key_column = %spec.key_column,
            backing = ?backing,
            "building key index"
        );

        let index = match backing {
            BackingKind::Memory => self.build_in_memory(spec, source, key_pos, &projection)?,
            BackingKind::Stored => self.build_stored(spec, source, key_pos, &projection)?,
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            source = %spec.label,
            rows = index.stats().rows_indexed,
            keys = index.stats().distinct_keys,
            batches = index.stats().batches,
            "key index built"
        );
        Ok(index)
    }

    fn check_projection(&self, spec: &IndexSpec, projection: &Projection) -> Result<(), IndexError> {
        let missing = projection.missing();
        if missing.is_empty() {
            return Ok(());
        }
        match self.policy.projection_mode {
            ProjectionMode::Strict => Err(IndexError::ProjectionColumnMissing {
                path: spec.path.clone(),
                columns: missing.into_iter().map(str::to_owned).collect(),
            }),
            ProjectionMode::Lenient => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    source = %spec.label,
                    columns = ?missing,
                    "projected columns not in header; they will stay empty"
                );
                Ok(())
            }
        }
    }

    fn build_in_memory(
        &self,
        spec: &IndexSpec,
        source: &mut dyn TabularSource,
        key_pos: usize,
        projection: &Projection,
    ) -> Result<KeyIndex, IndexError> {
        let mut root = KeyNode::new();
        let mut stats = IndexStats::new(BackingKind::Memory);

        while let Some(row) = next_row(spec, source)? {
            stats.rows_indexed += 1;
            let key = &row[key_pos];
            if key.is_empty() {
                stats.skipped_empty_keys += 1;
            } else if root.insert(&decompose_key(key), projection.extract_resolved(&row)) {
                stats.distinct_keys += 1;
                self.check_key_budget(spec, stats.distinct_keys, stats.rows_indexed)?;
            }

            if stats.rows_indexed % self.policy.batch_size == 0 {
                stats.batches += 1;
                self.batch_boundary(spec, stats.rows_indexed)?;
            }
        }
        if stats.rows_indexed % self.policy.batch_size != 0 {
            stats.batches += 1;
            self.batch_boundary(spec, stats.rows_indexed)?;
        }

        Ok(KeyIndex::assemble(spec, resolved_columns(projection), root, stats))
    }

    fn build_stored(
        &self,
        spec: &IndexSpec,
        source: &mut dyn TabularSource,
        key_pos: usize,
        projection: &Projection,
    ) -> Result<KeyIndex, IndexError> {
        let columns = resolved_columns(projection);
        let artifact = artifact_path(&self.policy.artifact_dir, &spec.path);
        let header = ArtifactHeader {
            format: ARTIFACT_FORMAT,
            source: resolve_source_path(&spec.path).to_string_lossy().into_owned(),
            key_column: spec.key_column.clone(),
            requested: spec.columns.clone(),
            columns: columns.clone(),
        };
        let mut writer = ArtifactWriter::create(&artifact, header, self.policy.max_artifact_bytes)?;

        let mut batch = KeyNode::new();
        let mut batch_rows = 0_u64;
        let mut rows = 0_usize;
        let mut skipped_empty_keys = 0_usize;

        while let Some(row) = next_row(spec, source)? {
            rows += 1;
            batch_rows += 1;
            let key = &row[key_pos];
            if key.is_empty() {
                skipped_empty_keys += 1;
            } else {
                batch.insert(&decompose_key(key), projection.extract_resolved(&row));
            }

            if rows % self.policy.batch_size == 0 {
                writer.append_batch(&batch, batch_rows)?;
                // Dropping the flushed batch returns its memory before the next one fills.
                batch = KeyNode::new();
                batch_rows = 0;
                self.batch_boundary(spec, rows)?;
            }
        }
        if batch_rows > 0 {
            writer.append_batch(&batch, batch_rows)?;
            self.batch_boundary(spec, rows)?;
        }
        drop(batch);
        writer.finish()?;

        let loaded = read_artifact(&artifact)?;
        let mut stats = IndexStats::new(BackingKind::Stored);
        stats.rows_indexed = rows;
        stats.skipped_empty_keys = skipped_empty_keys;
        stats.distinct_keys = loaded.root.key_count();
        stats.batches = usize::try_from(loaded.batches).unwrap_or(usize::MAX);
        stats.artifact = Some(artifact);
        self.check_key_budget(spec, stats.distinct_keys, rows)?;

        Ok(KeyIndex::assemble(spec, columns, loaded.root, stats))
    }

    fn try_reuse(&self, spec: &IndexSpec) -> Option<KeyIndex> {
        let artifact = artifact_path(&self.policy.artifact_dir, &spec.path);
        if !artifact.exists() {
            return None;
        }
        let loaded = match read_artifact(&artifact) {
            Ok(loaded) => loaded,
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(artifact = %artifact.display(), error = %err, "artifact unusable; rebuilding");
                return None;
            }
        };
        if loaded.header.key_column != spec.key_column || loaded.header.requested != spec.columns {
            #[cfg(feature = "tracing")]
            tracing::debug!(artifact = %artifact.display(), "artifact built for another projection; rebuilding");
            return None;
        }
        if self.policy.projection_mode == ProjectionMode::Strict
            && loaded.header.columns.len() != loaded.header.requested.len()
        {
            // The rebuild re-checks the live header and reports the missing columns.
            #[cfg(feature = "tracing")]
            tracing::debug!(artifact = %artifact.display(), "artifact lacks projected columns; rechecking source");
            return None;
        }
        let distinct_keys = loaded.root.key_count();
        if self
            .policy
            .max_index_keys
            .is_some_and(|limit| distinct_keys > limit)
        {
            return None;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(source = %spec.label, artifact = %artifact.display(), "reusing index artifact");
        let mut stats = IndexStats::new(BackingKind::Stored);
        stats.rows_indexed = usize::try_from(loaded.rows).unwrap_or(usize::MAX);
        stats.distinct_keys = distinct_keys;
        stats.batches = usize::try_from(loaded.batches).unwrap_or(usize::MAX);
        stats.artifact = Some(artifact);
        stats.from_cache = true;
        Some(KeyIndex::assemble(
            spec,
            loaded.header.columns,
            loaded.root,
            stats,
        ))
    }

    fn check_key_budget(&self, spec: &IndexSpec, keys: usize, row: usize) -> Result<(), IndexError> {
        match self.policy.max_index_keys {
            Some(limit) if keys > limit => Err(IndexError::ResourceExhausted {
                path: spec.path.clone(),
                detail: format!("{keys} distinct keys at row {row}, limit is {limit}"),
            }),
            _ => Ok(()),
        }
    }

    fn batch_boundary(&self, spec: &IndexSpec, rows: usize) -> Result<(), IndexError> {
        if self.cancel.is_cancelled() {
            return Err(IndexError::Cancelled {
                path: spec.path.clone(),
                rows,
            });
        }
        self.progress.observe(&ProgressEvent {
            phase: Phase::Building,
            source_label: spec.label.clone(),
            rows,
        });
        Ok(())
    }
}

fn next_row(
    spec: &IndexSpec,
    source: &mut dyn TabularSource,
) -> Result<Option<Vec<String>>, IndexError> {
    let row = source.rows_read() + 1;
    source
        .next_row()
        .map_err(|err| source_error(spec, Some(row), err))
}

fn source_error(spec: &IndexSpec, row: Option<usize>, err: SourceError) -> IndexError {
    match err {
        SourceError::NotFound { path } => IndexError::SourceNotFound { path },
        other => IndexError::Source {
            path: spec.path.clone(),
            row,
            source: other,
        },
    }
}

fn resolved_columns(projection: &Projection) -> Vec<String> {
    projection
        .resolved()
        .map(|(name, _)| name.to_owned())
        .collect()
}
