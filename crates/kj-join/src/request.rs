use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Local};
use kj_index::{IndexBuilder, IndexError, IndexRegistry, IndexSpec, KeyIndex};
use kj_io::{BoxedSource, CsvSink, SourceError, TabularSource, open_source};
use kj_runtime::{
    CancelToken, JoinPolicy, Phase, ProgressSink, ProjectionMode, RunLifecycle, RunState,
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{JoinError, JoinStreamer, MergeReport, primary_header_error};

pub const OUTPUT_PREFIX: &str = "merged_";
pub const OUTPUT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// One `{label, path}` entry of a join request. The key column and the
/// projected columns are optional so that an incomplete entry can be
/// reported instead of rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub label: String,
    pub path: PathBuf,
    #[serde(default)]
    pub key_column: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

impl SourceEntry {
    pub fn new(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
            key_column: None,
            columns: None,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key_column: impl Into<String>) -> Self {
        self.key_column = Some(key_column.into());
        self
    }

    #[must_use]
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }
}

/// Ordered sources; the first is the primary, the rest are secondaries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JoinRequest {
    pub sources: Vec<SourceEntry>,
}

impl JoinRequest {
    #[must_use]
    pub fn new(sources: Vec<SourceEntry>) -> Self {
        Self { sources }
    }

    #[must_use]
    pub fn primary(&self) -> Option<&SourceEntry> {
        self.sources.first()
    }

    #[must_use]
    pub fn secondaries(&self) -> &[SourceEntry] {
        self.sources.get(1..).unwrap_or_default()
    }

    pub fn from_json_str(input: &str) -> Result<Self, JoinError> {
        serde_json::from_str(input)
            .map_err(|err| JoinError::InvalidRequest(format!("malformed request: {err}")))
    }

    pub fn from_json_path(path: &Path) -> Result<Self, JoinError> {
        let text = fs::read_to_string(path).map_err(|err| {
            JoinError::InvalidRequest(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&text)
    }
}

/// Where the merged table goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    File(PathBuf),
    /// A timestamped `merged_*.csv` inside this directory.
    Directory(PathBuf),
}

impl OutputTarget {
    #[must_use]
    pub fn resolve(&self, now: DateTime<Local>) -> PathBuf {
        match self {
            Self::File(path) => path.clone(),
            Self::Directory(dir) => dir.join(default_output_name(now)),
        }
    }
}

#[must_use]
pub fn default_output_name(now: DateTime<Local>) -> String {
    format!("{OUTPUT_PREFIX}{}.csv", now.format(OUTPUT_TIMESTAMP_FORMAT))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSource {
    pub label: String,
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipatingSource {
    pub label: String,
    pub path: PathBuf,
    pub columns: Vec<String>,
    pub matched_rows: usize,
    pub distinct_keys: usize,
    pub from_cache: bool,
}

/// Report of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOutcome {
    pub output: PathBuf,
    pub header: Vec<String>,
    pub rows_read: usize,
    pub rows_written: usize,
    pub rows_skipped: usize,
    pub participating: Vec<ParticipatingSource>,
    pub skipped: Vec<SkippedSource>,
    pub state: RunState,
    pub history: Vec<RunState>,
}

/// Drives one request: builds every secondary index, then streams the
/// primary into the output. Indexes come from the caller's registry, so a
/// runner reused across requests shares built indexes.
pub struct JoinRunner<'a> {
    policy: &'a JoinPolicy,
    registry: &'a IndexRegistry,
    progress: &'a dyn ProgressSink,
    cancel: &'a CancelToken,
}

struct Planned<'r> {
    entry: &'r SourceEntry,
    spec: IndexSpec,
}

impl<'a> JoinRunner<'a> {
    pub fn new(
        policy: &'a JoinPolicy,
        registry: &'a IndexRegistry,
        progress: &'a dyn ProgressSink,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            policy,
            registry,
            progress,
            cancel,
        }
    }

    pub fn run(&self, request: &JoinRequest, target: &OutputTarget) -> Result<JoinOutcome, JoinError> {
        let mut lifecycle = RunLifecycle::new();
        self.run_with_lifecycle(request, target, &mut lifecycle)
    }

    /// Like [`JoinRunner::run`], leaving the final state in `lifecycle`
    /// (`Done`, or `Failed` when an error is returned).
    pub fn run_with_lifecycle(
        &self,
        request: &JoinRequest,
        target: &OutputTarget,
        lifecycle: &mut RunLifecycle,
    ) -> Result<JoinOutcome, JoinError> {
        match self.execute(request, target, lifecycle) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                lifecycle.fail();
                #[cfg(feature = "tracing")]
                tracing::error!(error = %err, "join run failed");
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        request: &JoinRequest,
        target: &OutputTarget,
        lifecycle: &mut RunLifecycle,
    ) -> Result<JoinOutcome, JoinError> {
        self.policy.validate()?;
        let primary = request
            .primary()
            .ok_or_else(|| JoinError::InvalidRequest("request names no sources".to_owned()))?;
        let primary_key = primary.key_column.clone().ok_or_else(|| {
            JoinError::InvalidRequest(format!(
                "primary source {:?} has no join key column",
                primary.label
            ))
        })?;

        let mut primary_source = open_primary(primary)?;
        primary_source
            .header()
            .require(&primary_key)
            .map_err(|err| primary_header_error(&primary.label, primary.path.clone(), err))?;
        let primary_columns = primary
            .columns
            .clone()
            .unwrap_or_else(|| primary_source.header().names().to_vec());
        if self.policy.projection_mode == ProjectionMode::Strict {
            let missing = primary_source
                .header()
                .resolve_projection(&primary_columns)
                .missing()
                .into_iter()
                .map(str::to_owned)
                .collect::<Vec<_>>();
            if !missing.is_empty() {
                return Err(JoinError::ProjectionColumnMissing {
                    label: primary.label.clone(),
                    path: primary.path.clone(),
                    columns: missing,
                });
            }
        }

        lifecycle.advance(RunState::Building)?;
        let mut skipped = Vec::new();
        let planned = plan_secondaries(request.secondaries(), &mut skipped);
        let built = self.build_indexes(&planned)?;

        let mut indexes = Vec::new();
        let mut projections = vec![primary_columns];
        let mut members = Vec::new();
        for (plan, result) in planned.iter().zip(built) {
            match result {
                Ok(index) => {
                    projections.push(plan.spec.columns.clone());
                    members.push(plan.entry);
                    indexes.push(index);
                }
                Err(err) if err.is_source_local() => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        source = %plan.entry.label,
                        error = %err,
                        "secondary source skipped"
                    );
                    skipped.push(SkippedSource {
                        label: plan.entry.label.clone(),
                        path: plan.entry.path.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(JoinError::from_index(&plan.entry.label, err)),
            }
        }
        if self.cancel.is_cancelled() {
            return Err(JoinError::Cancelled {
                phase: Phase::Building,
                rows: 0,
            });
        }

        let output = target.resolve(Local::now());
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| JoinError::Output {
                path: output.clone(),
                source,
            })?;
        }

        lifecycle.advance(RunState::Streaming)?;
        let streamer = JoinStreamer::new(self.policy, self.progress, self.cancel);
        let report = self.stream(
            &streamer,
            &output,
            primary,
            &primary_key,
            primary_source.as_mut(),
            &indexes,
            &projections,
        )?;
        lifecycle.advance(RunState::Done)?;

        let participating = members
            .iter()
            .zip(&indexes)
            .zip(&report.matches)
            .map(|((entry, index), matched)| ParticipatingSource {
                label: entry.label.clone(),
                path: entry.path.clone(),
                columns: index.requested_columns().to_vec(),
                matched_rows: *matched,
                distinct_keys: index.stats().distinct_keys,
                from_cache: index.stats().from_cache,
            })
            .collect();

        #[cfg(feature = "tracing")]
        tracing::info!(
            output = %output.display(),
            rows = report.rows_written,
            skipped_sources = skipped.len(),
            "join complete"
        );
        Ok(JoinOutcome {
            output,
            header: report.header,
            rows_read: report.rows_read,
            rows_written: report.rows_written,
            rows_skipped: report.rows_skipped,
            participating,
            skipped,
            state: lifecycle.state(),
            history: lifecycle.history().to_vec(),
        })
    }

    fn build_indexes(
        &self,
        planned: &[Planned<'_>],
    ) -> Result<Vec<Result<Arc<KeyIndex>, IndexError>>, JoinError> {
        let builder = IndexBuilder::new(self.policy, self.progress, self.cancel);
        if !self.policy.parallel_builds || planned.len() < 2 {
            return Ok(planned
                .iter()
                .map(|plan| self.registry.get_or_build(&builder, &plan.spec))
                .collect());
        }

        thread::scope(|scope| {
            let handles = planned
                .iter()
                .map(|plan| {
                    let builder = &builder;
                    (
                        plan,
                        scope.spawn(move || self.registry.get_or_build(builder, &plan.spec)),
                    )
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|(plan, handle)| {
                    handle.join().map_err(|_| JoinError::WorkerPanicked {
                        label: plan.entry.label.clone(),
                    })
                })
                .collect()
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn stream(
        &self,
        streamer: &JoinStreamer<'_>,
        output: &Path,
        primary: &SourceEntry,
        primary_key: &str,
        source: &mut dyn TabularSource,
        indexes: &[Arc<KeyIndex>],
        projections: &[Vec<String>],
    ) -> Result<MergeReport, JoinError> {
        let output_error = |source: std::io::Error| JoinError::Output {
            path: output.to_path_buf(),
            source,
        };

        if self.policy.atomic_output {
            let dir = output
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let staged = NamedTempFile::new_in(dir).map_err(output_error)?;
            let mut sink = CsvSink::new(staged);
            let report = streamer.merge(
                &primary.label,
                source,
                indexes,
                primary_key,
                projections,
                &mut sink,
            )?;
            sink.into_inner()?
                .persist(output)
                .map_err(|err| output_error(err.error))?;
            Ok(report)
        } else {
            let file = File::create(output).map_err(output_error)?;
            let mut sink = CsvSink::new(file);
            let report = streamer.merge(
                &primary.label,
                source,
                indexes,
                primary_key,
                projections,
                &mut sink,
            )?;
            sink.into_inner()?;
            Ok(report)
        }
    }
}

fn open_primary(entry: &SourceEntry) -> Result<BoxedSource, JoinError> {
    open_source(&entry.path).map_err(|err| match err {
        SourceError::NotFound { path } => JoinError::SourceNotFound {
            label: entry.label.clone(),
            path,
        },
        other => JoinError::Source {
            label: entry.label.clone(),
            path: entry.path.clone(),
            row: None,
            source: other,
        },
    })
}

fn plan_secondaries<'r>(
    entries: &'r [SourceEntry],
    skipped: &mut Vec<SkippedSource>,
) -> Vec<Planned<'r>> {
    let mut planned = Vec::with_capacity(entries.len());
    for entry in entries {
        let reason = match (&entry.key_column, &entry.columns) {
            (Some(key), Some(columns)) => {
                planned.push(Planned {
                    entry,
                    spec: IndexSpec::new(&entry.label, &entry.path, key, columns.clone()),
                });
                continue;
            }
            (None, _) => "no join key column selected",
            (_, None) => "no columns selected",
        };
        #[cfg(feature = "tracing")]
        tracing::warn!(source = %entry.label, reason, "secondary source skipped");
        skipped.push(SkippedSource {
            label: entry.label.clone(),
            path: entry.path.clone(),
            reason: reason.to_owned(),
        });
    }
    planned
}
