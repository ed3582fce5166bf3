#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BATCH_SIZE: usize = 5_000;
pub const DEFAULT_PROGRESS_INTERVAL: usize = 10_000;
pub const DEFAULT_ARTIFACT_DIR: &str = "temp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMode {
    /// Projected columns absent from a header are dropped.
    Lenient,
    /// Projected columns absent from a header fail that source.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexBacking {
    Memory,
    Stored,
    /// Stored when the source file is larger than the threshold.
    Auto { stored_above_bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackingKind {
    Memory,
    Stored,
}

impl IndexBacking {
    #[must_use]
    pub fn resolve(self, source_len: u64) -> BackingKind {
        match self {
            Self::Memory => BackingKind::Memory,
            Self::Stored => BackingKind::Stored,
            Self::Auto { stored_above_bytes } => {
                if source_len > stored_above_bytes {
                    BackingKind::Stored
                } else {
                    BackingKind::Memory
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinPolicy {
    pub projection_mode: ProjectionMode,
    pub backing: IndexBacking,
    pub artifact_dir: PathBuf,
    pub batch_size: usize,
    pub progress_interval: usize,
    pub max_index_keys: Option<usize>,
    pub max_artifact_bytes: Option<u64>,
    pub parallel_builds: bool,
    pub atomic_output: bool,
}

impl JoinPolicy {
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            projection_mode: ProjectionMode::Lenient,
            backing: IndexBacking::Memory,
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            batch_size: DEFAULT_BATCH_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            max_index_keys: None,
            max_artifact_bytes: None,
            parallel_builds: false,
            atomic_output: false,
        }
    }

    #[must_use]
    pub fn strict() -> Self {
        Self {
            projection_mode: ProjectionMode::Strict,
            ..Self::lenient()
        }
    }

    #[must_use]
    pub fn with_backing(mut self, backing: IndexBacking) -> Self {
        self.backing = backing;
        self
    }

    #[must_use]
    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.batch_size == 0 {
            return Err(RuntimeError::InvalidPolicy(
                "batch_size must be greater than zero",
            ));
        }
        if self.progress_interval == 0 {
            return Err(RuntimeError::InvalidPolicy(
                "progress_interval must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn from_json_str(input: &str) -> Result<Self, RuntimeError> {
        let policy: Self = serde_json::from_str(input)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_json_path(path: &Path) -> Result<Self, RuntimeError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self::lenient()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Building,
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub source_label: String,
    pub rows: usize,
}

/// Advisory progress observations. Implementations must not affect the run.
pub trait ProgressSink: Send + Sync {
    fn observe(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn observe(&self, event: &ProgressEvent) {
        self(event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn observe(&self, _event: &ProgressEvent) {}
}

/// Logs every observation as an `info` event. Without the `tracing`
/// feature this behaves like [`NoopProgress`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn observe(&self, event: &ProgressEvent) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            phase = ?event.phase,
            source = %event.source_label,
            rows = event.rows,
            "progress"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = event;
    }
}

/// Keeps every observation, in arrival order.
#[derive(Debug, Default)]
pub struct ProgressLedger {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn for_phase(&self, phase: Phase) -> Vec<ProgressEvent> {
        self.records()
            .into_iter()
            .filter(|event| event.phase == phase)
            .collect()
    }
}

impl ProgressSink for ProgressLedger {
    fn observe(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Cooperative cancellation flag shared between the caller and the run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Building,
    Streaming,
    Done,
    Failed,
}

impl RunState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Building)
                | (Self::Building, Self::Streaming)
                | (Self::Streaming, Self::Done)
                | (Self::Idle | Self::Building | Self::Streaming, Self::Failed)
        )
    }
}

/// `Idle -> Building -> Streaming -> Done`, with `Failed` reachable from any
/// non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLifecycle {
    state: RunState,
    history: Vec<RunState>,
}

impl RunLifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
            history: vec![RunState::Idle],
        }
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    #[must_use]
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), RuntimeError> {
        if !self.state.can_advance_to(next) {
            return Err(RuntimeError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(from = ?self.state, to = ?next, "run state transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Moves to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = RunState::Failed;
            self.history.push(RunState::Failed);
        }
    }
}

impl Default for RunLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(&'static str),
    #[error("illegal run state transition {from:?} -> {to:?}")]
    IllegalTransition { from: RunState, to: RunState },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{
        BackingKind, CancelToken, IndexBacking, JoinPolicy, Phase, ProgressEvent, ProgressLedger,
        ProgressSink, ProjectionMode, RunLifecycle, RunState, RuntimeError, TracingProgress,
    };

    #[test]
    fn default_policy_is_lenient_and_memory_backed() {
        let policy = JoinPolicy::default();
        assert_eq!(policy.projection_mode, ProjectionMode::Lenient);
        assert_eq!(policy.backing, IndexBacking::Memory);
        assert_eq!(policy.batch_size, 5_000);
        policy.validate().expect("default policy is valid");
        assert_eq!(JoinPolicy::strict().projection_mode, ProjectionMode::Strict);
    }

    #[test]
    fn auto_backing_switches_on_source_size() {
        let backing = IndexBacking::Auto {
            stored_above_bytes: 1_024,
        };
        assert_eq!(backing.resolve(1_024), BackingKind::Memory);
        assert_eq!(backing.resolve(1_025), BackingKind::Stored);
    }

    #[test]
    fn partial_policy_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policy.json");
        fs::write(
            &path,
            r#"{"projection_mode":"strict","backing":{"kind":"auto","stored_above_bytes":10},"batch_size":2}"#,
        )
        .expect("write");

        let policy = JoinPolicy::from_json_path(&path).expect("load");
        assert_eq!(policy.projection_mode, ProjectionMode::Strict);
        assert_eq!(
            policy.backing,
            IndexBacking::Auto {
                stored_above_bytes: 10
            }
        );
        assert_eq!(policy.batch_size, 2);
        assert_eq!(policy.progress_interval, 10_000);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = JoinPolicy::from_json_str(r#"{"batch_size":0}"#).expect_err("must fail");
        assert!(matches!(err, RuntimeError::InvalidPolicy(_)));
    }

    #[test]
    fn lifecycle_enforces_phase_order() {
        let mut run = RunLifecycle::new();
        let err = run.advance(RunState::Streaming).expect_err("must fail");
        assert!(matches!(err, RuntimeError::IllegalTransition { .. }));

        run.advance(RunState::Building).expect("build");
        run.advance(RunState::Streaming).expect("stream");
        run.advance(RunState::Done).expect("done");
        run.fail();
        assert_eq!(run.state(), RunState::Done);
        assert_eq!(
            run.history(),
            &[
                RunState::Idle,
                RunState::Building,
                RunState::Streaming,
                RunState::Done
            ]
        );
    }

    #[test]
    fn failure_is_terminal() {
        let mut run = RunLifecycle::new();
        run.advance(RunState::Building).expect("build");
        run.fail();
        assert_eq!(run.state(), RunState::Failed);
        assert!(run.advance(RunState::Streaming).is_err());
    }

    #[test]
    fn ledger_and_closures_are_progress_sinks() {
        let ledger = ProgressLedger::new();
        let event = ProgressEvent {
            phase: Phase::Building,
            source_label: "cities".to_owned(),
            rows: 5_000,
        };
        ledger.observe(&event);
        assert_eq!(ledger.records(), vec![event.clone()]);
        assert!(ledger.for_phase(Phase::Streaming).is_empty());
        TracingProgress.observe(&event);

        let seen = std::sync::atomic::AtomicUsize::new(0);
        let counter = |event: &ProgressEvent| {
            seen.fetch_add(event.rows, std::sync::atomic::Ordering::SeqCst);
        };
        counter.observe(&event);
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 5_000);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
