//! Append-only on-disk form of a [`KeyIndex`](crate::KeyIndex).
//!
//! One JSON document per line: a `header` frame, zero or more `batch` frames
//! in sequence order, and exactly one closing `end` frame. A file without the
//! `end` frame is an interrupted build and is never loaded.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use kj_types::Record;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::IndexError;
use crate::node::KeyNode;

pub const ARTIFACT_FORMAT: u32 = 1;
pub const ARTIFACT_PREFIX: &str = "index_";
pub const ARTIFACT_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub format: u32,
    pub source: String,
    pub key_column: String,
    pub requested: Vec<String>,
    pub columns: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactEntry {
    path: Vec<String>,
    record: Record,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
enum Frame {
    Header(ArtifactHeader),
    Batch {
        seq: u64,
        rows: u64,
        entries: Vec<ArtifactEntry>,
    },
    End {
        batches: u64,
        rows: u64,
    },
}

/// Resolves a source path to the form used for artifact naming.
#[must_use]
pub fn resolve_source_path(path: &Path) -> PathBuf {
    fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// `<dir>/index_<hash>.jsonl`, where the hash covers the resolved source path.
#[must_use]
pub fn artifact_path(dir: &Path, source: &Path) -> PathBuf {
    let resolved = resolve_source_path(source);
    let digest = Sha256::digest(resolved.to_string_lossy().as_bytes());
    let mut name = String::from(ARTIFACT_PREFIX);
    for byte in digest.iter().take(16) {
        let _ = write!(name, "{byte:02x}");
    }
    name.push('.');
    name.push_str(ARTIFACT_EXTENSION);
    dir.join(name)
}

#[must_use]
pub fn is_artifact_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.starts_with(ARTIFACT_PREFIX)
        && path.extension().and_then(|ext| ext.to_str()) == Some(ARTIFACT_EXTENSION)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactSummary {
    pub batches: u64,
    pub rows: u64,
    pub bytes: u64,
}

/// Writes frames to an artifact, flushing after each one.
pub struct ArtifactWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    batches: u64,
    rows: u64,
    bytes: u64,
    max_bytes: Option<u64>,
}

impl ArtifactWriter {
    /// Creates (or truncates) the artifact and writes its header frame.
    pub fn create(
        path: &Path,
        header: ArtifactHeader,
        max_bytes: Option<u64>,
    ) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| IndexError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(path).map_err(|source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut writer = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            batches: 0,
            rows: 0,
            bytes: 0,
            max_bytes,
        };
        writer.write_frame(&Frame::Header(header))?;
        Ok(writer)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one batch. `rows` is the number of source rows it covers.
    pub fn append_batch(&mut self, batch: &KeyNode, rows: u64) -> Result<(), IndexError> {
        let entries = batch
            .entries()
            .into_iter()
            .map(|(path, record)| ArtifactEntry {
                path,
                record: record.clone(),
            })
            .collect();
        let frame = Frame::Batch {
            seq: self.batches,
            rows,
            entries,
        };
        self.write_frame(&frame)?;
        self.batches += 1;
        self.rows += rows;
        #[cfg(feature = "tracing")]
        tracing::debug!(
            artifact = %self.path.display(),
            seq = self.batches - 1,
            rows,
            bytes = self.bytes,
            "flushed index batch"
        );
        Ok(())
    }

    /// Writes the closing frame. The artifact is loadable only after this.
    pub fn finish(mut self) -> Result<ArtifactSummary, IndexError> {
        let frame = Frame::End {
            batches: self.batches,
            rows: self.rows,
        };
        self.write_frame(&frame)?;
        Ok(ArtifactSummary {
            batches: self.batches,
            rows: self.rows,
            bytes: self.bytes,
        })
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), IndexError> {
        let mut line = serde_json::to_vec(frame).map_err(|err| IndexError::ArtifactCorrupt {
            path: self.path.clone(),
            line: 0,
            detail: err.to_string(),
        })?;
        line.push(b'\n');

        let next = self.bytes + line.len() as u64;
        if let Some(limit) = self.max_bytes {
            if next > limit {
                return Err(IndexError::ResourceExhausted {
                    path: self.path.clone(),
                    detail: format!("artifact would grow to {next} bytes, limit is {limit}"),
                });
            }
        }

        self.writer
            .write_all(&line)
            .and_then(|()| self.writer.flush())
            .map_err(|source| IndexError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.bytes = next;
        Ok(())
    }
}

#[derive(Debug)]
pub struct LoadedArtifact {
    pub header: ArtifactHeader,
    pub root: KeyNode,
    pub batches: u64,
    pub rows: u64,
}

/// Reads an artifact, replaying batches in order so later records win.
pub fn read_artifact(path: &Path) -> Result<LoadedArtifact, IndexError> {
    let file = File::open(path).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let corrupt = |line: usize, detail: String| IndexError::ArtifactCorrupt {
        path: path.to_path_buf(),
        line,
        detail,
    };

    let mut header = None;
    let mut root = KeyNode::new();
    let mut batches = 0_u64;
    let mut rows = 0_u64;
    let mut finished = false;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        if finished {
            return Err(corrupt(line_no, "content after end frame".to_owned()));
        }

        let frame: Frame =
            serde_json::from_str(&line).map_err(|err| corrupt(line_no, err.to_string()))?;
        match frame {
            Frame::Header(found) => {
                if header.is_some() {
                    return Err(corrupt(line_no, "duplicate header frame".to_owned()));
                }
                if found.format != ARTIFACT_FORMAT {
                    return Err(corrupt(
                        line_no,
                        format!("unsupported artifact format {}", found.format),
                    ));
                }
                header = Some(found);
            }
            Frame::Batch {
                seq,
                rows: batch_rows,
                entries,
            } => {
                if header.is_none() {
                    return Err(corrupt(line_no, "batch before header".to_owned()));
                }
                if seq != batches {
                    return Err(corrupt(
                        line_no,
                        format!("expected batch {batches}, found {seq}"),
                    ));
                }
                for entry in entries {
                    root.insert(&entry.path, entry.record);
                }
                batches += 1;
                rows += batch_rows;
            }
            Frame::End {
                batches: declared_batches,
                rows: declared_rows,
            } => {
                if declared_batches != batches || declared_rows != rows {
                    return Err(corrupt(
                        line_no,
                        format!(
                            "end frame declares {declared_batches} batches/{declared_rows} rows, \
                             read {batches}/{rows}"
                        ),
                    ));
                }
                finished = true;
            }
        }
    }

    let header = header.ok_or_else(|| corrupt(1, "missing header frame".to_owned()))?;
    if !finished {
        return Err(IndexError::ArtifactIncomplete {
            path: path.to_path_buf(),
        });
    }

    Ok(LoadedArtifact {
        header,
        root,
        batches,
        rows,
    })
}
