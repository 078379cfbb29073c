//! Append-only instance history and deterministic replay
//!
//! Each instance owns one journal: the outcome of every journaled remote
//! call plus pause/resume markers, in the order the run produced them. After
//! a restart the recorded entries are replayed through a cursor so the run
//! re-derives its state without repeating side effects; once the cursor
//! reaches the end the journal switches to live recording.
//!
//! On disk a record is `len (u32 LE) | blake3 digest (32 bytes) | JSON body`.
//! Opening a journal truncates a torn or corrupted tail.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use super::error::{JournalError, JournalResult, StepError};
use super::instance::{InstanceId, RunOutcome};

const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = 4 + DIGEST_LEN;

/// One recorded step of an instance's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JournalEntry {
    /// The run was requested
    Started {
        /// Instance being run
        instance_id: InstanceId,
        /// Caller input
        input: Option<Value>,
        /// Wall-clock time of the request
        at: DateTime<Utc>,
    },
    /// A journaled remote call settled
    Call {
        /// Step name (e.g. `execute-block`)
        step: String,
        /// Recorded outcome
        outcome: Result<Value, StepError>,
    },
    /// The instance paused
    Paused {
        /// Pause payload
        payload: Option<Value>,
        /// When the pause began
        at: DateTime<Utc>,
    },
    /// The instance was resumed
    Resumed {
        /// Resume payload
        payload: Option<Value>,
        /// When the resume was accepted
        at: DateTime<Utc>,
    },
    /// The run reached a terminal state
    Finished {
        /// Terminal outcome
        outcome: RunOutcome,
        /// When the run finished
        at: DateTime<Utc>,
    },
}

impl JournalEntry {
    /// Short label used in replay diagnostics
    pub fn label(&self) -> String {
        match self {
            Self::Started { .. } => "started".to_string(),
            Self::Call { step, .. } => format!("call {step}"),
            Self::Paused { .. } => "paused".to_string(),
            Self::Resumed { .. } => "resumed".to_string(),
            Self::Finished { .. } => "finished".to_string(),
        }
    }

    /// Encode as a length-prefixed, digested record
    pub fn encode(&self) -> JournalResult<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        let digest = blake3::hash(&body);

        let mut record = Vec::with_capacity(HEADER_LEN + body.len());
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(digest.as_bytes());
        record.extend_from_slice(&body);
        Ok(record)
    }

    /// Decode one record; `Ok(None)` at a clean end of input
    fn decode_from_reader<R: Read>(reader: &mut R, offset: u64) -> JournalResult<Option<(Self, u64)>> {
        let mut header = [0u8; HEADER_LEN];
        match read_full(reader, &mut header)? {
            0 => return Ok(None),
            n if n < HEADER_LEN => {
                return Err(JournalError::Corrupted {
                    offset,
                    detail: format!("truncated header ({n} bytes)"),
                });
            }
            _ => {}
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut body = vec![0u8; len];
        let read = read_full(reader, &mut body)?;
        if read < len {
            return Err(JournalError::Corrupted {
                offset,
                detail: format!("truncated body ({read} of {len} bytes)"),
            });
        }

        if blake3::hash(&body).as_bytes() != &header[4..] {
            return Err(JournalError::Corrupted {
                offset,
                detail: "digest mismatch".to_string(),
            });
        }

        let entry = serde_json::from_slice(&body).map_err(|e| JournalError::Corrupted {
            offset,
            detail: e.to_string(),
        })?;
        Ok(Some((entry, (HEADER_LEN + len) as u64)))
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

struct JournalInner {
    entries: Vec<JournalEntry>,
    cursor: usize,
    writer: Option<BufWriter<File>>,
    closed: bool,
}

/// History of one instance, replayed then appended to
pub struct Journal {
    path: Option<PathBuf>,
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// A journal that lives only in memory
    pub fn in_memory() -> Self {
        Self::with_history(Vec::new())
    }

    /// An in-memory journal that replays the given history first
    pub fn with_history(entries: Vec<JournalEntry>) -> Self {
        Self {
            path: None,
            inner: Mutex::new(JournalInner {
                entries,
                cursor: 0,
                writer: None,
                closed: false,
            }),
        }
    }

    /// Open (or create) a file-backed journal, repairing a damaged tail
    pub fn open(path: impl Into<PathBuf>) -> JournalResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entries = if path.exists() {
            validate_and_repair(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path: Some(path),
            inner: Mutex::new(JournalInner {
                entries,
                cursor: 0,
                writer: Some(BufWriter::new(file)),
                closed: false,
            }),
        })
    }

    /// Read every intact entry of a journal file without opening it for writing
    pub fn read_entries(path: &Path) -> JournalResult<Vec<JournalEntry>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        let mut offset = 0u64;
        while let Some((entry, len)) = JournalEntry::decode_from_reader(&mut reader, offset)? {
            entries.push(entry);
            offset += len;
        }
        Ok(entries)
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true while recorded entries remain to be replayed
    pub fn is_replaying(&self) -> bool {
        let inner = self.inner.lock();
        inner.cursor < inner.entries.len()
    }

    /// Returns true if the history ends with a `Finished` entry
    pub fn is_finished(&self) -> bool {
        matches!(
            self.inner.lock().entries.last(),
            Some(JournalEntry::Finished { .. })
        )
    }

    /// Snapshot of all entries (recorded and live)
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.inner.lock().entries.clone()
    }

    /// Consume the next recorded entry if replaying.
    ///
    /// `expected` names what the run is about to do; if the recorded entry
    /// does not satisfy `matches`, replay has diverged.
    pub fn replay_next(
        &self,
        expected: &str,
        matches: impl FnOnce(&JournalEntry) -> bool,
    ) -> JournalResult<Option<JournalEntry>> {
        let mut inner = self.inner.lock();
        let position = inner.cursor;
        let Some(entry) = inner.entries.get(position) else {
            return Ok(None);
        };

        if !matches(entry) {
            return Err(JournalError::Nondeterminism {
                position,
                expected: expected.to_string(),
                found: entry.label(),
            });
        }

        let entry = entry.clone();
        inner.cursor += 1;
        Ok(Some(entry))
    }

    /// Consume the next recorded entry only if it satisfies `matches`
    pub fn replay_if(&self, matches: impl FnOnce(&JournalEntry) -> bool) -> Option<JournalEntry> {
        let mut inner = self.inner.lock();
        let position = inner.cursor;
        let entry = inner.entries.get(position).filter(|entry| matches(*entry))?.clone();
        inner.cursor += 1;
        Some(entry)
    }

    /// Release the file handle and the in-memory history of a finished run.
    ///
    /// Only the last entry is kept so `is_finished` still answers; later
    /// appends fail with `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.writer = None;
        let keep_from = inner.entries.len().saturating_sub(1);
        inner.entries.drain(..keep_from);
        inner.entries.shrink_to_fit();
        inner.cursor = inner.entries.len();
        inner.closed = true;
    }

    /// Returns true once `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Record a new entry; refused while replaying.
    ///
    /// File-backed journals flush and fsync before the entry becomes visible.
    pub fn append(&self, entry: JournalEntry) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(JournalError::Closed);
        }
        let remaining = inner.entries.len() - inner.cursor;
        if remaining > 0 {
            return Err(JournalError::Replaying { remaining });
        }

        if let Some(writer) = inner.writer.as_mut() {
            let record = entry.encode()?;
            writer.write_all(&record)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        inner.entries.push(entry);
        inner.cursor = inner.entries.len();
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("entries", &inner.entries.len())
            .field("cursor", &inner.cursor)
            .finish()
    }
}

/// Read all intact records and truncate anything after the last good one
fn validate_and_repair(path: &Path) -> JournalResult<Vec<JournalEntry>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    let mut last_valid_offset = 0u64;

    loop {
        match JournalEntry::decode_from_reader(&mut reader, last_valid_offset) {
            Ok(Some((entry, len))) => {
                entries.push(entry);
                last_valid_offset += len;
            }
            Ok(None) => break,
            Err(JournalError::Corrupted { offset, detail }) => {
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    %detail,
                    "corrupted journal record, truncating"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(last_valid_offset)?;
                file.sync_all()?;
                tracing::info!(
                    path = %path.display(),
                    bytes = last_valid_offset,
                    "truncated journal"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(entries)
}
