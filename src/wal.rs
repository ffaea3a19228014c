//! Append-only, newline-delimited JSON log with tail-style consumption.
//!
//! The writer and the reader hold separate handles on the same file so a
//! consumer can start before the producer is done. Readers tail the file:
//! on EOF they keep whatever partial line was read and poll again shortly.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const TAIL_POLL: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 8 * 1024;

// Close state machine: Open -> WriterClosed -> ReaderWriterClosed.
const OPEN: u8 = 0;
const WRITER_CLOSED: u8 = 1;
const READER_WRITER_CLOSED: u8 = 2;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal closed")]
    Closed,
    #[error("wal consumer canceled")]
    Canceled,
    #[error("wal io: {0}")]
    Io(#[from] std::io::Error),
}

/// A single record read back from the log. `error` is set when the line is
/// not valid JSON; the raw bytes are kept either way so the consumer can
/// log or inspect them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub bytes: Vec<u8>,
    pub error: Option<String>,
}

impl Entry {
    fn decode(line: Vec<u8>) -> Self {
        match serde_json::from_slice::<serde::de::IgnoredAny>(&line) {
            Ok(_) => Entry { bytes: line, error: None },
            Err(err) => Entry {
                bytes: line,
                error: Some(err.to_string()),
            },
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.error.is_some()
    }
}

struct Reader {
    file: File,
    // Bytes read off the file but not yet returned as complete records.
    // Rewinds push a record back onto the front of this buffer.
    pending: Vec<u8>,
}

pub struct Wal {
    path: PathBuf,
    state: AtomicU8,
    writer: Mutex<File>,
    reader: Mutex<Reader>,
}

impl Wal {
    /// Opens (or creates) the log file at `path` with an append-mode writer
    /// handle and an independent reader handle.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let reader = File::open(&path).await?;

        Ok(Self {
            path,
            state: AtomicU8::new(OPEN),
            writer: Mutex::new(writer),
            reader: Mutex::new(Reader {
                file: reader,
                pending: Vec::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. The payload and its newline terminator go out in
    /// a single write.
    pub async fn append(&self, msg: &[u8]) -> Result<(), WalError> {
        if self.state.load(Ordering::Acquire) != OPEN {
            return Err(WalError::Closed);
        }

        let mut frame = Vec::with_capacity(msg.len() + 1);
        frame.extend_from_slice(msg);
        frame.push(b'\n');

        let mut w = self.writer.lock().await;
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }

    /// Returns the next record, tailing the file until one shows up.
    /// `Ok(None)` means the log was closed and fully drained.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<Option<Entry>, WalError> {
        self.next_where(cancel, |_| false).await
    }

    /// Like [`Wal::next`], but halts when `stop` returns true for an entry.
    /// The triggering entry is pushed back onto the read buffer, so a
    /// subsequent consumer resumes from it without loss.
    pub async fn next_where<F>(
        &self,
        cancel: &CancellationToken,
        stop: F,
    ) -> Result<Option<Entry>, WalError>
    where
        F: Fn(&Entry) -> bool,
    {
        let mut r = self.reader.lock().await;
        loop {
            if self.state.load(Ordering::Acquire) == READER_WRITER_CLOSED {
                return Ok(None);
            }

            if let Some(line) = split_line(&mut r.pending) {
                let entry = Entry::decode(line);
                if stop(&entry) {
                    unread(&mut r.pending, &entry.bytes);
                    return Ok(None);
                }
                return Ok(Some(entry));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(WalError::Canceled),
                res = r.file.read(&mut chunk) => res?,
            };
            if n == 0 {
                if self.state.load(Ordering::Acquire) == WRITER_CLOSED {
                    // Drained. A trailing fragment with no terminator at
                    // this point can never be completed; drop it.
                    self.state.store(READER_WRITER_CLOSED, Ordering::Release);
                    return Ok(None);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(WalError::Canceled),
                    _ = tokio::time::sleep(TAIL_POLL) => {}
                }
                continue;
            }
            r.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Closes the writer side. Consumers drain the remaining complete
    /// records and then observe end-of-stream. Idempotent.
    pub fn close(&self) {
        let _ = self
            .state
            .compare_exchange(OPEN, WRITER_CLOSED, Ordering::AcqRel, Ordering::Acquire);
    }
}

fn split_line(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = pending.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = pending.drain(..=pos).collect();
    line.pop(); // strip the newline
    Some(line)
}

fn unread(pending: &mut Vec<u8>, line: &[u8]) {
    let mut restored = Vec::with_capacity(line.len() + 1 + pending.len());
    restored.extend_from_slice(line);
    restored.push(b'\n');
    restored.append(pending);
    *pending = restored;
}
