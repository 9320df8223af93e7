//! Watch handle for one tailed file
//!
//! A [`WatchHandle`] owns the tail state of a single open file: the byte
//! offset of everything already delivered, plus a buffer holding any
//! partial trailing line. Opening a handle primes it with the last N
//! complete lines (read backward from end of file); [`WatchHandle::poll`]
//! then returns every complete line appended past the offset.
//!
//! Truncation and replacement are not errors: when the file shrinks below
//! the offset (or, on Unix, its inode changes) the handle resets to offset
//! 0 and resumes from the new content.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Chunk size for the backward priming scan.
const PRIMING_CHUNK: u64 = 8192;

/// Error from opening or polling a watch handle.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The path does not exist or is not a regular file at open time.
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// A read/seek failure on a file that exists.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Tail state for one open file.
#[derive(Debug)]
pub struct WatchHandle {
    path: PathBuf,
    /// Byte offset of everything already consumed.
    offset: u64,
    /// Partial trailing line (no terminating newline yet). Kept as raw
    /// bytes: a multi-byte character split across reads is decoded only
    /// once its line is complete.
    buffer: Vec<u8>,
    #[cfg(unix)]
    inode: u64,
    closed: bool,
}

impl WatchHandle {
    /// Open `path` and prime with its last `priming_lines` complete lines.
    ///
    /// Fails with [`WatchError::NotFound`] if the path is missing or not a
    /// regular file. On success the offset is pinned to the current end of
    /// file, so priming content is never re-delivered by `poll`. An
    /// unterminated trailing line is seeded into the partial-line buffer
    /// rather than primed.
    pub async fn open(
        path: impl Into<PathBuf>,
        priming_lines: usize,
    ) -> Result<(Self, Vec<String>), WatchError> {
        let path = path.into();
        let meta = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WatchError::NotFound(path));
            }
            Err(e) => return Err(io_error(path, e)),
        };
        if !meta.is_file() {
            return Err(WatchError::NotFound(path));
        }

        let (lines, partial, offset) = match read_last_lines(&path, priming_lines).await {
            Ok(v) => v,
            Err(e) => return Err(io_error(path, e)),
        };

        Ok((
            Self {
                path,
                offset,
                buffer: partial,
                #[cfg(unix)]
                inode: unix_inode(&meta),
                closed: false,
            },
            lines,
        ))
    }

    /// Read everything appended past the last known offset and return the
    /// complete lines found, in append order.
    ///
    /// A file that shrank or was replaced resets the offset to 0 and resumes
    /// from the new start. A file that is missing at poll time is treated as
    /// a transient rotation window and yields an empty batch; the handle
    /// stays open. Returns an empty batch after [`WatchHandle::close`].
    pub async fn poll(&mut self) -> Result<Vec<String>, WatchError> {
        if self.closed {
            return Ok(Vec::new());
        }

        let meta = match fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io(e)),
        };

        #[cfg(unix)]
        let replaced = unix_inode(&meta) != self.inode;
        #[cfg(not(unix))]
        let replaced = false;

        if meta.len() < self.offset || replaced {
            debug!(path = %self.path.display(), "watched file truncated or replaced; resetting offset");
            self.offset = 0;
            self.buffer.clear();
            #[cfg(unix)]
            {
                self.inode = unix_inode(&meta);
            }
        }

        if meta.len() == self.offset {
            return Ok(Vec::new());
        }

        let mut file = match fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io(e)),
        };
        if let Err(e) = file.seek(SeekFrom::Start(self.offset)).await {
            return Err(self.io(e));
        }
        let mut buf = Vec::new();
        if let Err(e) = file.read_to_end(&mut buf).await {
            return Err(self.io(e));
        }

        self.offset += buf.len() as u64;
        self.buffer.extend_from_slice(&buf);
        Ok(drain_lines(&mut self.buffer))
    }

    /// Release the handle. Idempotent: closing a closed handle is a no-op.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn io(&self, source: std::io::Error) -> WatchError {
        io_error(self.path.clone(), source)
    }
}

fn io_error(path: PathBuf, source: std::io::Error) -> WatchError {
    WatchError::Io { path, source }
}

#[cfg(unix)]
fn unix_inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

/// Extract every complete line from `buffer`, leaving any trailing partial
/// line in place. Strips a terminating `\r` (CRLF input) but preserves the
/// rest of the line verbatim, including empty lines.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;

    for idx in 0..buffer.len() {
        if buffer[idx] != b'\n' {
            continue;
        }
        let mut line = &buffer[start..idx];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        out.push(String::from_utf8_lossy(line).into_owned());
        start = idx + 1;
    }

    if start > 0 {
        buffer.drain(..start);
    }
    out
}

/// Read the last `n` complete lines of `path` by scanning backward in
/// chunks. Returns `(lines, partial_trailing_line, file_len)`.
async fn read_last_lines(
    path: &Path,
    n: usize,
) -> Result<(Vec<String>, Vec<u8>, u64), std::io::Error> {
    let mut file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    let mut region: Vec<u8> = Vec::new();
    let mut start = len;
    while start > 0 {
        let chunk_start = start.saturating_sub(PRIMING_CHUNK);
        let mut chunk = vec![0u8; (start - chunk_start) as usize];
        file.seek(SeekFrom::Start(chunk_start)).await?;
        file.read_exact(&mut chunk).await?;
        chunk.extend_from_slice(&region);
        region = chunk;
        start = chunk_start;

        // n complete lines plus the fragment dropped below plus slack for a
        // missing final newline.
        let newlines = region.iter().filter(|b| **b == b'\n').count();
        if newlines >= n + 2 {
            break;
        }
    }

    // When the scan stopped mid-file, everything before the first newline is
    // the tail of a line we cannot see the start of.
    let mut slice: &[u8] = &region;
    if start > 0 {
        slice = match slice.iter().position(|b| *b == b'\n') {
            Some(pos) => &slice[pos + 1..],
            None => &[],
        };
    }

    // Anything after the last newline is an unterminated trailing line; it
    // seeds the partial-line buffer instead of the priming batch.
    let (complete, partial) = match slice.iter().rposition(|b| *b == b'\n') {
        Some(pos) => (&slice[..pos], &slice[pos + 1..]),
        None => (&slice[..0], slice),
    };

    let mut lines: Vec<String> = if complete.is_empty() && !slice.starts_with(b"\n") {
        Vec::new()
    } else {
        complete
            .split(|b| *b == b'\n')
            .map(|l| {
                let l = if l.last() == Some(&b'\r') {
                    &l[..l.len() - 1]
                } else {
                    l
                };
                String::from_utf8_lossy(l).into_owned()
            })
            .collect()
    };
    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }

    Ok((lines, partial.to_vec(), len))
}
