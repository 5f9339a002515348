//! Atomic file operations.
//!
//! Every durable document is written through [`write_file_atomic`]:
//! - temporary file in the target directory, fsync, then rename
//! - bounded retry with exponential backoff for transient contention
//! - retry count reported back so callers can emit `WARN-IO-RETRY`
//!
//! Append-only logs (evidence, audit) use [`append_line`], which fsyncs after
//! each record.

use camino::Utf8Path;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::error::FsError;

/// Attempts made before a transient failure is surfaced.
pub const MAX_WRITE_ATTEMPTS: u32 = 4;
const INITIAL_DELAY_MS: u64 = 10;
const MAX_TOTAL_DELAY_MS: u64 = 250;

/// Result of an atomic write operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicWriteResult {
    /// Number of retries after transient failures
    pub retry_count: u32,
    /// Human-readable notes about each retry
    pub warnings: Vec<String>,
}

/// Atomically replace `path` with `content`.
///
/// Normalizes line endings to LF before writing.
pub fn write_file_atomic(path: &Utf8Path, content: &str) -> Result<AtomicWriteResult, FsError> {
    write_bytes_atomic(path, normalize_line_endings(content).as_bytes())
}

/// Atomically replace `path` with raw `bytes`.
pub fn write_bytes_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<AtomicWriteResult, FsError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    ensure_parent(parent)?;

    let mut result = AtomicWriteResult::default();
    let mut delay_ms = INITIAL_DELAY_MS;
    let mut total_delay_ms = 0;

    loop {
        match try_write(parent, path, bytes) {
            Ok(()) => return Ok(result),
            Err(err) if is_transient(&err) => {
                let attempts = result.retry_count + 1;
                if attempts >= MAX_WRITE_ATTEMPTS || total_delay_ms >= MAX_TOTAL_DELAY_MS {
                    return Err(FsError::RetriesExhausted {
                        path: path.to_string(),
                        attempts,
                        source: err,
                    });
                }
                tracing::warn!(path = %path, attempt = attempts, error = %err, "transient write failure, retrying");
                result
                    .warnings
                    .push(format!("Write to {path} retried after transient error: {err}"));
                result.retry_count = attempts;
                thread::sleep(Duration::from_millis(delay_ms));
                total_delay_ms += delay_ms;
                delay_ms *= 2;
            }
            Err(err) => {
                return Err(FsError::Write {
                    path: path.to_string(),
                    source: err,
                });
            }
        }
    }
}

fn try_write(dir: &Utf8Path, target: &Utf8Path, bytes: &[u8]) -> io::Result<()> {
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(target.as_std_path()).map_err(|e| e.error)?;
    Ok(())
}

/// Append one line to a log file and fsync it.
///
/// A trailing newline is added. Lines containing a newline are rejected so
/// each record stays on exactly one line.
pub fn append_line(path: &Utf8Path, line: &str) -> Result<(), FsError> {
    if line.contains('\n') {
        return Err(FsError::Write {
            path: path.to_string(),
            source: io::Error::new(ErrorKind::InvalidInput, "record spans multiple lines"),
        });
    }
    if let Some(parent) = path.parent() {
        ensure_parent(parent)?;
    }
    let write = || -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()
    };
    write().map_err(|source| FsError::Write {
        path: path.to_string(),
        source,
    })
}

/// Read a file to string, mapping `NotFound` to `Ok(None)`.
pub fn read_optional(path: &Utf8Path) -> Result<Option<String>, FsError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(FsError::Read {
            path: path.to_string(),
            source,
        }),
    }
}

fn ensure_parent(dir: &Utf8Path) -> Result<(), FsError> {
    if dir.as_str().is_empty() {
        return Ok(());
    }
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(FsError::CreateDir {
            path: dir.to_string(),
            source,
        }),
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::PermissionDenied
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::ResourceBusy
    )
}

fn normalize_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_write_creates_parent_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("nested/deeper/state.json");

        let result = write_file_atomic(&path, "first").unwrap();
        assert_eq!(result.retry_count, 0);
        assert!(result.warnings.is_empty());
        write_file_atomic(&path, "second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_line_endings_normalized() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("crlf.txt");
        write_file_atomic(&path, "a\r\nb\rc").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\nc");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let root = utf8(&dir);
        write_bytes_atomic(&root.join("x.bin"), b"\x00\x01").unwrap();
        let entries: Vec<_> = fs::read_dir(&root).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_append_line_appends() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("log.jsonl");
        append_line(&path, "{\"a\":1}").unwrap();
        append_line(&path, "{\"a\":2}").unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "{\"a\":1}\n{\"a\":2}\n"
        );
    }

    #[test]
    fn test_append_line_rejects_multiline() {
        let dir = TempDir::new().unwrap();
        let path = utf8(&dir).join("log.jsonl");
        assert!(append_line(&path, "a\nb").is_err());
    }

    #[test]
    fn test_read_optional_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_optional(&utf8(&dir).join("absent")).unwrap().is_none());
    }
}
