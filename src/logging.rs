// =============================================================================
// Logging - stdout plus a size-rotated file sink
// =============================================================================
//
// Every record goes to standard output (the panel's console view tails the
// container) and to <data_dir>/logs/agent.log. The file is capped at 128 KiB
// so the panel's inline log viewer never truncates it; on overflow the live
// file rotates to .1 and older rotations shift down to .5. Rotation is
// checked inline on each write under the writer's mutex.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Size cap for the active log file.
const MAX_LOG_BYTES: u64 = 128 * 1024;
/// Number of rotated files kept (.1 through .5).
const MAX_ROTATIONS: u32 = 5;

struct Inner {
    path: PathBuf,
    max_bytes: u64,
    file: Mutex<File>,
}

/// Append-only log writer that rotates the file in-line once it exceeds the
/// size cap. Cloning is cheap; all clones share the same underlying file.
#[derive(Clone)]
pub struct RotatingFileWriter {
    inner: Arc<Inner>,
}

impl RotatingFileWriter {
    /// Open (or create) the log file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_max_bytes(path, MAX_LOG_BYTES)
    }

    /// Open with an explicit size cap.
    pub fn with_max_bytes(path: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                max_bytes,
                file: Mutex::new(file),
            }),
        })
    }

    /// Rename `agent.log` to `.1`, shifting existing rotations down and
    /// discarding `.5`. The caller holds the file lock and replaces the
    /// handle afterwards.
    fn rotate(&self) -> std::io::Result<File> {
        let base = &self.inner.path;
        for n in (1..MAX_ROTATIONS).rev() {
            let from = rotation_path(base, n);
            if from.exists() {
                std::fs::rename(&from, rotation_path(base, n + 1))?;
            }
        }
        std::fs::rename(base, rotation_path(base, 1))?;
        File::create(base)
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.inner.file.lock();
        file.write_all(buf)?;
        if file.metadata()?.len() > self.inner.max_bytes {
            *file = self.rotate()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn rotation_path(base: &Path, n: u32) -> PathBuf {
    let mut os = base.as_os_str().to_owned();
    os.push(format!(".{n}"));
    PathBuf::from(os)
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

/// Install the global subscriber: one stdout layer, one file layer through
/// the rotating writer. `RUST_LOG` overrides the configured minimum level.
pub fn init(log_dir: &Path, level: &str) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_writer = RotatingFileWriter::open(log_dir.join("agent.log"))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_append_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let mut w = RotatingFileWriter::with_max_bytes(&path, 1024).unwrap();
        w.write_all(b"hello\n").unwrap();
        w.write_all(b"world\n").unwrap();
        w.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\nworld\n");
    }

    #[test]
    fn oversized_file_rotates_to_dot_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let mut w = RotatingFileWriter::with_max_bytes(&path, 16).unwrap();

        w.write_all(b"0123456789abcdef-more").unwrap();
        // Cap exceeded: the record landed in .1 and the live file is empty.
        assert!(rotation_path(&path, 1).exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        w.write_all(b"next").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "next");
    }

    #[test]
    fn rotations_shift_down_and_cap_at_five() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let mut w = RotatingFileWriter::with_max_bytes(&path, 4).unwrap();

        for i in 0..8 {
            w.write_all(format!("entry-{i}").as_bytes()).unwrap();
        }
        for n in 1..=5 {
            assert!(rotation_path(&path, n).exists(), "missing rotation .{n}");
        }
        assert!(!rotation_path(&path, 6).exists());
        // Newest rotation holds the most recent overflowing record.
        assert_eq!(
            std::fs::read_to_string(rotation_path(&path, 1)).unwrap(),
            "entry-7"
        );
    }
}
