//! Shared logging setup for vmexport binaries.
//!
//! Installs a size-capped rolling file writer under the vmexport home
//! directory plus a filtered stderr layer. The per-job log directory
//! exposed here is also where exporter backends tee child-process
//! output, which backs `GET /jobs/logs/{id}`.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "vmexport_daemon=info,vmexport_protocol=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for a vmexport binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a rolling file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = RollingWriter::open(log_dir, config.app_name)
        .context("Failed to initialize rolling log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// The vmexport home directory: `$VMEXPORT_HOME` or `~/.vmexport`.
pub fn vmexport_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("VMEXPORT_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vmexport")
}

/// The logs directory: `<home>/logs`.
pub fn logs_dir() -> PathBuf {
    vmexport_home().join("logs")
}

/// The per-job logs directory: `<home>/logs/jobs`.
pub fn jobs_log_dir() -> PathBuf {
    logs_dir().join("jobs")
}

/// Log file for one job id. Ids are sanitized before touching the
/// filesystem.
pub fn job_log_path(job_id: &str) -> PathBuf {
    jobs_log_dir().join(format!("{}.log", sanitize_name(job_id)))
}

/// Ensure the logs directories exist.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    let jobs = jobs_log_dir();
    fs::create_dir_all(&jobs)
        .with_context(|| format!("Failed to create job logs directory: {}", jobs.display()))?;
    Ok(logs)
}

struct AppenderState {
    file: File,
    size: u64,
}

/// Appender that rotates `<base>.log` through `<base>.log.1..N` once
/// the size cap is hit. Shared between tracing layers via a mutex.
#[derive(Clone)]
pub struct RollingWriter {
    dir: PathBuf,
    base_name: String,
    state: Arc<Mutex<AppenderState>>,
}

impl RollingWriter {
    fn open(dir: PathBuf, base_name: &str) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let base_name = sanitize_name(base_name);
        let state = open_current(&dir, &base_name)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        let writer = Self {
            dir,
            base_name,
            state: Arc::new(Mutex::new(state)),
        };
        Ok(writer)
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base_name))
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base_name, index))
    }

    fn rotate(&self, state: &mut AppenderState) -> io::Result<()> {
        let _ = state.file.flush();

        let oldest = self.rotated_path(MAX_LOG_FILES - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for idx in (1..MAX_LOG_FILES - 1).rev() {
            let src = self.rotated_path(idx);
            if src.exists() {
                fs::rename(&src, self.rotated_path(idx + 1))?;
            }
        }
        let current = self.current_path();
        if current.exists() {
            fs::rename(current, self.rotated_path(1))?;
        }

        *state = open_current(&self.dir, &self.base_name)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(())
    }
}

fn open_current(dir: &std::path::Path, base_name: &str) -> Result<AppenderState> {
    let path = dir.join(format!("{}.log", base_name));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let size = file.metadata()?.len();
    Ok(AppenderState { file, size })
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        if state.size + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate(&mut state)?;
        }
        let bytes = state.file.write(buf)?;
        state.size += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        state.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RollingWriter {
    type Writer = RollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_name("../../etc/passwd"), "______etc_passwd");
        assert_eq!(sanitize_name("job-42_a"), "job-42_a");
    }

    #[test]
    fn rolling_writer_rotates_at_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = RollingWriter::open(tmp.path().to_path_buf(), "test").unwrap();

        // Force a size just under the cap, then push past it.
        {
            let mut state = writer.state.lock().unwrap();
            state.size = MAX_LOG_FILE_SIZE - 4;
        }
        writer.write_all(b"0123456789").unwrap();
        writer.flush().unwrap();

        assert!(tmp.path().join("test.log").exists());
        assert!(tmp.path().join("test.log.1").exists());
    }
}
