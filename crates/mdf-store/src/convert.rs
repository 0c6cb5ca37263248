//! Post-processing of finished uploads by an external converter.
//!
//! The converter is invoked as `[interpreter] <program> <path-to-bin>`.
//! Its stdout and stderr are drained line by line by two tasks running
//! alongside the process, so a chatty converter can never stall on a full
//! pipe while we wait for it. Each line goes to an [`OutputSink`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use mdf_config::{
    log_converter_error, log_converter_info, log_converter_warn, ConverterConfig, ExitPolicy,
    DEFAULT_SETTLE_DELAY_MS,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::{Result, StoreError};

/// Which converter output a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Receives converter output.
///
/// Called concurrently from the stdout and stderr tasks; lines of one
/// stream arrive in order, lines of different streams interleave freely.
pub trait OutputSink: Send + Sync {
    fn line(&self, upload_id: &str, stream: OutputStream, line: &str);
}

/// Forwards converter output to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn line(&self, upload_id: &str, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => {
                log_converter_info!("Converter output", id = upload_id, stream = "stdout", line = line)
            }
            OutputStream::Stderr => {
                log_converter_warn!("Converter output", id = upload_id, stream = "stderr", line = line)
            }
        }
    }
}

/// Outcome of one converter run
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub upload_id: String,
    pub status: ExitStatus,
    pub stdout_lines: usize,
    pub stderr_lines: usize,
}

impl ConversionReport {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, `None` if the converter was killed by a signal
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// External converter run once per finished upload.
#[derive(Clone)]
pub struct Converter {
    program: PathBuf,
    interpreter: Option<String>,
    settle_delay: Duration,
    exit_policy: ExitPolicy,
    sink: Arc<dyn OutputSink>,
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter")
            .field("program", &self.program)
            .field("interpreter", &self.interpreter)
            .field("settle_delay", &self.settle_delay)
            .field("exit_policy", &self.exit_policy)
            .finish_non_exhaustive()
    }
}

impl Converter {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            interpreter: None,
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            exit_policy: ExitPolicy::default(),
            sink: Arc::new(TracingSink),
        }
    }

    /// `None` when no converter program is configured
    pub fn from_config(config: &ConverterConfig) -> Option<Self> {
        let program = config.program.as_ref()?;
        let mut converter = Self::new(program)
            .with_settle_delay(config.settle_delay())
            .with_exit_policy(config.exit_policy);
        if let Some(interpreter) = &config.interpreter {
            converter = converter.with_interpreter(interpreter);
        }
        Some(converter)
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_exit_policy(mut self, policy: ExitPolicy) -> Self {
        self.exit_policy = policy;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, bin_path: &Path) -> Command {
        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&self.program);
                cmd
            }
            None => Command::new(&self.program),
        };
        cmd.arg(bin_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_failure(&self, reason: impl Into<String>) -> StoreError {
        StoreError::ProcessSpawnFailure {
            program: self.program.clone(),
            reason: reason.into(),
        }
    }

    /// Convert the finished upload stored at `bin_path` and wait for the
    /// converter to exit.
    pub async fn run(&self, upload_id: &str, bin_path: &Path) -> Result<ConversionReport> {
        settle(upload_id, bin_path, self.settle_delay).await?;

        let mut child = self
            .command(bin_path)
            .spawn()
            .map_err(|e| self.spawn_failure(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.spawn_failure("stdout pipe unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.spawn_failure("stderr pipe unavailable"))?;

        log_converter_info!(
            "Converter started",
            id = upload_id,
            pid = child.id().unwrap_or(0),
            program = tracing::field::display(self.program.display())
        );

        let stdout_task = self.drain(upload_id, OutputStream::Stdout, stdout);
        let stderr_task = self.drain(upload_id, OutputStream::Stderr, stderr);

        let status = child.wait().await?;
        let stdout_lines = join_drain(stdout_task).await?;
        let stderr_lines = join_drain(stderr_task).await?;

        let report = ConversionReport {
            upload_id: upload_id.to_string(),
            status,
            stdout_lines,
            stderr_lines,
        };

        if report.success() {
            log_converter_info!("Converter finished", id = upload_id);
            return Ok(report);
        }

        match self.exit_policy {
            ExitPolicy::Strict => {
                log_converter_error!(
                    "Converter failed",
                    id = upload_id,
                    code = tracing::field::debug(report.code())
                );
                Err(StoreError::ConverterFailed {
                    id: upload_id.to_string(),
                    code: report.code(),
                })
            }
            ExitPolicy::Ignore => {
                log_converter_warn!(
                    "Converter exited unsuccessfully, ignoring",
                    id = upload_id,
                    code = tracing::field::debug(report.code())
                );
                Ok(report)
            }
        }
    }

    fn drain<R>(&self, upload_id: &str, stream: OutputStream, reader: R) -> JoinHandle<usize>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        let upload_id = upload_id.to_string();
        tokio::spawn(async move { forward_lines(reader, stream, &upload_id, sink.as_ref()).await })
    }
}

/// Make sure the finished content is on disk, then give the filesystem
/// the configured grace period.
async fn settle(upload_id: &str, bin_path: &Path, delay: Duration) -> Result<()> {
    let file = tokio::fs::File::open(bin_path)
        .await
        .map_err(|e| StoreError::from_io(e, upload_id))?;
    file.sync_all().await?;
    drop(file);

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    Ok(())
}

/// Forward `reader` line by line until EOF. Returns the number of lines.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the
/// stream. A read error ends forwarding early; the process is still waited
/// for by the caller.
async fn forward_lines<R>(reader: R, stream: OutputStream, upload_id: &str, sink: &dyn OutputSink) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink.line(upload_id, stream, line.trim_end_matches(['\n', '\r']));
                count += 1;
            }
            Err(e) => {
                log_converter_warn!(
                    "Converter output ended early",
                    id = upload_id,
                    stream = tracing::field::display(stream),
                    error = tracing::field::display(&e)
                );
                break;
            }
        }
    }

    count
}

async fn join_drain(task: JoinHandle<usize>) -> Result<usize> {
    task.await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))
}
