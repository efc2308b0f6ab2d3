//! Extraction engine collaborator.
//!
//! The orchestrator only ever talks to the [`MediaEngine`] trait; the
//! production implementation shells out to the `yt-dlp` binary. Keeping the
//! subprocess plumbing behind a trait lets the orchestrator and the HTTP
//! layer run against in-memory stubs in tests.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Deserialize;
use thiserror::Error;

use crate::formats::RawFormat;
use crate::quality::PostProcessing;

/// Rendered by yt-dlp for every progress tick; the pipe-separated fields are
/// parsed back into [`ProgressEvent`]s. Missing values render as `NA`.
const PROGRESS_TEMPLATE: &str =
    "download:%(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s";

/// How often the deadline watchdog re-checks a running child.
const WATCHDOG_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch {bin}: {source}")]
    Launch {
        bin: String,
        source: std::io::Error,
    },

    /// The engine process exited unsuccessfully; the message carries the
    /// engine's own error line when one was printed.
    #[error("{0}")]
    Failed(String),

    #[error("{operation} timed out after {seconds}s")]
    TimedOut {
        operation: &'static str,
        seconds: u64,
    },

    #[error("could not parse probe metadata: {0}")]
    Metadata(String),
}

/// Metadata-only probe result: the canonical title plus every raw encoding
/// the engine reported.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub title: String,
    pub formats: Vec<RawFormat>,
}

/// Everything a full download needs beyond the source URL.
#[derive(Debug, Clone)]
pub struct FetchJob {
    /// Engine selection expression, e.g. `bestvideo[height=720]+bestaudio`.
    pub selection: String,
    pub post_processing: PostProcessing,
    /// Output path template containing the engine's `%(ext)s` placeholder.
    pub output_template: String,
}

/// Discrete progress notification forwarded to a [`ProgressSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Downloading,
    Finished,
}

/// Receives progress events during a download. Delivery is best-effort: a
/// sink that ignores events (or an absent sink) never affects the retrieval.
pub trait ProgressSink: Send + Sync {
    fn receive(&self, event: ProgressEvent);
}

/// Boundary to the media-extraction engine.
pub trait MediaEngine: Send + Sync {
    /// Queries metadata only; writes nothing to disk.
    fn probe(&self, url: &str) -> Result<ProbeReport, EngineError>;

    /// Performs the full download into the job's output template.
    fn fetch(
        &self,
        url: &str,
        job: &FetchJob,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<(), EngineError>;
}

/// Production engine backed by the `yt-dlp` executable.
pub struct YtDlp {
    bin: String,
    probe_timeout: Duration,
    fetch_timeout: Duration,
}

impl YtDlp {
    pub fn new(bin: impl Into<String>, probe_timeout: Duration, fetch_timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            probe_timeout,
            fetch_timeout,
        }
    }

    /// Runs `<bin> --version` to fail loudly at startup when the engine is
    /// missing or broken.
    pub fn preflight(&self) -> Result<(), EngineError> {
        let status = Command::new(&self.bin)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| EngineError::Launch {
                bin: self.bin.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Failed(format!(
                "{} is installed but returned a failure status",
                self.bin
            )))
        }
    }

    fn spawn(&self, command: &mut Command) -> Result<std::process::Child, EngineError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Launch {
                bin: self.bin.clone(),
                source,
            })
    }
}

impl MediaEngine for YtDlp {
    fn probe(&self, url: &str) -> Result<ProbeReport, EngineError> {
        let mut command = Command::new(&self.bin);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg("--force-ipv4")
            .arg(url);

        let mut child = self.spawn(&mut command)?;
        let watchdog = Watchdog::arm(child.id(), self.probe_timeout);
        let stderr = drain_stderr(&mut child);

        let mut raw = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            let _ = stdout.read_to_string(&mut raw);
        }

        let status = child.wait().map_err(|source| EngineError::Launch {
            bin: self.bin.clone(),
            source,
        })?;
        watchdog.disarm();

        if !status.success() {
            if watchdog.timed_out() {
                return Err(EngineError::TimedOut {
                    operation: "probe",
                    seconds: self.probe_timeout.as_secs(),
                });
            }
            return Err(EngineError::Failed(failure_message(
                "probe",
                url,
                status,
                &stderr.collect(),
            )));
        }

        let parsed: ProbeJson =
            serde_json::from_str(&raw).map_err(|err| EngineError::Metadata(err.to_string()))?;
        Ok(parsed.into_report())
    }

    fn fetch(
        &self,
        url: &str,
        job: &FetchJob,
        sink: Option<&dyn ProgressSink>,
    ) -> Result<(), EngineError> {
        let mut command = Command::new(&self.bin);
        command
            .arg("--no-playlist")
            .arg("--force-ipv4")
            .arg("--no-warnings")
            .arg("--newline")
            .arg("--progress")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("--output")
            .arg(&job.output_template)
            .arg("--format")
            .arg(&job.selection);

        for arg in post_processing_args(job.post_processing) {
            command.arg(arg);
        }
        command.arg(url);

        let mut child = self.spawn(&mut command)?;
        let watchdog = Watchdog::arm(child.id(), self.fetch_timeout);
        let stderr = drain_stderr(&mut child);

        if let Some(stdout) = child.stdout.take() {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if let Some(event) = parse_progress_line(&line)
                    && let Some(sink) = sink
                {
                    sink.receive(event);
                }
            }
        }

        let status = child.wait().map_err(|source| EngineError::Launch {
            bin: self.bin.clone(),
            source,
        })?;
        watchdog.disarm();

        if !status.success() {
            if watchdog.timed_out() {
                return Err(EngineError::TimedOut {
                    operation: "download",
                    seconds: self.fetch_timeout.as_secs(),
                });
            }
            return Err(EngineError::Failed(failure_message(
                "download",
                url,
                status,
                &stderr.collect(),
            )));
        }

        Ok(())
    }
}

/// Maps a post-processing directive onto engine flags.
fn post_processing_args(post: PostProcessing) -> Vec<String> {
    match post {
        PostProcessing::ExtractMp3 { bitrate_kbps } => vec![
            "--extract-audio".to_owned(),
            "--audio-format".to_owned(),
            "mp3".to_owned(),
            "--audio-quality".to_owned(),
            format!("{bitrate_kbps}K"),
        ],
        PostProcessing::ConvertMp4 => vec!["--recode-video".to_owned(), "mp4".to_owned()],
    }
}

/// Parses one rendered progress-template line. Anything that does not match
/// the template (info lines, partial writes) is ignored.
fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let mut parts = line.trim().split('|');
    let status = match parts.next()? {
        "downloading" => ProgressStatus::Downloading,
        "finished" => ProgressStatus::Finished,
        _ => return None,
    };
    let downloaded_bytes = parse_byte_field(parts.next()?).unwrap_or(0);
    let total_bytes = parse_byte_field(parts.next()?);
    Some(ProgressEvent {
        status,
        downloaded_bytes,
        total_bytes,
    })
}

/// The engine renders unknown numeric fields as `NA` and may report floats.
fn parse_byte_field(field: &str) -> Option<u64> {
    let field = field.trim();
    if field.is_empty() || field == "NA" {
        return None;
    }
    field.parse::<f64>().ok().map(|value| value.max(0.0) as u64)
}

/// Builds the user-visible failure message, preferring the engine's own
/// `ERROR:` line, then the last thing it printed, then a generic summary.
fn failure_message(operation: &str, url: &str, status: ExitStatus, stderr: &str) -> String {
    let error_line = stderr
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("ERROR:"));
    let last_line = stderr
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty());

    match error_line.or(last_line) {
        Some(line) => line.to_owned(),
        None => format!("{operation} failed for {url} (status {status})"),
    }
}

/// Background reader that keeps the child's stderr pipe drained while stdout
/// is consumed on the calling thread.
struct StderrDrain {
    handle: Option<thread::JoinHandle<String>>,
}

fn drain_stderr(child: &mut std::process::Child) -> StderrDrain {
    let handle = child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        })
    });
    StderrDrain { handle }
}

impl StderrDrain {
    fn collect(mut self) -> String {
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

/// Kills the child when the deadline passes. `disarm` must be called once the
/// child has been reaped; `timed_out` reports whether the kill fired.
struct Watchdog {
    done: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(pid: u32, timeout: Duration) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let timed_out = Arc::new(AtomicBool::new(false));

        let watch_done = Arc::clone(&done);
        let watch_timed_out = Arc::clone(&timed_out);
        thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if watch_done.load(Ordering::Acquire) {
                    return;
                }
                thread::sleep(WATCHDOG_POLL);
            }
            if !watch_done.load(Ordering::Acquire) {
                watch_timed_out.store(true, Ordering::Release);
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        });

        Self { done, timed_out }
    }

    fn disarm(&self) {
        self.done.store(true, Ordering::Release);
    }

    fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }
}

#[derive(Deserialize)]
struct ProbeJson {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

impl ProbeJson {
    /// Older or partial sources may lack `fulltitle`; fall back through the
    /// same chain the rest of the tooling uses.
    fn into_report(self) -> ProbeReport {
        let title = self
            .fulltitle
            .or(self.title)
            .filter(|t| !t.is_empty())
            .or(self.id)
            .unwrap_or_else(|| "untitled".to_owned());
        ProbeReport {
            title,
            formats: self.formats,
        }
    }
}
