//! Subprocess lifecycle for one flashing operation.
//!
//! A job owns exactly one live subprocess. Its stdout and stderr are drained
//! continuously on dedicated threads regardless of how fast the caller
//! consumes events, so the tool's pipes can never fill up and stall it. Each
//! line goes through the [`OutputParser`] and the resulting events are pushed
//! onto an ordered, unbounded channel in arrival order.

use crate::catalog::{ChipCatalog, ChipInfo};
use crate::error::ErrorKind;
use crate::parser::OutputParser;
use crate::progress::{NoOpProgressSink, ProgressEvent, ProgressSink};
use crate::{Error, FlasherConfig, Result};
use std::env;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum JobKind {
    Probe,
    Read,
    Write,
}

/// Everything needed to launch one tool invocation. Immutable after
/// creation; cancellation travels through the handle's token instead.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    /// Destination for a read, source for a write. Unused by probes.
    pub image_path: Option<PathBuf>,
    /// Explicit chip selection passed through to the tool.
    pub chip: Option<String>,
    /// Declared chip capacity in bytes, when already known.
    pub capacity: Option<u64>,
}

impl JobSpec {
    pub fn probe() -> Self {
        Self {
            kind: JobKind::Probe,
            image_path: None,
            chip: None,
            capacity: None,
        }
    }

    pub fn read(path: impl Into<PathBuf>) -> Self {
        Self {
            image_path: Some(path.into()),
            ..Self::probe_kind(JobKind::Read)
        }
    }

    pub fn write(path: impl Into<PathBuf>) -> Self {
        Self {
            image_path: Some(path.into()),
            ..Self::probe_kind(JobKind::Write)
        }
    }

    fn probe_kind(kind: JobKind) -> Self {
        Self { kind, ..Self::probe() }
    }

    pub fn with_chip(mut self, chip: Option<String>) -> Self {
        self.chip = chip;
        self
    }

    pub fn with_capacity(mut self, capacity: Option<u64>) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Seam between the controller and the real subprocess machinery; tests
/// substitute a scripted implementation.
pub trait ToolLauncher: Send + Sync {
    fn launch(&self, spec: &JobSpec) -> Result<JobHandle>;
}

/// Cancellation token for a running job. Cloneable so the controller can
/// keep one while the operation thread blocks in [`JobHandle::wait_with`].
#[derive(Debug, Clone)]
pub struct JobCanceller {
    flag: Arc<AtomicBool>,
    child: Option<Arc<Mutex<Child>>>,
    grace: Duration,
}

impl JobCanceller {
    pub fn detached(flag: Arc<AtomicBool>) -> Self {
        Self {
            flag,
            child: None,
            grace: Duration::ZERO,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Requests termination: graceful signal first, forced kill once the
    /// grace period elapses. Returns once the request is fully delivered;
    /// the job's terminal event is emitted by its worker.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let Some(child) = &self.child else {
            return;
        };

        #[cfg(unix)]
        {
            let pid = lock_child(child).id();
            tracing::debug!(pid, "sending SIGTERM to flashing tool");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + self.grace;
        loop {
            if let Ok(Some(_)) = lock_child(child).try_wait() {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        tracing::debug!("grace period elapsed, killing flashing tool");
        let _ = lock_child(child).kill();
    }
}

/// A live (or scripted) job: an ordered event stream plus a cancel token.
#[derive(Debug)]
pub struct JobHandle {
    receiver: Receiver<ProgressEvent>,
    canceller: JobCanceller,
    worker: Option<JoinHandle<()>>,
}

impl JobHandle {
    /// Assembles a handle from its raw parts. Used by launchers, including
    /// scripted test doubles whose worker thread feeds the channel directly.
    pub fn from_parts(
        receiver: Receiver<ProgressEvent>,
        canceller: JobCanceller,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            receiver,
            canceller,
            worker: Some(worker),
        }
    }

    pub fn canceller(&self) -> JobCanceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Blocks until the job is over and every buffered event has been
    /// delivered, forwarding each event to `sink` in arrival order, then
    /// aggregates the stream into the final outcome.
    pub fn wait_with(mut self, sink: &dyn ProgressSink) -> Result<JobOutcome> {
        let mut events = Vec::new();
        for event in self.receiver.iter() {
            sink.on_event(&event);
            events.push(event);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        aggregate(events)
    }

    pub fn wait(self) -> Result<JobOutcome> {
        self.wait_with(&NoOpProgressSink)
    }
}

/// Aggregated result of a finished job.
#[derive(Debug)]
pub struct JobOutcome {
    /// Chips detected during the job, in detection order.
    pub catalog: ChipCatalog,
    /// The full ordered event stream, for callers that need to replay it.
    pub events: Vec<ProgressEvent>,
}

impl JobOutcome {
    pub fn chip(&self) -> Option<&ChipInfo> {
        self.catalog.chips().first()
    }
}

fn aggregate(events: Vec<ProgressEvent>) -> Result<JobOutcome> {
    let catalog = ChipCatalog::from_events(&events);
    let mut failure = None;
    let mut completed_ok = false;
    for event in &events {
        match event {
            ProgressEvent::Failed { kind, detail } if failure.is_none() => {
                failure = Some(Error::from_kind(*kind, detail.clone()));
            }
            ProgressEvent::Completed(ok) => completed_ok = *ok,
            _ => {}
        }
    }
    if let Some(err) = failure {
        return Err(err);
    }
    if !completed_ok {
        return Err(Error::unknown("tool exited without reporting success"));
    }
    Ok(JobOutcome { catalog, events })
}

/// Production launcher: resolves the external tool, builds its argument
/// vector and spawns it with both output pipes streamed.
pub struct FlashromLauncher {
    config: FlasherConfig,
    parser: OutputParser,
}

impl FlashromLauncher {
    pub fn new(config: FlasherConfig) -> Self {
        Self {
            config,
            parser: OutputParser::new(),
        }
    }

    pub fn with_parser(config: FlasherConfig, parser: OutputParser) -> Self {
        Self { config, parser }
    }

    fn build_args(&self, spec: &JobSpec) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(programmer) = &self.config.programmer {
            args.push("--programmer".into());
            args.push(programmer.into());
        }
        if let Some(chip) = spec.chip.as_ref().or(self.config.chip.as_ref()) {
            args.push("--chip".into());
            args.push(chip.into());
        }
        match (spec.kind, &spec.image_path) {
            (JobKind::Probe, _) => {}
            (JobKind::Read, Some(path)) => {
                args.push("-r".into());
                args.push(path.into());
            }
            (JobKind::Write, Some(path)) => {
                args.push("-w".into());
                args.push(path.into());
            }
            // Validated by the controller before launch; a pathless
            // read/write would fail the tool's own argv parsing anyway.
            (JobKind::Read | JobKind::Write, None) => {}
        }
        args
    }

    /// Runs the bare tool and scrapes its programmer list (the lines after
    /// the `Valid choices are:` marker).
    pub fn list_programmers(&self) -> Result<Vec<String>> {
        let tool = resolve_tool(&self.config.tool)?;
        let output = Command::new(&tool)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::process(format!("{}: {}", tool.display(), e)))?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned()
            + &String::from_utf8_lossy(&output.stderr);

        let mut programmers = Vec::new();
        let mut in_list = false;
        for line in text.lines() {
            if in_list {
                for word in line.split_whitespace() {
                    let name = word.trim_matches([',', '.']);
                    if !name.is_empty() {
                        programmers.push(name.to_string());
                    }
                }
            } else if line.contains("Valid choices are:") {
                in_list = true;
            }
        }
        Ok(programmers)
    }

    /// Version string from `<tool> --version`.
    pub fn tool_version(&self) -> Result<String> {
        let tool = resolve_tool(&self.config.tool)?;
        let output = Command::new(&tool)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::process(format!("{}: {}", tool.display(), e)))?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut words = line.split_whitespace();
            return match (words.next(), words.next()) {
                (Some(_), Some(version)) => Ok(version.to_string()),
                _ => Ok(line.to_string()),
            };
        }
        Err(Error::unknown("tool printed no version"))
    }
}

impl ToolLauncher for FlashromLauncher {
    fn launch(&self, spec: &JobSpec) -> Result<JobHandle> {
        let tool = resolve_tool(&self.config.tool)?;
        let args = self.build_args(spec);
        tracing::info!(tool = %tool.display(), kind = %spec.kind, "launching flashing tool");
        spawn_streaming(&tool, &args, self.parser.clone(), self.config.kill_grace)
    }
}

/// Spawns `program` and wires its output streams into a [`JobHandle`].
///
/// Lower-level entry used by [`FlashromLauncher`]; exposed so the streaming
/// machinery can be exercised against arbitrary commands.
pub fn spawn_streaming(
    program: &Path,
    args: &[OsString],
    parser: OutputParser,
    kill_grace: Duration,
) -> Result<JobHandle> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::process(format!("{}: {}", program.display(), e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::process("child stdout unavailable"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::process("child stderr unavailable"))?;

    let (tx, rx) = channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let saw_failure = Arc::new(AtomicBool::new(false));
    let child = Arc::new(Mutex::new(child));

    let canceller = JobCanceller {
        flag: Arc::clone(&cancel),
        child: Some(Arc::clone(&child)),
        grace: kill_grace,
    };

    let stderr_pump = {
        let tx = tx.clone();
        let parser = parser.clone();
        let saw_failure = Arc::clone(&saw_failure);
        thread::spawn(move || pump_lines(stderr, &tx, &parser, &saw_failure))
    };

    let worker = thread::spawn(move || {
        pump_lines(stdout, &tx, &parser, &saw_failure);
        let _ = stderr_pump.join();

        let status = wait_for_exit(&child);
        let terminal = terminal_event(status, &cancel, &saw_failure);
        if let Some(event) = terminal {
            let _ = tx.send(event);
        }
        // tx drops here, closing the event stream.
    });

    Ok(JobHandle::from_parts(rx, canceller, worker))
}

/// Reads `source` line by line until EOF, parsing and forwarding every
/// event. Keeps draining even if the receiving side is gone, so the
/// subprocess never blocks on a full pipe.
fn pump_lines(
    source: impl Read,
    tx: &Sender<ProgressEvent>,
    parser: &OutputParser,
    saw_failure: &AtomicBool,
) {
    for line in BufReader::new(source).lines() {
        let Ok(line) = line else {
            break;
        };
        tracing::trace!(line = %line, "tool output");
        if let Some(event) = parser.parse_line(&line) {
            if matches!(event, ProgressEvent::Failed { .. }) {
                saw_failure.store(true, Ordering::SeqCst);
            }
            let _ = tx.send(event);
        }
    }
}

fn terminal_event(
    status: std::io::Result<ExitStatus>,
    cancel: &AtomicBool,
    saw_failure: &AtomicBool,
) -> Option<ProgressEvent> {
    if cancel.load(Ordering::SeqCst) {
        return Some(ProgressEvent::Failed {
            kind: ErrorKind::Cancelled,
            detail: "cancelled by user".to_string(),
        });
    }
    match status {
        Ok(status) if status.success() && !saw_failure.load(Ordering::SeqCst) => {
            Some(ProgressEvent::Completed(true))
        }
        Ok(_) if saw_failure.load(Ordering::SeqCst) => {
            // A specific Failed event already captured the cause.
            None
        }
        Ok(status) => {
            tracing::debug!(%status, "flashing tool exited with failure status");
            Some(ProgressEvent::Completed(false))
        }
        Err(e) => Some(ProgressEvent::Failed {
            kind: ErrorKind::Process,
            detail: format!("waiting for flashing tool: {}", e),
        }),
    }
}

/// Polls instead of blocking in `wait()` so a concurrent cancel can still
/// lock the child and kill it.
fn wait_for_exit(child: &Arc<Mutex<Child>>) -> std::io::Result<ExitStatus> {
    loop {
        if let Some(status) = lock_child(child).try_wait()? {
            return Ok(status);
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn lock_child(child: &Arc<Mutex<Child>>) -> std::sync::MutexGuard<'_, Child> {
    match child.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Resolves the configured tool to an executable path: explicit paths are
/// checked directly, bare names are searched on `PATH`.
pub fn resolve_tool(tool: &str) -> Result<PathBuf> {
    let candidate = Path::new(tool);
    if candidate.components().count() > 1 {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        return Err(Error::ToolNotFound(tool.to_string()));
    }
    let paths = env::var_os("PATH").ok_or_else(|| Error::ToolNotFound(tool.to_string()))?;
    for dir in env::split_paths(&paths) {
        let full = dir.join(candidate);
        if full.is_file() {
            return Ok(full);
        }
    }
    Err(Error::ToolNotFound(tool.to_string()))
}
