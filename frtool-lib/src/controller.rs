//! Orchestration of one user-initiated operation.
//!
//! The controller validates preconditions, applies image transforms, drives
//! the job runner and surfaces a final [`Completion`]. Each operation walks
//! the state machine `Idle → Validating → Transforming → Running →
//! Finalizing → Done`, strictly forward, with `Cancelled` reachable from the
//! middle states. One controller drives at most one live subprocess; a
//! concurrent second operation is rejected with [`Error::Busy`] rather than
//! queued, because the programmer hardware cannot be shared.

use crate::catalog::{ChipCatalog, ChipInfo};
use crate::image::{self, ImageFile, FILL_BYTE};
use crate::job::{FlashromLauncher, JobCanceller, JobOutcome, JobSpec, ToolLauncher};
use crate::progress::ProgressSinkArc;
use crate::{Error, FlasherConfig, Result};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ControllerState {
    Idle,
    Validating,
    Transforming,
    Running,
    Finalizing,
    Cancelled,
    Done,
}

impl ControllerState {
    fn is_terminal(self) -> bool {
        matches!(self, ControllerState::Cancelled | ControllerState::Done)
    }

    /// A new operation may begin only when no previous one is in flight.
    fn accepts_new_operation(self) -> bool {
        self == ControllerState::Idle || self.is_terminal()
    }
}

/// Terminal result of a controller operation.
#[derive(Debug)]
pub struct Completion {
    /// The chip involved, when one was identified.
    pub chip: Option<ChipInfo>,
    /// Snapshot of every chip the job detected.
    pub catalog: ChipCatalog,
}

impl From<JobOutcome> for Completion {
    fn from(outcome: JobOutcome) -> Self {
        Self {
            chip: outcome.chip().cloned(),
            catalog: outcome.catalog,
        }
    }
}

pub struct FlashController {
    config: FlasherConfig,
    launcher: Arc<dyn ToolLauncher>,
    sink: ProgressSinkArc,
    state: Mutex<ControllerState>,
    active: Mutex<Option<JobCanceller>>,
    cancel_requested: AtomicBool,
    catalog: Mutex<ChipCatalog>,
}

impl FlashController {
    pub fn new(config: FlasherConfig, sink: ProgressSinkArc) -> Self {
        let launcher = Arc::new(FlashromLauncher::new(config.clone()));
        Self::with_launcher(config, launcher, sink)
    }

    /// Construction seam for substituting the subprocess launcher.
    pub fn with_launcher(
        config: FlasherConfig,
        launcher: Arc<dyn ToolLauncher>,
        sink: ProgressSinkArc,
    ) -> Self {
        Self {
            config,
            launcher,
            sink,
            state: Mutex::new(ControllerState::Idle),
            active: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
            catalog: Mutex::new(ChipCatalog::default()),
        }
    }

    pub fn state(&self) -> ControllerState {
        *lock(&self.state)
    }

    /// Snapshot of the chips found by the most recent probe.
    pub fn catalog(&self) -> ChipCatalog {
        lock(&self.catalog).clone()
    }

    /// Queries the attached hardware for chip identity and capacity.
    pub fn probe(&self) -> Result<Completion> {
        self.begin()?;
        let result = self.run_probe();
        self.finish(result)
    }

    /// Reads the chip into `target`. With `unpad_to`, the dump is truncated
    /// to that logical size before it is persisted.
    pub fn read(&self, target: &Path, unpad_to: Option<u64>) -> Result<Completion> {
        self.begin()?;
        let result = self.run_read(target, unpad_to);
        self.finish(result)
    }

    /// Writes `source` to the chip, padded to the chip capacity. When
    /// `capacity` is not supplied the chip is probed first to obtain it.
    pub fn write(&self, source: &Path, capacity: Option<u64>) -> Result<Completion> {
        self.begin()?;
        let result = self.run_write(source, capacity);
        self.finish(result)
    }

    /// Requests cancellation of the operation in flight. Always eventually
    /// completes: the active job is signalled (graceful, then forced after
    /// the configured grace period); with no active job the controller
    /// transitions directly to `Cancelled`.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        let active = lock(&self.active).clone();
        if let Some(canceller) = active {
            tracing::info!("cancelling running flash job");
            canceller.cancel();
        } else {
            let mut state = lock(&self.state);
            if !state.is_terminal() {
                *state = ControllerState::Cancelled;
            }
        }
    }

    fn run_probe(&self) -> Result<Completion> {
        self.advance(ControllerState::Running)?;
        let outcome = self.run_job(JobSpec::probe())?;
        self.advance(ControllerState::Finalizing)?;
        *lock(&self.catalog) = outcome.catalog.clone();
        if outcome.catalog.is_empty() {
            return Err(Error::ChipNotFound(
                "probe completed without identifying a chip".to_string(),
            ));
        }
        Ok(outcome.into())
    }

    fn run_read(&self, target: &Path, unpad_to: Option<u64>) -> Result<Completion> {
        if let Some(size) = unpad_to {
            if size == 0 {
                return Err(Error::invalid_argument("unpad size must be positive"));
            }
        }

        // The tool dumps into a scratch file; the (optionally unpadded)
        // image only reaches `target` once the job has fully succeeded.
        let scratch = TempDir::new()?;
        let dump_path = scratch.path().join("dump.bin");
        let spec = JobSpec::read(&dump_path).with_chip(self.config.chip.clone());

        self.advance(ControllerState::Running)?;
        let outcome = self.run_job(spec)?;
        self.advance(ControllerState::Finalizing)?;

        let mut dump = ImageFile::open(&dump_path)?;
        let data = dump.load()?;
        let data = match unpad_to {
            Some(size) => image::unpad(data, size)?,
            None => data.to_vec(),
        };
        fs::write(target, &data)?;
        dump.release();
        tracing::info!(target = %target.display(), bytes = data.len(), "ROM dump persisted");
        Ok(outcome.into())
    }

    fn run_write(&self, source: &Path, capacity: Option<u64>) -> Result<Completion> {
        let mut source_image = ImageFile::open(source)?;

        let (capacity, chip) = match capacity {
            Some(capacity) => (capacity, self.config.chip.clone()),
            None => {
                // Extra probe sub-step to learn the chip capacity; still part
                // of validation, so the state machine stays forward-only.
                let outcome = self.run_job(JobSpec::probe())?;
                *lock(&self.catalog) = outcome.catalog.clone();
                let chip = outcome
                    .chip()
                    .cloned()
                    .ok_or_else(|| Error::ChipNotFound("probe before write found no chip".to_string()))?;
                (capacity_checked(&chip)?, Some(chip.identifier()))
            }
        };

        self.advance(ControllerState::Transforming)?;
        // Oversized images are rejected here, before any subprocess runs.
        let padded = image::pad(source_image.load()?, capacity, FILL_BYTE)?;
        source_image.release();

        let scratch = TempDir::new()?;
        let padded_path = scratch.path().join("padded.bin");
        fs::write(&padded_path, &padded)?;
        drop(padded);

        let spec = JobSpec::write(&padded_path)
            .with_chip(chip)
            .with_capacity(Some(capacity));
        self.advance(ControllerState::Running)?;
        let outcome = self.run_job(spec)?;
        self.advance(ControllerState::Finalizing)?;
        Ok(outcome.into())
    }

    /// Launches one job and waits it out, forwarding events to the sink.
    fn run_job(&self, spec: JobSpec) -> Result<JobOutcome> {
        if self.cancel_requested.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let handle = self.launcher.launch(&spec)?;
        let canceller = handle.canceller();
        *lock(&self.active) = Some(canceller.clone());
        // A cancel that raced the launch found no active job to signal;
        // deliver it now that the canceller is registered.
        if self.cancel_requested.load(Ordering::SeqCst) {
            canceller.cancel();
        }
        let outcome = handle.wait_with(self.sink.as_ref());
        *lock(&self.active) = None;
        outcome
    }

    /// Gate for a fresh operation; fails with `Busy` while one is in flight.
    fn begin(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.accepts_new_operation() {
            return Err(Error::Busy);
        }
        self.cancel_requested.store(false, Ordering::SeqCst);
        *state = ControllerState::Validating;
        Ok(())
    }

    /// Forward-only transition, observing a pending cancellation at each
    /// phase boundary.
    fn advance(&self, to: ControllerState) -> Result<()> {
        if self.cancel_requested.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        *lock(&self.state) = to;
        Ok(())
    }

    /// Seals the operation into its terminal state.
    fn finish(&self, result: Result<Completion>) -> Result<Completion> {
        *lock(&self.active) = None;
        let mut state = lock(&self.state);
        *state = match &result {
            Err(e) if e.kind() == crate::ErrorKind::Cancelled => ControllerState::Cancelled,
            _ => ControllerState::Done,
        };
        result
    }
}

fn capacity_checked(chip: &ChipInfo) -> Result<u64> {
    if chip.capacity == 0 {
        return Err(Error::unknown(format!(
            "probe reported no capacity for {}",
            chip.identifier()
        )));
    }
    Ok(chip.capacity)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
