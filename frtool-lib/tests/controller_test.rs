//! Controller flows exercised against a scripted subprocess launcher.

use frtool_lib::controller::{Completion, ControllerState, FlashController};
use frtool_lib::job::{JobCanceller, JobHandle, JobKind, JobSpec, ToolLauncher};
use frtool_lib::{
    ChipInfo, ErrorKind, FlasherConfig, ProgressEvent, ProgressSink, Result, no_op_progress_sink,
};
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir};

fn chip(capacity: u64) -> ChipInfo {
    ChipInfo {
        vendor: "WINBOND".to_string(),
        part: "W25Q128".to_string(),
        capacity,
        name: None,
    }
}

/// Builds a handle whose "subprocess" is a closure feeding the channel.
fn scripted_handle<F>(worker: F) -> JobHandle
where
    F: FnOnce(Sender<ProgressEvent>, Arc<AtomicBool>) + Send + 'static,
{
    let (tx, rx) = channel();
    let flag = Arc::new(AtomicBool::new(false));
    let canceller = JobCanceller::detached(Arc::clone(&flag));
    let join = thread::spawn(move || worker(tx, flag));
    JobHandle::from_parts(rx, canceller, join)
}

/// Launcher that records every launch and replays a per-spec script.
struct ScriptedLauncher {
    launches: AtomicUsize,
    specs: Mutex<Vec<JobSpec>>,
    script: Box<dyn Fn(&JobSpec) -> Vec<ProgressEvent> + Send + Sync>,
}

impl ScriptedLauncher {
    fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&JobSpec) -> Vec<ProgressEvent> + Send + Sync + 'static,
    {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
            script: Box::new(script),
        })
    }

    fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl ToolLauncher for ScriptedLauncher {
    fn launch(&self, spec: &JobSpec) -> Result<JobHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec.clone());
        let events = (self.script)(spec);
        Ok(scripted_handle(move |tx, _flag| {
            for event in events {
                let _ = tx.send(event);
            }
        }))
    }
}

#[derive(Default)]
struct Collect(Mutex<Vec<ProgressEvent>>);

impl ProgressSink for Collect {
    fn on_event(&self, event: &ProgressEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

fn wait_for_state(controller: &FlashController, state: ControllerState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while controller.state() != state {
        assert!(Instant::now() < deadline, "never reached {:?}", state);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn oversized_write_never_launches_a_subprocess() {
    let mut source = NamedTempFile::new().unwrap();
    source.write_all(&[0u8; 8]).unwrap();

    let launcher = ScriptedLauncher::new(|_| vec![ProgressEvent::Completed(true)]);
    let controller = FlashController::with_launcher(
        FlasherConfig::default(),
        launcher.clone(),
        no_op_progress_sink(),
    );

    let err = controller.write(source.path(), Some(4)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImageTooLarge);
    assert_eq!(launcher.launch_count(), 0);
    assert_eq!(controller.state(), ControllerState::Done);
}

#[test]
fn probe_refreshes_the_catalog() {
    let launcher = ScriptedLauncher::new(|_| {
        vec![
            ProgressEvent::Message("Calibrating delay loop... OK.".to_string()),
            ProgressEvent::ChipDetected(chip(16384 * 1024)),
            ProgressEvent::Completed(true),
        ]
    });
    let sink = Arc::new(Collect::default());
    let controller = FlashController::with_launcher(
        FlasherConfig::default(),
        launcher.clone(),
        sink.clone(),
    );

    let completion = controller.probe().unwrap();
    let probed = completion.chip.unwrap();
    assert_eq!(probed.identifier(), "WINBOND W25Q128");
    assert_eq!(controller.catalog().capacity_of("WINBOND W25Q128"), Some(16384 * 1024));
    assert_eq!(controller.state(), ControllerState::Done);

    let events = sink.0.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[1], ProgressEvent::ChipDetected(_)));
    assert_eq!(events[2], ProgressEvent::Completed(true));
}

#[test]
fn probe_without_chip_is_chip_not_found() {
    let launcher = ScriptedLauncher::new(|_| vec![ProgressEvent::Completed(true)]);
    let controller = FlashController::with_launcher(
        FlasherConfig::default(),
        launcher,
        no_op_progress_sink(),
    );
    let err = controller.probe().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChipNotFound);
}

#[test]
fn read_unpads_before_persisting() {
    let launcher = ScriptedLauncher::new(|spec: &JobSpec| {
        // Stand in for the tool: dump a padded ROM at the requested path.
        let path = spec.image_path.as_ref().expect("read needs a dump path");
        let mut dump = vec![0x11, 0x22, 0x33, 0x44];
        dump.extend_from_slice(&[0xFF; 4]);
        fs::write(path, &dump).unwrap();
        vec![ProgressEvent::Percent(100), ProgressEvent::Completed(true)]
    });
    let controller = FlashController::with_launcher(
        FlasherConfig::default(),
        launcher,
        no_op_progress_sink(),
    );

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("rom.bin");
    controller.read(&target, Some(4)).unwrap();

    assert_eq!(fs::read(&target).unwrap(), [0x11, 0x22, 0x33, 0x44]);
    assert_eq!(controller.state(), ControllerState::Done);
}

#[test]
fn write_probes_then_pads_to_capacity() {
    let mut source = NamedTempFile::new().unwrap();
    source.write_all(&[0xAB, 0xCD]).unwrap();

    let written: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let written_in_script = written.clone();
    let launcher = ScriptedLauncher::new(move |spec: &JobSpec| match spec.kind {
        JobKind::Probe => vec![
            ProgressEvent::ChipDetected(chip(16)),
            ProgressEvent::Completed(true),
        ],
        JobKind::Write => {
            let path = spec.image_path.as_ref().expect("write needs a source path");
            *written_in_script.lock().unwrap() = Some(fs::read(path).unwrap());
            vec![ProgressEvent::Completed(true)]
        }
        JobKind::Read => panic!("unexpected read"),
    });
    let controller = FlashController::with_launcher(
        FlasherConfig::default(),
        launcher.clone(),
        no_op_progress_sink(),
    );

    controller.write(source.path(), None).unwrap();

    assert_eq!(launcher.launch_count(), 2);
    let specs = launcher.specs.lock().unwrap();
    assert_eq!(specs[0].kind, JobKind::Probe);
    assert_eq!(specs[1].kind, JobKind::Write);
    assert_eq!(specs[1].chip.as_deref(), Some("WINBOND W25Q128"));
    assert_eq!(specs[1].capacity, Some(16));

    let padded = written.lock().unwrap().clone().unwrap();
    assert_eq!(padded.len(), 16);
    assert_eq!(&padded[..2], &[0xAB, 0xCD]);
    assert!(padded[2..].iter().all(|&b| b == 0xFF));
}

/// Launcher whose job stays running until the test releases it.
struct GatedLauncher {
    started: Sender<()>,
    release: Mutex<Option<Receiver<()>>>,
}

impl ToolLauncher for GatedLauncher {
    fn launch(&self, _spec: &JobSpec) -> Result<JobHandle> {
        let started = self.started.clone();
        let release = self
            .release
            .lock()
            .unwrap()
            .take()
            .expect("gated launcher launched twice");
        Ok(scripted_handle(move |tx, _flag| {
            let _ = started.send(());
            let _ = release.recv();
            let _ = tx.send(ProgressEvent::ChipDetected(chip(1024)));
            let _ = tx.send(ProgressEvent::Completed(true));
        }))
    }
}

#[test]
fn concurrent_operation_is_rejected_with_busy() {
    let (started_tx, started_rx) = channel();
    let (release_tx, release_rx) = channel();
    let launcher = Arc::new(GatedLauncher {
        started: started_tx,
        release: Mutex::new(Some(release_rx)),
    });
    let controller = Arc::new(FlashController::with_launcher(
        FlasherConfig::default(),
        launcher,
        no_op_progress_sink(),
    ));

    let first = {
        let controller = controller.clone();
        thread::spawn(move || controller.probe())
    };
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first operation never started");

    // Second operation must be rejected immediately, not queued.
    let err = controller.probe().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    release_tx.send(()).unwrap();
    let completion: Completion = first.join().unwrap().unwrap();
    assert_eq!(completion.chip.unwrap().capacity, 1024);
}

/// Launcher whose job runs until its cancel flag is raised.
struct HangingLauncher;

impl ToolLauncher for HangingLauncher {
    fn launch(&self, _spec: &JobSpec) -> Result<JobHandle> {
        Ok(scripted_handle(|tx, flag| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            let _ = tx.send(ProgressEvent::Failed {
                kind: ErrorKind::Cancelled,
                detail: "cancelled by user".to_string(),
            });
        }))
    }
}

#[test]
fn cancel_mid_run_reaches_a_terminal_state() {
    let controller = Arc::new(FlashController::with_launcher(
        FlasherConfig::default(),
        Arc::new(HangingLauncher),
        no_op_progress_sink(),
    ));

    let running = {
        let controller = controller.clone();
        thread::spawn(move || controller.probe())
    };
    wait_for_state(&controller, ControllerState::Running);

    controller.cancel();
    let err = running.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(controller.state(), ControllerState::Cancelled);
}

/// Launcher that requests cancellation from inside `launch`, landing in the
/// window before the controller has recorded the job's canceller.
struct CancelDuringLaunch {
    controller: OnceLock<Arc<FlashController>>,
}

impl ToolLauncher for CancelDuringLaunch {
    fn launch(&self, _spec: &JobSpec) -> Result<JobHandle> {
        self.controller.get().expect("controller not wired").cancel();
        Ok(scripted_handle(|tx, flag| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            // Only a delivered cancel ends this job early; otherwise it
            // runs out its own clock and claims success.
            let event = if flag.load(Ordering::SeqCst) {
                ProgressEvent::Failed {
                    kind: ErrorKind::Cancelled,
                    detail: "cancelled by user".to_string(),
                }
            } else {
                ProgressEvent::Completed(true)
            };
            let _ = tx.send(event);
        }))
    }
}

#[test]
fn cancel_racing_the_launch_still_reaches_the_job() {
    let launcher = Arc::new(CancelDuringLaunch {
        controller: OnceLock::new(),
    });
    let controller = Arc::new(FlashController::with_launcher(
        FlasherConfig::default(),
        launcher.clone(),
        no_op_progress_sink(),
    ));
    assert!(launcher.controller.set(controller.clone()).is_ok());

    let start = Instant::now();
    let err = controller.probe().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "cancel never reached the job; it ended on its own after {:?}",
        start.elapsed()
    );
    assert_eq!(controller.state(), ControllerState::Cancelled);
}

#[test]
fn cancel_with_no_active_job_goes_straight_to_cancelled() {
    let launcher = ScriptedLauncher::new(|_| vec![ProgressEvent::Completed(true)]);
    let controller = FlashController::with_launcher(
        FlasherConfig::default(),
        launcher,
        no_op_progress_sink(),
    );
    controller.cancel();
    assert_eq!(controller.state(), ControllerState::Cancelled);
}
