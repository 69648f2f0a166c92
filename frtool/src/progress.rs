//! Progress rendering for the CLI.
//!
//! Two sink implementations: an indicatif bar for interactive terminals and
//! a plain percent printer for pipes/CI, picked automatically.

use frtool_lib::{ProgressEvent, ProgressSink, ProgressSinkArc};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex};

/// indicatif-backed sink: one bar tracking the tool's percentage output,
/// created lazily on the first `Percent` event.
pub struct IndicatifProgressSink {
    bar: Mutex<Option<ProgressBar>>,
}

impl IndicatifProgressSink {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl Default for IndicatifProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for IndicatifProgressSink {
    fn on_event(&self, event: &ProgressEvent) {
        let mut bar = self.bar.lock().unwrap();
        match event {
            ProgressEvent::Percent(percent) => {
                let bar = bar.get_or_insert_with(|| {
                    let bar = ProgressBar::new(100);
                    bar.set_style(
                        ProgressStyle::with_template("{msg} {wide_bar} {percent_precise}%")
                            .unwrap_or_else(|_| ProgressStyle::default_bar())
                            .progress_chars("=>-"),
                    );
                    bar.set_message("Transferring");
                    bar
                });
                bar.set_position(u64::from(*percent));
            }
            ProgressEvent::ChipDetected(chip) => {
                let line = format!("Found {} ({} kB)", chip.identifier(), chip.capacity / 1024);
                match bar.as_ref() {
                    Some(bar) => bar.println(line),
                    None => println!("{}", line),
                }
            }
            ProgressEvent::Message(text) => match bar.as_ref() {
                Some(bar) => bar.println(text),
                None => println!("{}", text),
            },
            ProgressEvent::Completed(ok) => {
                if let Some(bar) = bar.take() {
                    if *ok {
                        bar.finish_with_message("Done");
                    } else {
                        bar.abandon_with_message("Failed");
                    }
                }
            }
            ProgressEvent::Failed { detail, .. } => {
                if let Some(bar) = bar.take() {
                    bar.abandon();
                }
                eprintln!("{}", detail);
            }
        }
    }
}

/// Plain percent printer for non-interactive stdout.
pub struct PercentProgressSink {
    last_percent: Mutex<Option<u8>>,
}

impl PercentProgressSink {
    pub fn new() -> Self {
        Self {
            last_percent: Mutex::new(None),
        }
    }

    fn print_line(&self, line: &str) {
        let mut stdout = io::stdout();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }
}

impl ProgressSink for PercentProgressSink {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Percent(percent) => {
                let mut last = self.last_percent.lock().unwrap();
                if *last != Some(*percent) {
                    *last = Some(*percent);
                    self.print_line(&format!("{}%", percent));
                }
            }
            ProgressEvent::ChipDetected(chip) => {
                self.print_line(&format!(
                    "Found {} ({} kB)",
                    chip.identifier(),
                    chip.capacity / 1024
                ));
            }
            ProgressEvent::Message(text) => self.print_line(text),
            ProgressEvent::Completed(true) => {
                let mut last = self.last_percent.lock().unwrap();
                if last.is_some() && *last != Some(100) {
                    *last = Some(100);
                    self.print_line("100%");
                }
            }
            ProgressEvent::Completed(false) => {}
            ProgressEvent::Failed { detail, .. } => eprintln!("{}", detail),
        }
    }
}

/// Terminal-aware sink selection.
pub fn create_progress_sink() -> ProgressSinkArc {
    if io::stdout().is_terminal() {
        Arc::new(IndicatifProgressSink::new())
    } else {
        Arc::new(PercentProgressSink::new())
    }
}
