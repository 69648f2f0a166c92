//! Core library behind a front-end for external command-line flashing
//! utilities (flashrom and compatible tools).
//!
//! The library never talks to hardware itself. It launches the external
//! tool as a subprocess, streams and classifies its textual output into
//! [`ProgressEvent`]s, transforms ROM images (padding to a chip capacity
//! before a write, truncating after a read) and exposes the whole thing to
//! a front-end through [`FlashController`] plus a [`ProgressSink`]
//! subscription.

pub mod catalog;
pub mod controller;
pub mod error;
pub mod image;
pub mod job;
pub mod parser;
pub mod progress;
pub mod util;

pub use catalog::{ChipCatalog, ChipInfo};
pub use controller::{Completion, ControllerState, FlashController};
pub use error::{Error, ErrorKind, Result};
pub use job::{FlashromLauncher, JobHandle, JobKind, JobOutcome, JobSpec, ToolLauncher};
pub use parser::{Dialect, OutputParser};
pub use progress::{
    NoOpProgressSink, ProgressEvent, ProgressSink, ProgressSinkArc, no_op_progress_sink,
};

use std::time::Duration;

/// Static configuration for a controller: which tool to run and how.
///
/// Passed in at construction — there is no ambient "currently selected
/// programmer"; a front-end that lets the user switch programmers builds a
/// new controller.
#[derive(Debug, Clone)]
pub struct FlasherConfig {
    /// Executable name (searched on `PATH`) or explicit path.
    pub tool: String,
    /// Programmer/interface selection forwarded to the tool.
    pub programmer: Option<String>,
    /// Preselected chip identifier, for setups where probing is ambiguous.
    pub chip: Option<String>,
    /// How long a cancelled subprocess gets to exit after the graceful
    /// signal before it is forcibly killed.
    pub kill_grace: Duration,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            tool: "flashrom".to_string(),
            programmer: None,
            chip: None,
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl FlasherConfig {
    pub fn with_programmer(mut self, programmer: impl Into<String>) -> Self {
        self.programmer = Some(programmer.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    pub fn with_chip(mut self, chip: impl Into<String>) -> Self {
        self.chip = Some(chip.into());
        self
    }
}
