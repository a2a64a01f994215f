//! Progress display for long-running steps and phase container output

use super::context::UiContext;
use crate::lifecycle::{OutputSink, Phase};
use console::style;
use std::sync::{Arc, Mutex};

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }
}

/// Echoes phase container output, with a header whenever the phase changes
pub struct PhaseOutput {
    ctx: UiContext,
    current: Mutex<Option<Phase>>,
}

impl PhaseOutput {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            ctx: ctx.clone(),
            current: Mutex::new(None),
        }
    }

    /// Print one output line
    pub fn line(&self, phase: Phase, line: &str) {
        if !self.ctx.show_output() {
            return;
        }
        if let Ok(mut current) = self.current.lock() {
            if *current != Some(phase) {
                super::section(&self.ctx, phase.slug());
                *current = Some(phase);
            }
        }
        println!("{} {}", style(format!("[{}]", phase)).dim(), line);
    }

    /// Sink handing every container line to [`PhaseOutput::line`]
    pub fn into_sink(self) -> OutputSink {
        let output = Arc::new(self);
        Arc::new(move |phase, line| output.line(phase, line))
    }
}
