use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Stderr spinner shown while a checkpoint loads and exports. A hidden
/// spinner is used when output is quiet so call sites stay unconditional.
pub struct Progress {
    spinner: ProgressBar,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        let spinner = if enabled {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            spinner.set_style(style);
        }
        Self { spinner }
    }

    pub fn start(&self, message: impl Into<String>) {
        self.spinner.set_message(message.into());
        self.spinner.enable_steady_tick(Duration::from_millis(100));
    }

    pub fn stop_and_clear(&self) {
        self.spinner.finish_and_clear();
    }
}
