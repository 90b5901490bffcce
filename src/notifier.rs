//! Unified logging and progress UI for the command-line tool.
//!
//! [`Notifier`] installs `env_logger` and drives `indicatif` spinners/bars
//! under a single verbosity switch:
//! - [`VerbosityLevel::Quiet`] → only warnings are logged; progress is shown
//!   as a live spinner and optional progress bars.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`]
//!   → plain text logs at that level, no bars.
//!
//! `RUST_LOG` still overrides the filter for individual modules.

use std::cell::RefCell;
use std::time::Duration;

use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, LevelFilter};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Progress bars, warnings only
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    pub fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    multi_progress: Option<MultiProgress>,
    active_spinner: RefCell<Option<ProgressBar>>,
}

impl Notifier {
    /// Creates the notifier and installs the global logger. A logger that is
    /// already installed (as in tests) is left alone.
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);

        let _ = env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .try_init();

        let multi_progress = (verbosity == VerbosityLevel::Quiet).then(MultiProgress::new);

        Self {
            verbosity,
            multi_progress,
            active_spinner: RefCell::new(None),
        }
    }

    pub fn info(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            info!("{}", message);
            return;
        }

        if self.active_spinner.borrow().is_none() {
            if let Some(multi_progress) = &self.multi_progress {
                let style = ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner());

                let spinner = multi_progress.add(ProgressBar::new_spinner());
                spinner.set_style(style);
                spinner.enable_steady_tick(Duration::from_millis(100));

                *self.active_spinner.borrow_mut() = Some(spinner);
            }
        }

        if let Some(spinner) = self.active_spinner.borrow().as_ref() {
            spinner.set_message(message.to_string());
        }
    }

    pub fn debug(&self, message: &str) {
        debug!("{}", message);
    }

    /// Adds a progress bar of `length` steps. Only available in Quiet mode.
    pub fn create_progress_bar(&self, length: u64, message: &str) -> Option<ProgressBar> {
        let multi_progress = self.multi_progress.as_ref()?;

        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");

        let progress_bar = multi_progress.add(ProgressBar::new(length));
        progress_bar.set_style(style);
        progress_bar.set_message(message.to_string());
        Some(progress_bar)
    }

    /// Stops the spinner, leaving `message` as its final line.
    pub fn finish(&self, message: &str) {
        match self.active_spinner.borrow_mut().take() {
            Some(spinner) => spinner.finish_with_message(message.to_string()),
            None => info!("{}", message),
        }
    }

    pub fn use_progress_bars(&self) -> bool {
        self.verbosity == VerbosityLevel::Quiet
    }

    pub fn verbosity_level(&self) -> VerbosityLevel {
        self.verbosity
    }
}
