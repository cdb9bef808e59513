//! Terminal feedback for `vigil_scan`: stage spinners and a frame counter.
//!
//! Pretty output needs a TTY; otherwise every stage prints one plain line
//! to stderr so logs stay readable when piped.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    pub fn parse(flag: Option<&str>) -> Self {
        match flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    /// Machine-readable output requested; never draw.
    quiet: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, quiet: bool) -> Self {
        Self { mode, is_tty, quiet }
    }

    fn pretty(&self) -> bool {
        !self.quiet
            && self.is_tty
            && match self.mode {
                UiMode::Pretty | UiMode::Auto => true,
                UiMode::Plain => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner), false)
        } else {
            if !self.quiet {
                eprintln!("==> {}", name);
            }
            StageGuard::new(name.to_string(), None, self.quiet)
        }
    }

    /// Frame counter for a run of `total` frames (unknown when `None`).
    pub fn frames(&self, total: Option<u64>) -> FrameProgress {
        if !self.pretty() {
            return FrameProgress { bar: None };
        }
        let bar = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        bar.set_draw_target(ProgressDrawTarget::stderr());
        let template = if total.is_some() {
            "{bar:32} {pos}/{len} frames ({per_sec})"
        } else {
            "{spinner} {pos} frames ({per_sec})"
        };
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        FrameProgress { bar: Some(bar) }
    }
}

/// Prints the stage with its duration when dropped.
pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    quiet: bool,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>, quiet: bool) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            quiet,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else if !self.quiet {
            eprintln!("{message}");
        }
    }
}

/// Cheap to clone; clones share one bar.
#[derive(Clone)]
pub struct FrameProgress {
    bar: Option<ProgressBar>,
}

impl FrameProgress {
    pub fn set(&self, done: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(done);
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
