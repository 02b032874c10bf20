//! Application UI. For now, this is mostly progress bars.
//!
//! This is adapted from `substudy` by Eric Kidd, which is licensed under
//! Apache-2.0 OR MIT. Used with permission.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::engines::BackendId;

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    /// Our progress bars.
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI. This sets up logging and and progress bars.
    pub fn init() -> Ui {
        let multi_progress = Arc::new(MultiProgress::new());
        Ui { multi_progress }
    }

    /// Create a new UI for unit tests.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        let multi_progress =
            Arc::new(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()));
        Ui { multi_progress }
    }

    /// Hide all our progress bars completely, for when we're writing actual
    /// output to `stdout`.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// Get a writer than can be used to write to stderr, for use with `tracing`
    /// and other output code.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Get a reference to our progress bars.
    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi_progress
    }

    /// Create a progress bar counting (page, backend) steps. The length is
    /// set by the pipeline, once it knows how many pages there are.
    pub fn new_page_progress(&self, name: &str) -> ProgressBar {
        let msg = format!("Reading {}", name);
        let done_msg = format!("Read {}", name);
        self.add_bar(
            ProgressBar::new(0).with_style(default_progress_style()),
            &ProgressConfig {
                emoji: "📄",
                msg: &msg,
                done_msg: &done_msg,
            },
        )
    }

    /// Create a spinner for loading one backend.
    pub fn new_backend_spinner(&self, backend: BackendId) -> ProgressBar {
        let msg = format!("Loading {} backend", backend);
        let done_msg = format!("Checked {} backend", backend);
        self.add_bar(
            ProgressBar::new_spinner().with_style(default_spinner_style()),
            &ProgressConfig {
                emoji: "🔧",
                msg: &msg,
                done_msg: &done_msg,
            },
        )
    }

    /// Register a bar with our [`MultiProgress`] and apply `config`.
    fn add_bar(&self, bar: ProgressBar, config: &ProgressConfig<'_>) -> ProgressBar {
        let bar = self.multi_progress.add(bar);
        #[cfg(test)]
        bar.set_draw_target(ProgressDrawTarget::hidden());
        bar.set_prefix(config.emoji.to_owned());
        bar.set_message(config.msg.to_owned());
        bar.enable_steady_tick(Duration::from_millis(250));
        bar.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }
}

/// Configuration for a progress bar.
struct ProgressConfig<'a> {
    /// Emoji to display in the progress bar.
    emoji: &'a str,
    /// Message to display in a running progress bar.
    msg: &'a str,
    /// Message to display in a progress bar when it is done.
    done_msg: &'a str,
}

fn default_progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{msg:25} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}")
        .expect("bad progress bar template")
}

fn default_spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {prefix:3}{msg}")
        .expect("bad progress bar template")
}

/// A writer which can used to write to `stderr`. It will hide and show progress
/// bars as needed, so that they don't interfere with the output.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

// The `tracing-indicatif` crate suggests that we should implement the following
// methods.
impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress().suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress().suspend(|| io::stderr().flush())
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_vectored(bufs))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_all(buf))
    }

    fn write_fmt(&mut self, fmt: std::fmt::Arguments<'_>) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_fmt(fmt))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_progress_starts_empty() {
        let ui = Ui::init_for_tests();
        let pb = ui.new_page_progress("scan.pdf");
        assert_eq!(pb.length(), Some(0));
        pb.set_length(4);
        pb.inc(2);
        assert_eq!(pb.position(), 2);
        assert_eq!(pb.message(), "Reading scan.pdf");
    }
}
