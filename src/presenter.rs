//! What the user sees: an explicit state machine around one pipeline run.
//!
//! `Idle -> Loading -> Showing | Failed`, and from either final state back to
//! `Loading` for the next upload. The pipeline never knows we exist.

use std::fmt;

use clap::ValueEnum;
use indicatif::ProgressBar;

use crate::{artifact::UploadedArtifact, pipeline::Pipeline, prelude::*, report::Report};

/// How to render a finished report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// JSON, matching the output of the `schema` subcommand.
    Json,
}

/// The current view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ViewState {
    /// Nothing uploaded yet.
    #[default]
    Idle,
    /// Processing an upload.
    Loading { name: String },
    /// A report is ready.
    Showing(Report),
    /// The last run failed. Holds a user-facing message.
    Failed { message: String },
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewState::Idle => f.write_str("idle"),
            ViewState::Loading { name } => write!(f, "processing {}", name),
            ViewState::Showing(report) => write!(f, "showing {} page(s)", report.pages.len()),
            ViewState::Failed { message } => write!(f, "failed: {}", message),
        }
    }
}

/// Drives the view state for a sequence of uploads.
#[derive(Debug, Default)]
pub struct Presenter {
    state: ViewState,
}

impl Presenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    fn transition(&mut self, next: ViewState) {
        debug!(from = %self.state, to = %next, "View state changed");
        self.state = next;
    }

    /// Enter `Loading`. Only one upload may be in flight.
    pub fn start(&mut self, artifact: &UploadedArtifact) -> Result<()> {
        if let ViewState::Loading { name } = &self.state {
            bail!("already processing {}", name);
        }
        self.transition(ViewState::Loading {
            name: artifact.name.clone(),
        });
        Ok(())
    }

    /// Leave `Loading` with the outcome of a run. Errors are recorded, then
    /// handed back to the caller unchanged.
    pub fn finish(&mut self, outcome: Result<Report>) -> Result<()> {
        if !matches!(self.state, ViewState::Loading { .. }) {
            bail!("cannot finish a run from state {}", self.state);
        }
        match outcome {
            Ok(report) => {
                self.transition(ViewState::Showing(report));
                Ok(())
            }
            Err(err) => {
                self.transition(ViewState::Failed {
                    message: format!("{:#}", err),
                });
                Err(err)
            }
        }
    }

    /// Run one upload through `pipeline`, updating our state as we go.
    #[instrument(level = "debug", skip_all, fields(name = %artifact.name))]
    pub async fn present(
        &mut self,
        pipeline: &Pipeline,
        artifact: &UploadedArtifact,
        progress: &ProgressBar,
    ) -> Result<()> {
        self.start(artifact)?;
        let outcome = pipeline.run(artifact, progress).await;
        self.finish(outcome)
    }

    /// Render a finished run, successful or not.
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match (&self.state, format) {
            (ViewState::Showing(report), OutputFormat::Text) => Ok(report.to_string()),
            (ViewState::Showing(report), OutputFormat::Json) => {
                serde_json::to_string_pretty(report).context("failed to serialize report")
            }
            (ViewState::Failed { message }, OutputFormat::Text) => Ok(format!("Error: {}", message)),
            (ViewState::Failed { message }, OutputFormat::Json) => {
                Ok(serde_json::json!({ "error": message }).to_string())
            }
            (ViewState::Idle | ViewState::Loading { .. }, _) => {
                bail!("nothing to render while {}", self.state)
            }
        }
    }
}
