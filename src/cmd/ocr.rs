//! The `ocr` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    annotate::{AnnotateOpts, Annotator},
    artifact::UploadedArtifact,
    async_utils::io::write_output,
    engines::{BackendOpts, RecognitionEngine},
    page_source::PageSourceOptions,
    pipeline::{FailurePolicy, Pipeline},
    prelude::*,
    presenter::{OutputFormat, Presenter, ViewState},
    ui::Ui,
};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Image or PDF to read.
    pub input_path: PathBuf,

    /// Declared media type of the input, like `image/png`. Guessed from the
    /// file name or contents if not given.
    #[clap(long, value_name = "MIME")]
    pub media_type: Option<String>,

    /// Output format.
    #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Output file. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Keep going when a backend fails on a page, marking that entry as
    /// failed instead of stopping.
    #[clap(long)]
    pub keep_going: bool,

    #[clap(flatten)]
    pub page_opts: PageSourceOptions,

    #[clap(flatten)]
    pub backend_opts: BackendOpts,

    #[clap(flatten)]
    pub annotate_opts: AnnotateOpts,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all, fields(input = %opts.input_path.display()))]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let artifact =
        UploadedArtifact::from_path(&opts.input_path, opts.media_type.as_deref()).await?;

    let engine = Arc::new(RecognitionEngine::from_opts(&opts.backend_opts));
    let policy = if opts.keep_going {
        FailurePolicy::Mark
    } else {
        FailurePolicy::Abort
    };
    let mut pipeline = Pipeline::new(engine, opts.page_opts.clone(), policy);
    if let Some(annotator) = Annotator::from_opts(&opts.annotate_opts)? {
        pipeline = pipeline.with_annotator(annotator);
    }

    let pb = ui.new_page_progress(&artifact.name);
    let mut presenter = Presenter::new();
    let outcome = presenter.present(&pipeline, &artifact, &pb).await;
    pb.finish_using_style();
    if let ViewState::Showing(report) = presenter.state()
        && report.has_failures()
    {
        warn!("Some pages could not be read; see the failure markers in the report");
    }

    // Failed runs are rendered too, so `--format json` always writes JSON.
    let rendered = presenter.render(opts.format)?;
    write_output(opts.output_path.as_deref(), &rendered).await?;
    outcome
}
