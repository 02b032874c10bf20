use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod annotate;
mod artifact;
mod async_utils;
mod cmd;
mod engines;
mod errors;
mod model_source;
mod page_source;
mod pipeline;
mod prelude;
mod presenter;
mod report;
mod ui;

/// OCR images and PDFs with a handwriting model and a printed-text engine.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - DUAL_OCR_HANDWRITING_MODEL (optional): Handwriting model directory or
    Hugging Face repository id.
  - DUAL_OCR_TESSERACT_LANG (optional): Tesseract language(s).
  - DUAL_OCR_CACHE_DIR (optional): Where downloaded models are kept.
  - DUAL_OCR_OFFLINE (optional): Never download models.
  - HF_ENDPOINT (optional): Override the Hugging Face hub URL.
  - RUST_LOG (optional): Logging filter, like `debug` or `dual_ocr=trace`.

  These variables may be set in a standard `.env` file.

External tools:
  - `pdfinfo` and `pdftocairo` (poppler-utils) for PDF input.
  - `tesseract` (tesseract-ocr) for printed text.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Read the text in an image or PDF, with both backends.
    Ocr(cmd::ocr::OcrOpts),
    /// Load both backends and report whether they work.
    Check(cmd::check::CheckOpts),
    /// Print the JSON Schema for `ocr --format json` output.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Ocr(opts) => opts.output_path.is_none(),
            Cmd::Check(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Ocr(opts) => {
            cmd::ocr::cmd_ocr(ui, opts).await?;
        }
        Cmd::Check(opts) => {
            cmd::check::cmd_check(ui, opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
