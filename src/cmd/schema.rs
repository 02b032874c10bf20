//! The `schema` subcommand.

use clap::Args;
use schemars::schema_for;

use crate::{async_utils::io::write_output, prelude::*, report::Report};

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand. Prints the JSON Schema for `ocr --format json`.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = schema_for!(Report);
    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    write_output(schema_opts.output_path.as_deref(), &schema_str).await
}
