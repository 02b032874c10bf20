//! The `check` subcommand.

use clap::Args;

use crate::{
    async_utils::io::write_output,
    engines::{BackendId, BackendOpts, RecognitionEngine},
    prelude::*,
    ui::Ui,
};

/// Check command line arguments.
#[derive(Debug, Args)]
pub struct CheckOpts {
    #[clap(flatten)]
    pub backend_opts: BackendOpts,
}

/// Load both backends and report which ones work. Downloads the handwriting
/// model if needed, so a later `ocr` run starts quickly.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_check(ui: Ui, opts: &CheckOpts) -> Result<()> {
    let engine = RecognitionEngine::from_opts(&opts.backend_opts);

    let mut lines = vec![];
    let mut unavailable = 0;
    for backend in BackendId::ALL {
        let sp = ui.new_backend_spinner(backend);
        match engine.warm_up(backend).await {
            Ok(()) => lines.push(format!("{}: ok", backend)),
            Err(err) => {
                unavailable += 1;
                lines.push(format!("{}: {:#}", backend, err));
            }
        }
        sp.finish_using_style();
    }

    write_output(None, &lines.join("\n")).await?;
    if unavailable > 0 {
        bail!(
            "{} of {} backends unavailable",
            unavailable,
            BackendId::ALL.len()
        );
    }
    Ok(())
}
