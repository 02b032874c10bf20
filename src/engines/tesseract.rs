//! Printed-text recognition with the `tesseract` CLI tool.

use image::{ImageFormat, RgbImage};
use tokio::process::Command;

use super::Recognizer;
use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics, spawn_error},
    prelude::*,
};

/// Tesseract's TSV `level` for individual words.
const WORD_LEVEL: u32 = 5;

/// OCR backend wrapping the `tesseract` CLI tool.
#[derive(Debug)]
pub struct TesseractRecognizer {
    /// Languages, as passed to `-l` (`eng`, `eng+deu`).
    lang: String,
    /// Words below this confidence are dropped.
    min_confidence: f32,
}

impl TesseractRecognizer {
    /// Make sure `tesseract` runs and has our languages installed.
    #[instrument(level = "debug", skip_all, fields(lang = %lang))]
    pub async fn load(lang: String, min_confidence: f32) -> Result<Self> {
        let output = Command::new("tesseract")
            .arg("--version")
            .output()
            .await
            .map_err(|err| spawn_error("tesseract", "tesseract-ocr", err))?;
        check_for_command_failure("tesseract", &output, None)?;
        // Older releases print their version on stderr.
        let version = [&output.stdout, &output.stderr]
            .into_iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .find_map(|text| text.lines().next().map(str::to_owned).filter(|l| !l.is_empty()))
            .unwrap_or_default();

        let output = Command::new("tesseract")
            .arg("--list-langs")
            .output()
            .await
            .map_err(|err| spawn_error("tesseract", "tesseract-ocr", err))?;
        check_for_command_failure("tesseract", &output, None)?;
        let available = parse_list_langs(&String::from_utf8_lossy(&output.stdout));
        for wanted in lang.split('+') {
            if !available.iter().any(|l| l == wanted) {
                bail!(
                    "tesseract language {:?} is not installed (available: {})",
                    wanted,
                    available.join(", ")
                );
            }
        }

        info!(version = %version, "Found tesseract");
        Ok(Self {
            lang,
            min_confidence,
        })
    }
}

#[async_trait]
impl Recognizer for TesseractRecognizer {
    async fn recognize(&self, image: &RgbImage) -> Result<String> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("page.png");
        let image = image.clone();
        let path = input_path.clone();
        spawn_blocking_propagating_panics(move || {
            image
                .save_with_format(&path, ImageFormat::Png)
                .context("cannot write tesseract input file")
        })
        .await?;

        let output = Command::new("tesseract")
            .arg(&input_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang)
            .arg("tsv")
            .output()
            .await
            .map_err(|err| spawn_error("tesseract", "tesseract-ocr", err))?;
        check_for_command_failure("tesseract", &output, None)?;

        let words = parse_tsv(&output.stdout, self.min_confidence)?;
        Ok(words.join(" "))
    }
}

/// Parse `tesseract --list-langs`, skipping its header line.
fn parse_list_langs(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of"))
        .map(str::to_owned)
        .collect()
}

/// One row of Tesseract's TSV output. We only need a few columns.
#[derive(Debug, Deserialize)]
struct TsvRow {
    level: u32,
    conf: f32,
    #[serde(default)]
    text: String,
}

/// Extract confident, non-blank words, in Tesseract's reading order.
fn parse_tsv(tsv: &[u8], min_confidence: f32) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .from_reader(tsv);
    let mut words = vec![];
    for row in reader.deserialize::<TsvRow>() {
        let row = row.context("cannot parse tesseract TSV output")?;
        let text = row.text.trim();
        if row.level == WORD_LEVEL && row.conf >= min_confidence && !text.is_empty() {
            words.push(text.to_owned());
        }
    }
    Ok(words)
}
