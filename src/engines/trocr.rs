//! Handwriting recognition with a TrOCR encoder-decoder, exported to ONNX.

use std::sync::Arc;

use image::{RgbImage, imageops::FilterType};
use ndarray::{Array2, Array3, Array4, Axis};
use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    value::TensorRef,
};
use parking_lot::Mutex;
use tokenizers::Tokenizer;

use super::{
    Recognizer,
    beam::{self, SearchParams, StepScorer},
};
use crate::{async_utils::spawn_blocking_propagating_panics, prelude::*};

/// Token ids used by the original TrOCR checkpoints, if the model doesn't say.
const DEFAULT_DECODER_START_TOKEN_ID: i64 = 2;
const DEFAULT_EOS_TOKEN_ID: i64 = 2;

/// Decoding settings chosen by the user.
#[derive(Debug, Clone, Copy)]
pub struct TrocrConfig {
    pub num_beams: usize,
    pub max_length: usize,
}

/// Token ids from `generation_config.json` or `config.json`.
#[derive(Debug, Default, Deserialize)]
struct TokenConfig {
    decoder_start_token_id: Option<i64>,
    eos_token_id: Option<OneOrMany>,
    /// Nested decoder config, as found in `config.json`.
    decoder: Option<Box<TokenConfig>>,
}

/// Some configs list several EOS tokens. We use the first.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(i64),
    Many(Vec<i64>),
}

impl OneOrMany {
    fn first(&self) -> Option<i64> {
        match self {
            OneOrMany::One(id) => Some(*id),
            OneOrMany::Many(ids) => ids.first().copied(),
        }
    }
}

impl TokenConfig {
    fn decoder_start(&self) -> Option<i64> {
        self.decoder_start_token_id
            .or_else(|| self.decoder.as_ref().and_then(|d| d.decoder_start()))
    }

    fn eos(&self) -> Option<i64> {
        self.eos_token_id
            .as_ref()
            .and_then(OneOrMany::first)
            .or_else(|| self.decoder.as_ref().and_then(|d| d.eos()))
    }
}

/// Image size from `preprocessor_config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum ImageSize {
    HeightWidth { height: u32, width: u32 },
    ShortestEdge { shortest_edge: u32 },
    Square(u32),
}

impl ImageSize {
    fn dimensions(self) -> (u32, u32) {
        match self {
            ImageSize::HeightWidth { height, width } => (width, height),
            ImageSize::ShortestEdge { shortest_edge: edge } | ImageSize::Square(edge) => {
                (edge, edge)
            }
        }
    }
}

/// How to turn a page into pixel values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
struct PreprocessorConfig {
    do_resize: bool,
    size: ImageSize,
    do_rescale: bool,
    rescale_factor: f32,
    do_normalize: bool,
    image_mean: [f32; 3],
    image_std: [f32; 3],
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: ImageSize::HeightWidth {
                height: 384,
                width: 384,
            },
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: [0.5; 3],
            image_std: [0.5; 3],
        }
    }
}

/// Convert an image to a `[1, 3, height, width]` tensor.
fn preprocess(image: &RgbImage, config: &PreprocessorConfig) -> Array4<f32> {
    let resized;
    let image = if config.do_resize {
        let (width, height) = config.size.dimensions();
        resized = image::imageops::resize(image, width, height, FilterType::Triangle);
        &resized
    } else {
        image
    };
    let (width, height) = image.dimensions();
    Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, channel, y, x)| {
            let mut value = f32::from(image.get_pixel(x as u32, y as u32)[channel]);
            if config.do_rescale {
                value *= config.rescale_factor;
            }
            if config.do_normalize {
                value = (value - config.image_mean[channel]) / config.image_std[channel];
            }
            value
        },
    )
}

/// Read a JSON file that a model may or may not ship.
fn read_optional_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path).with_context(|| format!("failed to read {:?}", path.display()))?;
    let value = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {:?}", path.display()))?;
    Ok(Some(value))
}

/// Find an ONNX file either in the model directory or in its `onnx/`
/// subdirectory.
fn find_onnx_file(model_dir: &Path, name: &str) -> Result<PathBuf> {
    [model_dir.join(name), model_dir.join("onnx").join(name)]
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| anyhow!("cannot find {} in {:?}", name, model_dir.display()))
}

fn build_session(path: &Path) -> Result<Session> {
    debug!(path = %path.display(), "Loading ONNX model");
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(num_cpus::get_physical().max(1))?
        .commit_from_file(path)
        .with_context(|| format!("failed to load ONNX model {:?}", path.display()))?;
    Ok(session)
}

/// A loaded TrOCR model.
pub struct TrocrRecognizer {
    inner: Arc<TrocrInner>,
}

struct TrocrInner {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    tokenizer: Tokenizer,
    preprocessor: PreprocessorConfig,
    search: SearchParams,
}

impl TrocrRecognizer {
    /// Load a model from a directory.
    #[instrument(level = "debug", skip_all, fields(model_dir = %model_dir.display()))]
    pub async fn load(model_dir: PathBuf, config: TrocrConfig) -> Result<Self> {
        spawn_blocking_propagating_panics(move || Self::load_blocking(&model_dir, config)).await
    }

    fn load_blocking(model_dir: &Path, config: TrocrConfig) -> Result<Self> {
        let encoder = build_session(&find_onnx_file(model_dir, "encoder_model.onnx")?)?;
        let decoder = build_session(&find_onnx_file(model_dir, "decoder_model.onnx")?)?;

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|err| {
            anyhow!("failed to load tokenizer {:?}: {}", tokenizer_path.display(), err)
        })?;

        let generation = read_optional_json::<TokenConfig>(&model_dir.join("generation_config.json"))?
            .unwrap_or_default();
        let model = read_optional_json::<TokenConfig>(&model_dir.join("config.json"))?
            .unwrap_or_default();
        let preprocessor =
            read_optional_json::<PreprocessorConfig>(&model_dir.join("preprocessor_config.json"))?
                .unwrap_or_default();

        let search = search_params(config, &generation, &model);
        info!(
            num_beams = search.num_beams,
            max_length = search.max_length,
            eos = search.eos_token_id,
            "Loaded handwriting model"
        );
        Ok(Self {
            inner: Arc::new(TrocrInner {
                encoder: Mutex::new(encoder),
                decoder: Mutex::new(decoder),
                tokenizer,
                preprocessor,
                search,
            }),
        })
    }
}

/// Combine user settings with the model's own token ids.
fn search_params(config: TrocrConfig, generation: &TokenConfig, model: &TokenConfig) -> SearchParams {
    SearchParams {
        num_beams: config.num_beams.max(1),
        max_length: config.max_length,
        decoder_start_token_id: generation
            .decoder_start()
            .or_else(|| model.decoder_start())
            .unwrap_or(DEFAULT_DECODER_START_TOKEN_ID),
        eos_token_id: generation
            .eos()
            .or_else(|| model.eos())
            .unwrap_or(DEFAULT_EOS_TOKEN_ID),
        length_penalty: 1.0,
        early_stopping: true,
    }
}

#[async_trait]
impl Recognizer for TrocrRecognizer {
    async fn recognize(&self, image: &RgbImage) -> Result<String> {
        let inner = self.inner.clone();
        let image = image.clone();
        spawn_blocking_propagating_panics(move || inner.recognize_blocking(&image)).await
    }
}

impl TrocrInner {
    fn recognize_blocking(&self, image: &RgbImage) -> Result<String> {
        let pixels = preprocess(image, &self.preprocessor);
        let hidden_states = self.encode(&pixels)?;

        let mut decoder = self.decoder.lock();
        let mut scorer = DecoderScorer {
            session: &mut decoder,
            encoder_hidden_states: &hidden_states,
        };
        let tokens = beam::generate(&mut scorer, &self.search)?;
        trace!(?tokens, "Generated tokens");

        let ids = tokens
            .iter()
            .map(|&id| u32::try_from(id).context("token id out of range"))
            .collect::<Result<Vec<_>>>()?;
        let text = self
            .tokenizer
            .decode(&ids, true)
            .map_err(|err| anyhow!("failed to decode tokens: {}", err))?;
        Ok(text.trim().to_owned())
    }

    /// Run the vision encoder, returning `[1, patches, hidden]`.
    fn encode(&self, pixels: &Array4<f32>) -> Result<Array3<f32>> {
        let mut encoder = self.encoder.lock();
        let outputs = encoder.run(ort::inputs![
            "pixel_values" => TensorRef::from_array_view(pixels.view())?
        ])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        if shape.len() != 3 {
            bail!("encoder returned shape {:?}, expected 3 dimensions", &shape[..]);
        }
        let dims = (shape[0] as usize, shape[1] as usize, shape[2] as usize);
        Ok(Array3::from_shape_vec(dims, data.to_vec())?)
    }
}

/// Runs the decoder over the whole prefix at each step.
struct DecoderScorer<'a> {
    session: &'a mut Session,
    encoder_hidden_states: &'a Array3<f32>,
}

impl StepScorer for DecoderScorer<'_> {
    fn next_logits(&mut self, sequences: &[Vec<i64>]) -> Result<Vec<Vec<f32>>> {
        let batch = sequences.len();
        let len = sequences.first().map(Vec::len).unwrap_or(0);
        if batch == 0 || len == 0 || sequences.iter().any(|s| s.len() != len) {
            bail!("decoder needs a non-empty batch of equal-length sequences");
        }
        let input_ids = Array2::from_shape_fn((batch, len), |(b, t)| sequences[b][t]);

        let encoder_states = self.encoder_hidden_states.index_axis(Axis(0), 0);
        let (patches, hidden) = encoder_states.dim();
        let encoder_states = encoder_states
            .broadcast((batch, patches, hidden))
            .ok_or_else(|| anyhow!("cannot broadcast encoder output to batch {}", batch))?
            .to_owned();

        let outputs = self.session.run(ort::inputs![
            "input_ids" => TensorRef::from_array_view(input_ids.view())?,
            "encoder_hidden_states" => TensorRef::from_array_view(encoder_states.view())?
        ])?;
        let (shape, logits) = outputs["logits"].try_extract_tensor::<f32>()?;
        if shape.len() != 3 || shape[0] as usize != batch || shape[1] as usize != len {
            bail!(
                "decoder returned logits of shape {:?} for {} sequences of length {}",
                &shape[..],
                batch,
                len
            );
        }
        let vocab = shape[2] as usize;
        Ok((0..batch)
            .map(|b| {
                let start = (b * len + len - 1) * vocab;
                logits[start..start + vocab].to_vec()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn preprocess_resizes_and_normalizes() {
        let image = RgbImage::from_pixel(10, 20, Rgb([255, 0, 127]));
        let tensor = preprocess(&image, &PreprocessorConfig::default());
        assert_eq!(tensor.shape(), &[1, 3, 384, 384]);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 0.01);
        assert!((tensor[[0, 1, 100, 100]] + 1.0).abs() < 0.01);
        assert!(tensor[[0, 2, 383, 383]].abs() < 0.01);
    }

    #[test]
    fn preprocess_leaves_the_page_alone() {
        let image = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        let before = image.clone();
        preprocess(&image, &PreprocessorConfig::default());
        assert_eq!(image, before);
    }

    #[test]
    fn preprocessor_config_accepts_hub_layouts() -> Result<()> {
        let config: PreprocessorConfig = serde_json::from_str(
            r#"{
                "do_normalize": true,
                "do_resize": true,
                "image_mean": [0.5, 0.5, 0.5],
                "image_std": [0.5, 0.5, 0.5],
                "resample": 2,
                "size": 384
            }"#,
        )?;
        assert_eq!(config.size.dimensions(), (384, 384));
        assert_eq!(config.rescale_factor, 1.0 / 255.0);

        let config: PreprocessorConfig =
            serde_json::from_str(r#"{"size": {"height": 64, "width": 128}}"#)?;
        assert_eq!(config.size.dimensions(), (128, 64));
        Ok(())
    }

    #[test]
    fn token_ids_come_from_generation_config_then_model_config() -> Result<()> {
        let generation: TokenConfig =
            serde_json::from_str(r#"{"decoder_start_token_id": 7, "eos_token_id": [9, 10]}"#)?;
        let model: TokenConfig = serde_json::from_str(
            r#"{"decoder": {"decoder_start_token_id": 3, "eos_token_id": 4}}"#,
        )?;
        let config = TrocrConfig {
            num_beams: 4,
            max_length: 128,
        };

        let params = search_params(config, &generation, &model);
        assert_eq!(params.decoder_start_token_id, 7);
        assert_eq!(params.eos_token_id, 9);

        let params = search_params(config, &TokenConfig::default(), &model);
        assert_eq!(params.decoder_start_token_id, 3);
        assert_eq!(params.eos_token_id, 4);

        let params = search_params(config, &TokenConfig::default(), &TokenConfig::default());
        assert_eq!(params.decoder_start_token_id, DEFAULT_DECODER_START_TOKEN_ID);
        assert_eq!(params.eos_token_id, DEFAULT_EOS_TOKEN_ID);
        assert_eq!(params.num_beams, 4);
        assert_eq!(params.max_length, 128);
        Ok(())
    }

    #[test]
    fn missing_model_files_are_reported() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let err = find_onnx_file(dir.path(), "encoder_model.onnx").unwrap_err();
        assert!(err.to_string().contains("encoder_model.onnx"));

        std::fs::create_dir(dir.path().join("onnx"))?;
        std::fs::write(dir.path().join("onnx/encoder_model.onnx"), b"")?;
        assert_eq!(
            find_onnx_file(dir.path(), "encoder_model.onnx")?,
            dir.path().join("onnx/encoder_model.onnx")
        );
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires TrOCR model weights (set DUAL_OCR_TEST_TROCR_DIR)"]
    async fn recognizes_handwriting_deterministically() -> Result<()> {
        let dir = PathBuf::from(std::env::var("DUAL_OCR_TEST_TROCR_DIR")?);
        let config = TrocrConfig {
            num_beams: 4,
            max_length: 32,
        };
        let recognizer = TrocrRecognizer::load(dir, config).await?;
        let image = RgbImage::from_pixel(200, 64, Rgb([255, 255, 255]));
        let first = recognizer.recognize(&image).await?;
        let second = recognizer.recognize(&image).await?;
        assert_eq!(first, second);
        Ok(())
    }
}
