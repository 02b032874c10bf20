//! OCR backends, and the engine that owns them.
//!
//! Each backend implements [`Recognizer`]: it takes an RGB bitmap and returns
//! text. [`RecognitionEngine`] holds one loader per [`BackendId`] and runs
//! each loader at most once per process. A failed load is remembered, so a
//! broken backend stays broken until the process restarts.

use std::{fmt, sync::Arc};

use clap::{Args, ValueEnum};
use image::RgbImage;
use tokio::sync::OnceCell;

use crate::{
    async_utils::BoxedFuture, model_source::ModelLocator, page_source::PageImage, prelude::*,
};

pub mod beam;
pub mod tesseract;
pub mod trocr;

/// Which backend to run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum BackendId {
    /// Sequence-to-sequence handwriting model.
    Handwriting,
    /// Printed text detector and recognizer.
    Printed,
}

impl BackendId {
    /// Every backend, in the order the pipeline runs them.
    pub const ALL: [BackendId; 2] = [BackendId::Handwriting, BackendId::Printed];
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendId::Handwriting => f.write_str("handwriting"),
            BackendId::Printed => f.write_str("printed"),
        }
    }
}

/// Text read from one page by one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    pub backend: BackendId,
    /// Empty if nothing was found.
    pub text: String,
}

/// Interface to a loaded OCR backend.
#[async_trait]
pub trait Recognizer: Send + Sync + 'static {
    /// Read the text in an image. Must not modify the image.
    async fn recognize(&self, image: &RgbImage) -> Result<String>;
}

/// Something that can load a backend. Called at most once.
pub type BackendLoader =
    Box<dyn Fn() -> BoxedFuture<Result<Arc<dyn Recognizer>>> + Send + Sync>;

/// A backend which is loaded on first use.
struct BackendSlot {
    id: BackendId,
    loader: BackendLoader,
    /// The outcome of our one load attempt. Errors are kept as strings so we
    /// can hand them out again.
    loaded: OnceCell<Result<Arc<dyn Recognizer>, String>>,
}

impl BackendSlot {
    fn new(id: BackendId, loader: BackendLoader) -> Self {
        Self {
            id,
            loader,
            loaded: OnceCell::new(),
        }
    }

    /// Get the backend, loading it if this is the first call.
    async fn get(&self) -> Result<Arc<dyn Recognizer>> {
        let loaded = self
            .loaded
            .get_or_init(|| async {
                info!(backend = %self.id, "Loading backend");
                match (self.loader)().await {
                    Ok(recognizer) => Ok(recognizer),
                    Err(err) => {
                        error!(backend = %self.id, "Failed to load backend: {:#}", err);
                        Err(format!("{:#}", err))
                    }
                }
            })
            .await;
        match loaded {
            Ok(recognizer) => Ok(recognizer.clone()),
            Err(reason) => Err(OcrError::BackendUnavailable {
                backend: self.id,
                reason: reason.clone(),
            }
            .into()),
        }
    }
}

/// Both backends, each loaded once and shared read-only by every run.
pub struct RecognitionEngine {
    handwriting: BackendSlot,
    printed: BackendSlot,
}

impl RecognitionEngine {
    /// Create an engine from two loaders. Nothing is loaded yet.
    pub fn new(handwriting: BackendLoader, printed: BackendLoader) -> Self {
        Self {
            handwriting: BackendSlot::new(BackendId::Handwriting, handwriting),
            printed: BackendSlot::new(BackendId::Printed, printed),
        }
    }

    /// Create an engine for our real backends.
    pub fn from_opts(opts: &BackendOpts) -> Self {
        let trocr_opts = opts.clone();
        let tesseract_opts = opts.clone();
        Self::new(
            Box::new(move || -> BoxedFuture<Result<Arc<dyn Recognizer>>> {
                Box::pin(load_trocr(trocr_opts.clone()))
            }),
            Box::new(move || -> BoxedFuture<Result<Arc<dyn Recognizer>>> {
                Box::pin(load_tesseract(tesseract_opts.clone()))
            }),
        )
    }

    fn slot(&self, backend: BackendId) -> &BackendSlot {
        match backend {
            BackendId::Handwriting => &self.handwriting,
            BackendId::Printed => &self.printed,
        }
    }

    /// Load a backend now instead of on first use.
    pub async fn warm_up(&self, backend: BackendId) -> Result<()> {
        self.slot(backend).get().await.map(|_| ())
    }

    /// Run one backend on one page.
    ///
    /// Fails with [`OcrError::BackendUnavailable`] if the backend could not be
    /// loaded, or [`OcrError::RecognitionFailure`] if this call failed.
    #[instrument(level = "debug", skip_all, fields(page = image.index, backend = %backend))]
    pub async fn recognize(
        &self,
        image: &PageImage,
        backend: BackendId,
    ) -> Result<RecognitionResult> {
        let recognizer = self.slot(backend).get().await?;
        let text = recognizer.recognize(&image.image).await.map_err(|err| {
            OcrError::RecognitionFailure {
                backend,
                page: image.index,
                reason: format!("{:#}", err),
            }
        })?;
        debug!(chars = text.chars().count(), "Recognized text");
        Ok(RecognitionResult { backend, text })
    }
}

/// Load the handwriting backend described by `opts`.
async fn load_trocr(opts: BackendOpts) -> Result<Arc<dyn Recognizer>> {
    let model_dir = opts.handwriting_model.resolve().await?;
    let config = trocr::TrocrConfig {
        num_beams: opts.num_beams as usize,
        max_length: opts.max_length as usize,
    };
    let recognizer = trocr::TrocrRecognizer::load(model_dir, config).await?;
    Ok(Arc::new(recognizer))
}

/// Load the printed-text backend described by `opts`.
async fn load_tesseract(opts: BackendOpts) -> Result<Arc<dyn Recognizer>> {
    let recognizer =
        tesseract::TesseractRecognizer::load(opts.tesseract_lang, opts.min_confidence).await?;
    Ok(Arc::new(recognizer))
}

/// Backend configuration.
#[derive(Args, Clone, Debug)]
pub struct BackendOpts {
    /// Handwriting model: a local directory, or a Hugging Face repository
    /// containing an ONNX export of TrOCR.
    #[clap(
        long,
        env = "DUAL_OCR_HANDWRITING_MODEL",
        default_value = "Xenova/trocr-base-handwritten"
    )]
    pub handwriting_model: ModelLocator,

    /// Beam width for handwriting decoding. 1 means greedy.
    #[clap(long, default_value = "4", value_parser = clap::value_parser!(u32).range(1..=16))]
    pub num_beams: u32,

    /// Maximum number of tokens the handwriting model may generate.
    #[clap(long, default_value = "128", value_parser = clap::value_parser!(u32).range(2..=1024))]
    pub max_length: u32,

    /// Tesseract language(s), as passed to `tesseract -l`.
    #[clap(long, env = "DUAL_OCR_TESSERACT_LANG", default_value = "eng")]
    pub tesseract_lang: String,

    /// Drop printed-text words below this Tesseract confidence (0-100).
    #[clap(long, default_value = "0")]
    pub min_confidence: f32,
}
