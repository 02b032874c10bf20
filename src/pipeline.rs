//! Drive every page of an upload through both backends, and assemble a report.

use std::sync::Arc;

use indicatif::ProgressBar;

use crate::{
    annotate::Annotator,
    artifact::UploadedArtifact,
    engines::{BackendId, RecognitionEngine},
    errors::classify,
    page_source::{PageImage, PageSourceOptions, load_pages},
    prelude::*,
    report::{BackendOutcome, PageReport, Report},
};

/// What to do when a backend fails on a page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Fail the whole run.
    #[default]
    Abort,
    /// Record a failure marker for that entry and keep going. A backend that
    /// can't be loaded still fails the run.
    Mark,
}

/// Runs uploads through a shared engine. Keeps no state between runs.
pub struct Pipeline {
    engine: Arc<RecognitionEngine>,
    page_options: PageSourceOptions,
    policy: FailurePolicy,
    annotator: Option<Annotator>,
}

impl Pipeline {
    pub fn new(
        engine: Arc<RecognitionEngine>,
        page_options: PageSourceOptions,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            engine,
            page_options,
            policy,
            annotator: None,
        }
    }

    /// Also save a copy of each page with its handwriting text drawn on it.
    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = Some(annotator);
        self
    }

    /// OCR an upload.
    ///
    /// Pages are processed in order, handwriting first, then printed. Errors
    /// while loading pages are returned as-is, without a partial report.
    #[instrument(level = "debug", skip_all, fields(name = %artifact.name))]
    pub async fn run(&self, artifact: &UploadedArtifact, progress: &ProgressBar) -> Result<Report> {
        let page_set = load_pages(artifact, &self.page_options).await?;
        progress.set_length((page_set.pages.len() * BackendId::ALL.len()) as u64);

        let mut pages = Vec::with_capacity(page_set.pages.len());
        for page in &page_set.pages {
            let handwriting = self.recognize(page, BackendId::Handwriting).await?;
            progress.inc(1);
            if let Some(annotator) = &self.annotator {
                annotator
                    .save(page, &handwriting.to_string(), page_set.paged)
                    .await?;
            }
            let printed = self.recognize(page, BackendId::Printed).await?;
            progress.inc(1);
            pages.push(PageReport {
                page: page.index,
                handwriting,
                printed,
            });
        }

        Ok(Report {
            paged: page_set.paged,
            pages,
            warnings: page_set.warnings,
        })
    }

    async fn recognize(&self, page: &PageImage, backend: BackendId) -> Result<BackendOutcome> {
        match self.engine.recognize(page, backend).await {
            Ok(result) => {
                trace!(page = page.index, backend = %result.backend, "Recognized page");
                Ok(BackendOutcome::Recognized { text: result.text })
            }
            Err(err) => match (self.policy, classify(&err)) {
                (FailurePolicy::Mark, Some(OcrError::RecognitionFailure { reason, .. })) => {
                    warn!(page = page.index, backend = %backend, "Recognition failed: {}", reason);
                    Ok(BackendOutcome::Failed {
                        error: reason.clone(),
                    })
                }
                _ => Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        num::NonZeroUsize,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use tiff::encoder::{TiffEncoder, colortype};

    use super::*;
    use crate::{
        annotate::AnnotateOpts,
        engines::{
            tesseract::TesseractRecognizer,
            testing::{FakeRecognizer, block_letters, broken, fake_engine, ready},
        },
    };

    fn png(width: u32, height: u32, red: u8) -> UploadedArtifact {
        let image = RgbImage::from_pixel(width, height, Rgb([red, 0, 0]));
        let mut data = vec![];
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        UploadedArtifact::new("page.png", "image/png", data)
    }

    /// A TIFF with one RGB page per entry in `reds`.
    fn rgb_tiff(reds: &[u8]) -> UploadedArtifact {
        let mut data = vec![];
        {
            let mut encoder = TiffEncoder::new(Cursor::new(&mut data)).unwrap();
            for &red in reds {
                let pixels = [red, 0, 0].repeat(6);
                encoder
                    .write_image::<colortype::RGB8>(3, 2, &pixels)
                    .unwrap();
            }
        }
        UploadedArtifact::new("scan.tiff", "image/tiff", data)
    }

    fn pipeline(engine: RecognitionEngine, policy: FailurePolicy) -> Pipeline {
        Pipeline::new(Arc::new(engine), PageSourceOptions::default(), policy)
    }

    #[tokio::test]
    async fn single_image_gets_one_unlabeled_section() -> Result<()> {
        let (engine, hand_calls, print_calls) = fake_engine();
        let report = pipeline(engine, FailurePolicy::Abort)
            .run(&png(5, 4, 200), &ProgressBar::hidden())
            .await?;
        assert_eq!(
            report.to_string(),
            "Handwritten OCR:\nhand 5x4 r=200\n\nTyped OCR:\nprint 5x4 r=200\n"
        );
        assert_eq!(hand_calls.load(Ordering::SeqCst), 1);
        assert_eq!(print_calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn multipage_upload_keeps_page_order() -> Result<()> {
        let (engine, hand_calls, print_calls) = fake_engine();
        let report = pipeline(engine, FailurePolicy::Abort)
            .run(&rgb_tiff(&[10, 20, 30]), &ProgressBar::hidden())
            .await?;
        assert!(report.paged);
        let pages = report.pages.iter().map(|p| p.page).collect::<Vec<_>>();
        assert_eq!(pages, vec![1, 2, 3]);
        assert_eq!(
            report.pages[1].handwriting,
            BackendOutcome::Recognized {
                text: "hand 3x2 r=20".to_owned()
            }
        );
        let text = report.to_string();
        let first = text.find("--- Page 1 ---").unwrap();
        let second = text.find("--- Page 2 ---").unwrap();
        let third = text.find("--- Page 3 ---").unwrap();
        assert!(first < second && second < third);
        assert_eq!(hand_calls.load(Ordering::SeqCst), 3);
        assert_eq!(print_calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn same_upload_gives_same_report() -> Result<()> {
        let (engine, _, _) = fake_engine();
        let pipeline = pipeline(engine, FailurePolicy::Abort);
        let upload = rgb_tiff(&[1, 2]);
        let first = pipeline.run(&upload, &ProgressBar::hidden()).await?;
        let second = pipeline.run(&upload, &ProgressBar::hidden()).await?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn printed_word_in_a_png_is_read_back() -> Result<()> {
        let (handwriting, _) = FakeRecognizer::new("hand");
        let printed = TesseractRecognizer::load("eng".to_owned(), 0.0).await?;
        let engine = RecognitionEngine::new(ready(handwriting), ready(Arc::new(printed)));
        let mut data = vec![];
        DynamicImage::ImageRgb8(block_letters())
            .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)?;
        let upload = UploadedArtifact::new("test.png", "image/png", data);

        let report = pipeline(engine, FailurePolicy::Abort)
            .run(&upload, &ProgressBar::hidden())
            .await?;
        assert!(!report.paged);
        assert_eq!(report.pages.len(), 1);
        let BackendOutcome::Recognized { text } = &report.pages[0].printed else {
            panic!("unexpected outcome {:?}", report.pages[0].printed);
        };
        assert!(text.trim().eq_ignore_ascii_case("TEST"), "got {:?}", text);
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_pdf_never_reaches_backends() {
        let (engine, hand_calls, print_calls) = fake_engine();
        let upload = UploadedArtifact::new("x.pdf", "application/pdf", b"not a pdf".to_vec());
        let err = pipeline(engine, FailurePolicy::Abort)
            .run(&upload, &ProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(matches!(classify(&err), Some(OcrError::Decode { .. })));
        assert_eq!(hand_calls.load(Ordering::SeqCst), 0);
        assert_eq!(print_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_upload_is_rejected() {
        let (engine, hand_calls, _) = fake_engine();
        let upload = UploadedArtifact::new("notes.txt", "text/plain", b"hello".to_vec());
        let err = pipeline(engine, FailurePolicy::Mark)
            .run(&upload, &ProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(OcrError::UnsupportedType { .. })
        ));
        assert_eq!(hand_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recognition_failure_aborts_by_default() {
        let (handwriting, _) = FakeRecognizer::failing_on("hand", 2);
        let (printed, _) = FakeRecognizer::new("print");
        let engine = RecognitionEngine::new(ready(handwriting), ready(printed));
        let err = pipeline(engine, FailurePolicy::Abort)
            .run(&rgb_tiff(&[1, 2, 3]), &ProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(OcrError::RecognitionFailure { page: 2, .. })
        ));
    }

    #[tokio::test]
    async fn keep_going_marks_failed_entries() -> Result<()> {
        let (handwriting, _) = FakeRecognizer::failing_on("hand", 2);
        let (printed, print_calls) = FakeRecognizer::new("print");
        let engine = RecognitionEngine::new(ready(handwriting), ready(printed));
        let report = pipeline(engine, FailurePolicy::Mark)
            .run(&rgb_tiff(&[1, 2, 3]), &ProgressBar::hidden())
            .await?;
        assert_eq!(report.pages.len(), 3);
        assert_eq!(
            report.pages[1].handwriting,
            BackendOutcome::Failed {
                error: "hand exploded".to_owned()
            }
        );
        assert!(matches!(
            report.pages[2].handwriting,
            BackendOutcome::Recognized { .. }
        ));
        assert_eq!(print_calls.load(Ordering::SeqCst), 3);
        assert!(
            report
                .to_string()
                .contains("--- Page 2 ---\nHandwritten OCR:\n[recognition failed: hand exploded]\n")
        );
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_backend_aborts_even_when_keeping_going() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (handwriting, _) = FakeRecognizer::new("hand");
        let engine = RecognitionEngine::new(ready(handwriting), broken(attempts.clone()));
        let err = pipeline(engine, FailurePolicy::Mark)
            .run(&png(2, 2, 0), &ProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(OcrError::BackendUnavailable {
                backend: BackendId::Printed,
                ..
            })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[ignore = "Requires a system TrueType font"]
    async fn annotated_copies_are_saved_per_page() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let opts = AnnotateOpts {
            annotate: Some(dir.path().join("result.png")),
            annotate_font: None,
        };
        let annotator = Annotator::from_opts(&opts)?.expect("annotation requested");
        let (engine, _, _) = fake_engine();
        let upload = rgb_tiff(&[1, 2]);
        let report = pipeline(engine, FailurePolicy::Abort)
            .with_annotator(annotator)
            .run(&upload, &ProgressBar::hidden())
            .await?;
        assert_eq!(report.pages.len(), 2);
        assert!(dir.path().join("result-1.png").is_file());
        assert!(dir.path().join("result-2.png").is_file());
        assert!(!dir.path().join("result.png").exists());
        Ok(())
    }

    #[tokio::test]
    async fn page_limit_is_reported_as_a_warning() -> Result<()> {
        let (engine, hand_calls, _) = fake_engine();
        let pipeline = Pipeline::new(
            Arc::new(engine),
            PageSourceOptions {
                max_pages: NonZeroUsize::new(2),
                ..PageSourceOptions::default()
            },
            FailurePolicy::Abort,
        );
        let report = pipeline
            .run(&rgb_tiff(&[1, 2, 3]), &ProgressBar::hidden())
            .await?;
        assert_eq!(report.pages.len(), 2);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(hand_calls.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
