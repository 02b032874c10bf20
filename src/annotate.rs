//! Save a copy of each page with the recognized handwriting drawn on top, in
//! black on a yellow box near the top-left corner.

use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use clap::Args;
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};

use crate::{async_utils::spawn_blocking_propagating_panics, page_source::PageImage, prelude::*};

/// Fonts we try, in order, when `--annotate-font` isn't given.
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu-sans-fonts/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Where the text starts.
const TEXT_ORIGIN: i32 = 20;
/// Space between the text and the edge of the box.
const PADDING: i32 = 10;
/// Text height in pixels.
const FONT_SIZE: f32 = 50.0;

const HIGHLIGHT: Rgb<u8> = Rgb([255, 255, 0]);
const INK: Rgb<u8> = Rgb([0, 0, 0]);

/// Annotated image options.
#[derive(Args, Clone, Debug, Default)]
pub struct AnnotateOpts {
    /// Save a copy of each page with the recognized handwriting drawn on it,
    /// like `result.jpg`. Multipage uploads get the page number added to the
    /// file name (`result-1.jpg`, ...).
    #[clap(long, value_name = "PATH")]
    pub annotate: Option<PathBuf>,

    /// TrueType or OpenType font for `--annotate`. Defaults to a common
    /// system font.
    #[clap(long, value_name = "PATH", requires = "annotate")]
    pub annotate_font: Option<PathBuf>,
}

/// Draws recognized text onto copies of pages, and saves them.
pub struct Annotator {
    output: PathBuf,
    format: ImageFormat,
    font: Arc<FontVec>,
}

impl Annotator {
    /// Build an annotator, if `--annotate` was given.
    pub fn from_opts(opts: &AnnotateOpts) -> Result<Option<Self>> {
        let Some(output) = &opts.annotate else {
            return Ok(None);
        };
        output_format(output)?;
        let font_path = match &opts.annotate_font {
            Some(path) => path.clone(),
            None => FONT_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .find(|path| path.is_file())
                .ok_or_else(|| anyhow!("no system font found; use --annotate-font"))?,
        };
        let font = load_font(&font_path)?;
        Ok(Some(Self::new(output.clone(), font)?))
    }

    /// Build an annotator writing to `output`, whose extension picks the
    /// image format.
    pub fn new(output: PathBuf, font: FontVec) -> Result<Self> {
        let format = output_format(&output)?;
        Ok(Self {
            output,
            format,
            font: Arc::new(font),
        })
    }

    /// Save a copy of `page` with `text` drawn on it. The page itself is left
    /// alone.
    #[instrument(level = "debug", skip_all, fields(page = page.index))]
    pub async fn save(&self, page: &PageImage, text: &str, paged: bool) -> Result<PathBuf> {
        let path = annotated_path(&self.output, page.index, paged);
        let image = page.image.clone();
        let owned_text = text.to_owned();
        let font = self.font.clone();
        let format = self.format;
        let dest = path.clone();
        spawn_blocking_propagating_panics(move || -> Result<()> {
            annotate(&image, &owned_text, &font)
                .save_with_format(&dest, format)
                .with_context(|| format!("failed to save {:?}", dest.display()))
        })
        .await?;
        info!(
            page = page.index,
            chars = text.chars().count(),
            path = %path.display(),
            "Saved annotated page"
        );
        Ok(path)
    }
}

/// The image format to save as, going by the file extension.
fn output_format(output: &Path) -> Result<ImageFormat> {
    let format = ImageFormat::from_path(output)
        .with_context(|| format!("cannot tell image format of {:?}", output.display()))?;
    if !format.writing_enabled() {
        bail!("cannot write {:?} images", format);
    }
    Ok(format)
}

/// Where the annotated copy of a page goes.
fn annotated_path(output: &Path, page: usize, paged: bool) -> PathBuf {
    if !paged {
        return output.to_owned();
    }
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem}-{page}");
    if let Some(ext) = output.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    output.with_file_name(name)
}

/// Read a font file.
pub fn load_font(path: &Path) -> Result<FontVec> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read font {:?}", path.display()))?;
    FontVec::try_from_vec(data)
        .map_err(|err| anyhow!("invalid font {:?}: {}", path.display(), err))
}

/// The yellow box behind text of the given size, clipped to the image.
/// `None` if the image is too small to show any of it.
fn highlight_rect(
    text_width: u32,
    text_height: u32,
    image_width: u32,
    image_height: u32,
) -> Option<Rect> {
    let left = TEXT_ORIGIN - PADDING;
    let top = TEXT_ORIGIN - PADDING;
    let room_x = i64::from(image_width) - i64::from(left);
    let room_y = i64::from(image_height) - i64::from(top);
    if room_x <= 0 || room_y <= 0 {
        return None;
    }
    let width = (i64::from(text_width) + 2 * i64::from(PADDING)).min(room_x);
    let height = (i64::from(text_height) + 2 * i64::from(PADDING)).min(room_y);
    Some(Rect::at(left, top).of_size(width as u32, height as u32))
}

/// Draw `text` on a copy of `image`.
pub fn annotate(image: &RgbImage, text: &str, font: &FontVec) -> RgbImage {
    let mut canvas = image.clone();
    let scale = PxScale::from(FONT_SIZE);
    let (text_width, text_height) = text_size(scale, font, text);
    if let Some(rect) = highlight_rect(text_width, text_height, canvas.width(), canvas.height()) {
        draw_filled_rect_mut(&mut canvas, rect, HIGHLIGHT);
    }
    draw_text_mut(&mut canvas, INK, TEXT_ORIGIN, TEXT_ORIGIN, scale, font, text);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A font from the system, for tests that draw.
    fn system_font() -> FontVec {
        let path = FONT_CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.is_file())
            .expect("no system font installed");
        load_font(path).unwrap()
    }

    #[test]
    fn highlight_box_pads_the_text() {
        let rect = highlight_rect(100, 40, 500, 300).unwrap();
        assert_eq!((rect.left(), rect.top()), (10, 10));
        assert_eq!((rect.width(), rect.height()), (120, 60));
    }

    #[test]
    fn highlight_box_is_clipped_to_the_image() {
        let rect = highlight_rect(1000, 40, 200, 50).unwrap();
        assert_eq!((rect.width(), rect.height()), (190, 40));
        assert!(highlight_rect(10, 10, 8, 8).is_none());
    }

    #[test]
    fn paged_uploads_get_numbered_files() {
        let output = Path::new("out/result.jpg");
        assert_eq!(annotated_path(output, 1, false), output);
        assert_eq!(annotated_path(output, 2, true), PathBuf::from("out/result-2.jpg"));
        assert_eq!(annotated_path(Path::new("result"), 3, true), PathBuf::from("result-3"));
    }

    #[test]
    fn missing_font_is_an_error() {
        let err = load_font(Path::new("/definitely/not/a/font.ttf")).unwrap_err();
        assert!(err.to_string().contains("failed to read font"));
    }

    #[test]
    fn output_format_follows_the_extension() -> Result<()> {
        assert_eq!(output_format(Path::new("result.jpg"))?, ImageFormat::Jpeg);
        assert_eq!(output_format(Path::new("result.PNG"))?, ImageFormat::Png);
        assert!(output_format(Path::new("result.notanimage")).is_err());
        assert!(output_format(Path::new("result")).is_err());
        Ok(())
    }

    #[test]
    fn annotation_is_off_unless_asked_for() -> Result<()> {
        assert!(Annotator::from_opts(&AnnotateOpts::default())?.is_none());
        let opts = AnnotateOpts {
            annotate: Some(PathBuf::from("result.notanimage")),
            annotate_font: None,
        };
        let err = Annotator::from_opts(&opts).err().expect("bad extension accepted");
        assert!(err.to_string().contains("image format"), "got {err}");
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires a system TrueType font"]
    async fn annotated_copy_is_saved_and_page_is_untouched() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let annotator = Annotator::new(dir.path().join("result.png"), system_font())?;
        let page = PageImage {
            index: 1,
            image: RgbImage::from_pixel(400, 120, Rgb([255, 255, 255])),
        };
        let path = annotator.save(&page, "hello", false).await?;
        assert_eq!(page.image.get_pixel(12, 12), &Rgb([255, 255, 255]));

        let saved = image::open(&path)?.to_rgb8();
        assert_eq!(saved.dimensions(), (400, 120));
        assert_eq!(saved.get_pixel(12, 12), &HIGHLIGHT);
        assert!(saved.pixels().any(|pixel| pixel.0.iter().all(|&c| c < 64)));
        Ok(())
    }
}
