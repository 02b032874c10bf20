//! Turn an uploaded file into page images.
//!
//! Raster images become a single page. PDFs are rasterized page by page with
//! Poppler's `pdftocairo`, and multipage TIFFs are split in-process. Every
//! page comes out as 8-bit RGB, whatever the source color mode was.

use std::{
    io::Cursor,
    num::NonZeroUsize,
    sync::LazyLock,
};

use clap::Args;
use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageBuffer, Luma, LumaA, Rgb, RgbImage,
    RgbaImage,
};
use regex::Regex;
use tiff::{
    ColorType,
    decoder::{Decoder, DecodingResult},
    tags::Tag,
};
use tokio::process::Command;

use crate::{
    artifact::{MediaType, UploadedArtifact},
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics, spawn_error},
    prelude::*,
};

/// Extracts the page number from a `pdftocairo` output file name.
static PAGE_FILE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(\d+)\.png$").expect("failed to compile regex"));

/// Poppler exits successfully on many damaged files, so we look at what it
/// prints.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Complaints about the cross-reference table are recoverable.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of poppler output report a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// One page, ready for recognition.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-based position in the source document.
    pub index: usize,
    /// The page bitmap.
    pub image: RgbImage,
}

/// Options controlling how documents are split into pages.
#[derive(Args, Clone, Debug)]
pub struct PageSourceOptions {
    /// The DPI used when rasterizing PDF pages.
    #[clap(long, default_value = "200")]
    pub dpi: u32,

    /// The maximum number of pages to process. Later pages are skipped and a
    /// warning is added to the report.
    #[clap(long)]
    pub max_pages: Option<NonZeroUsize>,
}

impl Default for PageSourceOptions {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_pages: None,
        }
    }
}

/// The pages of one upload.
#[derive(Debug)]
pub struct PageSet {
    /// Pages in document order. Never empty.
    pub pages: Vec<PageImage>,
    /// Did this come from a multipage document format? Controls whether the
    /// report shows page headers.
    pub paged: bool,
    /// Anything odd we noticed that didn't stop us.
    pub warnings: Vec<String>,
}

impl PageSet {
    /// Wrap a single decoded raster image.
    fn single(image: RgbImage) -> Self {
        Self {
            pages: vec![PageImage { index: 1, image }],
            paged: false,
            warnings: vec![],
        }
    }

    /// Wrap the pages of a document.
    ///
    /// `pages` must hold pages `1..=N` in order, where `N` is `total_pages`
    /// capped by `max_pages`. A gap means the document could not be fully
    /// decoded. Stopping at `max_pages` adds a warning.
    fn document(
        pages: Vec<PageImage>,
        total_pages: usize,
        max_pages: Option<NonZeroUsize>,
        media_type: &str,
        mut warnings: Vec<String>,
    ) -> Result<Self> {
        let expected = max_pages.map_or(total_pages, |max| max.get().min(total_pages));
        if !pages.iter().map(|page| page.index).eq(1..=expected) {
            let missing = (1..=expected)
                .filter(|index| !pages.iter().any(|page| page.index == *index))
                .map(|index| index.to_string())
                .collect::<Vec<_>>();
            return Err(OcrError::decode(
                media_type,
                format!(
                    "got {} of {} pages (missing: {})",
                    pages.len(),
                    expected,
                    missing.join(", ")
                ),
            )
            .into());
        }
        if expected < total_pages {
            warnings.push(format!(
                "only {}/{} pages processed (because of --max-pages)",
                expected, total_pages
            ));
        }
        Ok(Self {
            pages,
            paged: true,
            warnings,
        })
    }
}

/// Decode an upload into pages, based on its declared media type.
#[instrument(level = "debug", skip_all, fields(name = %artifact.name, declared_type = %artifact.declared_type))]
pub async fn load_pages(
    artifact: &UploadedArtifact,
    options: &PageSourceOptions,
) -> Result<PageSet> {
    let media_type = artifact.media_type()?;
    let page_set = match media_type {
        MediaType::Pdf => load_pdf(&artifact.data, options).await?,
        MediaType::Tiff => {
            let data = artifact.data.clone();
            let max_pages = options.max_pages;
            spawn_blocking_propagating_panics(move || load_tiff(&data, max_pages))
                .await?
        }
        raster => {
            let data = artifact.data.clone();
            let image =
                spawn_blocking_propagating_panics(move || decode_raster(&data, raster))
                    .await?;
            PageSet::single(image)
        }
    };
    debug!(
        pages = page_set.pages.len(),
        paged = page_set.paged,
        "Loaded pages"
    );
    Ok(page_set)
}

/// Decode a single-frame raster image and normalize it to RGB.
fn decode_raster(data: &[u8], media_type: MediaType) -> Result<RgbImage> {
    let format = media_type
        .raster_format()
        .ok_or_else(|| anyhow!("{} is not a single-frame raster type", media_type))?;
    let image = image::load_from_memory_with_format(data, format)
        .map_err(|err| OcrError::decode(media_type.as_mime(), err))?;
    Ok(image.to_rgb8())
}

/// Rasterize every page of a PDF.
#[instrument(level = "debug", skip_all, fields(dpi = options.dpi))]
async fn load_pdf(data: &[u8], options: &PageSourceOptions) -> Result<PageSet> {
    let pdf_mime = MediaType::Pdf.as_mime();

    // Refuse obvious garbage before we start any external tools.
    if !infer::is(data, "pdf") {
        return Err(OcrError::decode(pdf_mime, "missing %PDF signature").into());
    }

    // Poppler wants a real file.
    let tmpdir = tempfile::TempDir::with_prefix("dual-ocr-pdf")?;
    let input_path = tmpdir.path().join("input.pdf");
    tokio::fs::write(&input_path, data)
        .await
        .with_context(|| format!("failed to write {:?}", input_path.display()))?;

    let total_pages = get_pdf_page_count(&input_path).await?;
    if total_pages == 0 {
        return Err(OcrError::decode(pdf_mime, "document has no pages").into());
    }

    // Run pdftocairo to convert the PDF to PNG files. It will add page
    // numbers to the output prefix.
    let out_dir = tmpdir.path().join("pages");
    tokio::fs::create_dir(&out_dir)
        .await
        .context("failed to create page directory")?;
    let mut cmd = Command::new("pdftocairo");
    cmd.arg("-png").arg("-r").arg(options.dpi.to_string());
    if let Some(max_pages) = options.max_pages
        && total_pages > max_pages.get()
    {
        // Poppler page ranges are 1-based and inclusive.
        cmd.arg("-l").arg(max_pages.to_string());
    }
    let output = cmd
        .arg(&input_path)
        .arg(out_dir.join("page"))
        .output()
        .await
        .map_err(|err| spawn_error("pdftocairo", "poppler-utils", err))?;
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))
        .map_err(|err| OcrError::decode(pdf_mime, err))?;

    // Anything left on stderr is recoverable damage. Keep it around.
    let warnings = String::from_utf8_lossy(&output.stderr)
        .lines()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();

    let page_paths = rendered_page_paths(&out_dir)?;
    let mut pages = Vec::with_capacity(page_paths.len());
    for (index, path) in page_paths {
        let image = spawn_blocking_propagating_panics(move || -> Result<RgbImage> {
            let image = image::open(&path)
                .with_context(|| format!("failed to read rendered page {:?}", path.display()))?;
            Ok(image.to_rgb8())
        })
        .await?;
        pages.push(PageImage { index, image });
    }
    PageSet::document(pages, total_pages, options.max_pages, pdf_mime, warnings)
}

/// List the PNGs written by `pdftocairo`, with their page numbers, in page
/// order.
fn rendered_page_paths(dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let mut numbered = dir
        .read_dir()
        .with_context(|| format!("failed to read directory {:?}", dir.display()))?
        .map(|entry| {
            let path = entry
                .with_context(|| format!("failed to read entry in {:?}", dir.display()))?
                .path();
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            let page = PAGE_FILE_REGEX
                .captures(&name)
                .and_then(|caps| caps[1].parse::<usize>().ok())
                .ok_or_else(|| anyhow!("unexpected file from pdftocairo: {:?}", name))?;
            Ok((page, path))
        })
        .collect::<Result<Vec<_>>>()?;
    numbered.sort();
    Ok(numbered)
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let pdf_mime = MediaType::Pdf.as_mime();
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .map_err(|err| spawn_error("pdfinfo", "poppler-utils", err))?;
    check_for_command_failure("pdfinfo", &output, None)
        .map_err(|err| OcrError::decode(pdf_mime, err))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_pdfinfo_pages(&stdout)
        .ok_or_else(|| OcrError::decode(pdf_mime, "pdfinfo reported no page count").into())
}

/// Pull the `Pages:` value out of `pdfinfo` output.
fn parse_pdfinfo_pages(output: &str) -> Option<usize> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "Pages" {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// `NewSubfileType` bits, from the TIFF 6.0 and DNG specifications.
mod subfile_type {
    /// Bit 0: reduced resolution image (thumbnail/preview).
    pub const REDUCED_RESOLUTION: u32 = 0x1;
    /// Bit 2: transparency mask for another image.
    pub const TRANSPARENCY_MASK: u32 = 0x4;
    /// DNG extensions (bits 3, 4, 16): depth map, enhanced image, semantic mask.
    pub const DNG_BITS: u32 = 0x8 | 0x10 | 0x10000;
}

/// If a `NewSubfileType` marks an image as something other than document
/// content, say what it is.
fn auxiliary_image_kind(bits: u32) -> Option<&'static str> {
    if bits & subfile_type::REDUCED_RESOLUTION != 0 {
        Some("reduced resolution image")
    } else if bits & subfile_type::TRANSPARENCY_MASK != 0 {
        Some("transparency mask")
    } else if bits & subfile_type::DNG_BITS != 0 {
        Some("DNG camera metadata")
    } else {
        None
    }
}

/// Split a TIFF into pages, one per top-level IFD.
///
/// Thumbnails and masks stored as top-level IFDs are skipped. Pages hidden
/// in SubIFDs are an error, so we never silently drop content. A TIFF with a
/// single page is just a raster image and gets no page headers.
fn load_tiff(data: &[u8], max_pages: Option<NonZeroUsize>) -> Result<PageSet> {
    let tiff_mime = MediaType::Tiff.as_mime();
    let mut decoder = Decoder::new(Cursor::new(data))
        .map_err(|err| OcrError::decode(tiff_mime, err))?;

    let mut pages = vec![];
    let mut warnings = vec![];
    let mut total_pages = 0;
    let mut ifd_index = 0;
    loop {
        let bits = new_subfile_type(&mut decoder);
        if let Some(kind) = auxiliary_image_kind(bits) {
            debug!(ifd_index, bits, "Skipping TIFF IFD: {}", kind);
        } else {
            total_pages += 1;
            if max_pages.is_none_or(|max| pages.len() < max.get()) {
                validate_subifds(&mut decoder, ifd_index, &mut warnings)
                    .map_err(|err| OcrError::decode(tiff_mime, err))?;
                let image = decode_tiff_frame(&mut decoder).map_err(|err| {
                    OcrError::decode(tiff_mime, format!("IFD {ifd_index}: {err}"))
                })?;
                pages.push(PageImage {
                    index: total_pages,
                    image,
                });
            }
        }
        if !decoder.more_images() {
            break;
        }
        decoder
            .next_image()
            .map_err(|err| OcrError::decode(tiff_mime, err))?;
        ifd_index += 1;
    }

    match total_pages {
        0 => Err(OcrError::decode(tiff_mime, "no page images, only thumbnails or masks").into()),
        1 => {
            let page = pages
                .pop()
                .ok_or_else(|| OcrError::decode(tiff_mime, "no image data"))?;
            let mut page_set = PageSet::single(page.image);
            page_set.warnings = warnings;
            Ok(page_set)
        }
        _ => {
            debug!(total_pages, decoded = pages.len(), "Split multipage TIFF");
            PageSet::document(pages, total_pages, max_pages, tiff_mime, warnings)
        }
    }
}

/// The `NewSubfileType` of the current IFD. Missing means 0, a plain page.
fn new_subfile_type<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> u32 {
    match decoder.find_tag(Tag::NewSubfileType) {
        Ok(Some(value)) => value.into_u32().unwrap_or(0),
        _ => 0,
    }
}

/// Make sure the SubIFDs of the current IFD hold nothing but thumbnails,
/// masks and camera metadata.
fn validate_subifds<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    ifd_index: usize,
    warnings: &mut Vec<String>,
) -> Result<(), String> {
    let pointers = match decoder.find_tag(Tag::SubIfd) {
        Ok(Some(value)) => value
            .into_ifd_vec()
            .map_err(|err| format!("IFD {ifd_index} has an unreadable SubIFD tag: {err}"))?,
        Ok(None) | Err(_) => return Ok(()),
    };

    for (sub_index, pointer) in pointers.into_iter().enumerate() {
        let subdir = match decoder.read_directory(pointer) {
            Ok(dir) => dir,
            Err(err) => {
                warnings.push(format!(
                    "could not read SubIFD {sub_index} of IFD {ifd_index}: {err}"
                ));
                continue;
            }
        };
        let bits = match decoder.read_directory_tags(&subdir).find_tag(Tag::NewSubfileType) {
            Ok(Some(value)) => value.into_u32().unwrap_or(0),
            _ => 0,
        };
        match auxiliary_image_kind(bits) {
            Some(kind) => debug!(ifd_index, sub_index, bits, "Skipping TIFF SubIFD: {}", kind),
            None => {
                return Err(format!(
                    "IFD {ifd_index} has a SubIFD that may hold a page \
                     (SubIFD {sub_index}, NewSubfileType={bits}); convert the file \
                     to PDF or separate images first"
                ));
            }
        }
    }
    Ok(())
}

/// Decode the current IFD. Errors are plain strings, wrapped by the caller.
fn decode_tiff_frame<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
) -> Result<RgbImage, String> {
    let (width, height) = decoder.dimensions().map_err(|err| err.to_string())?;
    let color_type = decoder.colortype().map_err(|err| err.to_string())?;
    let pixels = decoder.read_image().map_err(|err| err.to_string())?;
    let size_error = || format!("pixel data does not match {width}x{height} {color_type:?}");

    let image = match (pixels, color_type) {
        (DecodingResult::U8(data), ColorType::Gray(8)) => {
            DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, data).ok_or_else(size_error)?)
        }
        (DecodingResult::U8(data), ColorType::GrayA(8)) => DynamicImage::ImageLumaA8(
            GrayAlphaImage::from_raw(width, height, data).ok_or_else(size_error)?,
        ),
        (DecodingResult::U8(data), ColorType::RGB(8)) => {
            DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, data).ok_or_else(size_error)?)
        }
        (DecodingResult::U8(data), ColorType::RGBA(8)) => {
            DynamicImage::ImageRgba8(RgbaImage::from_raw(width, height, data).ok_or_else(size_error)?)
        }
        (DecodingResult::U16(data), ColorType::Gray(16)) => DynamicImage::ImageLuma16(
            ImageBuffer::<Luma<u16>, _>::from_raw(width, height, data).ok_or_else(size_error)?,
        ),
        (DecodingResult::U16(data), ColorType::GrayA(16)) => DynamicImage::ImageLumaA16(
            ImageBuffer::<LumaA<u16>, _>::from_raw(width, height, data).ok_or_else(size_error)?,
        ),
        (DecodingResult::U16(data), ColorType::RGB(16)) => DynamicImage::ImageRgb16(
            ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, data).ok_or_else(size_error)?,
        ),
        (_, other) => return Err(format!("unsupported color type {other:?}")),
    };
    Ok(image.to_rgb8())
}
