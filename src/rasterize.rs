//! Document rasterization: uploads become per-page images.
//!
//! PDFs are rendered at 300 DPI through pdfium and re-encoded as JPEG, one
//! image per page. Image uploads pass through untouched as a single page;
//! the format is sniffed from magic bytes, never from the filename. Anything
//! else is rejected as unsupported.
//!
//! Everything here is synchronous CPU work. Callers on the async runtime
//! wrap [`rasterize`] in `spawn_blocking`.

use std::io::Cursor;
use std::sync::OnceLock;

use pdfium_render::prelude::*;
use tracing::{debug, info};

use crate::error::{Error, Result};

const RENDER_DPI: f32 = 300.0;
const PAGE_WIDTH_INCHES: f32 = 8.5;
const PAGE_HEIGHT_INCHES: f32 = 14.0;
const MAX_DOCUMENT_SIZE: usize = 200 * 1024 * 1024;

/// One rendered page, ready for blob storage and embedding.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-based page number within the source document.
    pub page_number: i64,
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Rasterize an uploaded document into page images.
///
/// The format is decided by content sniffing; `filename` only flavors error
/// messages. PDFs yield one JPEG per page, images yield themselves as page 1.
pub fn rasterize(bytes: &[u8], filename: &str) -> Result<Vec<PageImage>> {
    if bytes.len() > MAX_DOCUMENT_SIZE {
        return Err(Error::UnsupportedFormat(format!(
            "'{}' is {}MB, over the {}MB limit",
            filename,
            bytes.len() / (1024 * 1024),
            MAX_DOCUMENT_SIZE / (1024 * 1024)
        )));
    }

    if bytes.starts_with(b"%PDF") {
        return render_pdf_pages(bytes);
    }

    if let Some((content_type, _ext)) = detect_image_format(bytes) {
        let (width, height) = image::load_from_memory(bytes)
            .map(|img| (img.width(), img.height()))
            .unwrap_or((0, 0));
        debug!(filename, content_type, width, height, "image passthrough");
        return Ok(vec![PageImage {
            page_number: 1,
            bytes: bytes.to_vec(),
            content_type,
            width,
            height,
        }]);
    }

    Err(Error::UnsupportedFormat(format!(
        "'{}' is not a PDF or a supported image format",
        filename
    )))
}

fn render_pdf_pages(pdf_bytes: &[u8]) -> Result<Vec<PageImage>> {
    let pdfium = load_pdfium()?;

    let document = pdfium
        .load_pdf_from_byte_slice(pdf_bytes, None)
        .map_err(|e| Error::Pdf(format!("failed to load PDF: {:?}", e)))?;

    let total_pages = document.pages().len() as usize;
    if total_pages == 0 {
        return Err(Error::Pdf("PDF has no pages".into()));
    }

    info!(total_pages, dpi = RENDER_DPI as u32, "rendering PDF");

    let render_config = PdfRenderConfig::new()
        .set_target_width((RENDER_DPI * PAGE_WIDTH_INCHES) as i32)
        .set_maximum_height((RENDER_DPI * PAGE_HEIGHT_INCHES) as i32);

    let mut pages = Vec::with_capacity(total_pages);
    for (idx, page) in document.pages().iter().enumerate() {
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| Error::Pdf(format!("failed to render page {}: {:?}", idx + 1, e)))?;

        let rgb_image = bitmap.as_image().to_rgb8();
        let (width, height) = (rgb_image.width(), rgb_image.height());

        let mut jpeg_buffer = Cursor::new(Vec::new());
        rgb_image.write_to(&mut jpeg_buffer, image::ImageFormat::Jpeg)?;

        pages.push(PageImage {
            page_number: (idx + 1) as i64,
            bytes: jpeg_buffer.into_inner(),
            content_type: "image/jpeg",
            width,
            height,
        });
    }

    Ok(pages)
}

/// Sniff an image format from magic bytes. `None` for anything that is not
/// a format the embedding service accepts.
fn detect_image_format(data: &[u8]) -> Option<(&'static str, &'static str)> {
    if data.starts_with(b"\x89PNG") {
        Some(("image/png", "png"))
    } else if data.starts_with(b"\xFF\xD8\xFF") {
        Some(("image/jpeg", "jpg"))
    } else if data.starts_with(b"RIFF") && data.len() > 12 && &data[8..12] == b"WEBP" {
        Some(("image/webp", "webp"))
    } else if data.starts_with(b"GIF8") {
        Some(("image/gif", "gif"))
    } else if data.starts_with(b"BM") {
        Some(("image/bmp", "bmp"))
    } else {
        None
    }
}

// ============ pdfium loading ============

/// `pdfium-render` 0.8 dropped `Send + Sync` from the bindings type, but the
/// `thread_safe` feature serializes all FFI calls behind a mutex.
struct SyncPdfium(Pdfium);

// SAFETY: the `thread_safe` feature makes the underlying pdfium calls
// mutually exclusive, so sharing the instance across threads is sound.
unsafe impl Send for SyncPdfium {}
unsafe impl Sync for SyncPdfium {}

static PDFIUM_INSTANCE: OnceLock<std::result::Result<SyncPdfium, String>> = OnceLock::new();

/// Bind to the pdfium dynamic library once per process. A load failure is
/// cached too, so every PDF on a host without pdfium fails fast with the
/// same message.
fn load_pdfium() -> Result<&'static Pdfium> {
    PDFIUM_INSTANCE
        .get_or_init(init_pdfium)
        .as_ref()
        .map(|sp| &sp.0)
        .map_err(|e| Error::Pdf(e.clone()))
}

fn init_pdfium() -> std::result::Result<SyncPdfium, String> {
    if let Ok(dir) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        let lib_path = std::path::Path::new(&dir).join(Pdfium::pdfium_platform_library_name());
        if lib_path.exists() {
            match Pdfium::bind_to_library(&lib_path) {
                Ok(bindings) => {
                    info!(path = %lib_path.display(), "using pdfium from PDFIUM_DYNAMIC_LIB_PATH");
                    return Ok(SyncPdfium(Pdfium::new(bindings)));
                }
                Err(e) => {
                    debug!(path = %lib_path.display(), error = ?e, "pdfium library path failed");
                }
            }
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => {
            info!("using system pdfium library");
            Ok(SyncPdfium(Pdfium::new(bindings)))
        }
        Err(e) => Err(format!(
            "pdfium library not found; install libpdfium or set PDFIUM_DYNAMIC_LIB_PATH ({:?})",
            e
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_fixture() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 2, image::Rgb([200, 10, 10]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_image_upload_passes_through_as_one_page() {
        let png = png_fixture();
        let pages = rasterize(&png, "scan.png").unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_number, 1);
        assert_eq!(pages[0].content_type, "image/png");
        assert_eq!(pages[0].bytes, png);
        assert_eq!((pages[0].width, pages[0].height), (4, 2));
    }

    #[test]
    fn test_format_sniffing_ignores_filename() {
        let png = png_fixture();
        let pages = rasterize(&png, "actually-a-png.pdf").unwrap();
        assert_eq!(pages[0].content_type, "image/png");
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let err = rasterize(b"hello, plain text", "notes.txt").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        let msg = err.to_string();
        assert!(msg.contains("notes.txt"));
    }

    #[test]
    fn test_detect_image_format_magic_bytes() {
        assert_eq!(
            detect_image_format(b"\xFF\xD8\xFF\xE0rest").map(|(m, _)| m),
            Some("image/jpeg")
        );
        assert_eq!(
            detect_image_format(b"RIFF\x00\x00\x00\x00WEBPVP8 ").map(|(m, _)| m),
            Some("image/webp")
        );
        assert_eq!(detect_image_format(b"%PDF-1.7"), None);
        assert_eq!(detect_image_format(b""), None);
    }
}
