//! PDF rendering tests. Rendering binds to the pdfium dynamic library, so
//! the tests that exercise it are ignored by default; run them with
//! `cargo test -- --ignored` on a host with libpdfium installed (or with
//! `PDFIUM_DYNAMIC_LIB_PATH` set).

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};

use folio::error::Error;
use folio::rasterize::rasterize;

/// Build a minimal A4 PDF with `page_count` pages of one line of text each.
fn minimal_pdf(page_count: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for i in 0..page_count {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 36.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new(
                    "Tj",
                    vec![Object::string_literal(format!("Page {}", i + 1))],
                ),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().unwrap(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

#[test]
fn test_garbage_pdf_is_an_error() {
    // Fails on the pdfium parse, or earlier on hosts without the library.
    let err = rasterize(b"%PDF-1.5 junk that is not a document", "junk.pdf").unwrap_err();
    assert!(matches!(err, Error::Pdf(_)), "got: {}", err);
}

#[test]
#[ignore = "requires system libpdfium"]
fn test_pdf_renders_one_jpeg_per_page() {
    let pdf = minimal_pdf(3);
    let pages = rasterize(&pdf, "three.pdf").unwrap();

    assert_eq!(pages.len(), 3);
    for (i, page) in pages.iter().enumerate() {
        assert_eq!(page.page_number, (i + 1) as i64);
        assert_eq!(page.content_type, "image/jpeg");
        assert!(page.bytes.starts_with(b"\xFF\xD8\xFF"), "not a JPEG stream");
    }
}

#[test]
#[ignore = "requires system libpdfium"]
fn test_pdf_renders_at_target_width() {
    let pdf = minimal_pdf(1);
    let pages = rasterize(&pdf, "one.pdf").unwrap();

    // 300 DPI over a 8.5in letter width; height follows the aspect ratio
    // and stays under the 14in cap.
    assert_eq!(pages[0].width, 2550);
    assert!(pages[0].height > 0);
    assert!(pages[0].height <= 4200);
}
