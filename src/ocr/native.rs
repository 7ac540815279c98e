//! Embedded text layer extraction with lopdf.
//!
//! Two strictness levels are tried: the document as loaded with font-aware
//! extraction, then repaired bytes with a raw content-stream string scan for
//! pages the font-aware path cannot handle. A page that fails is kept as a
//! placeholder and the remaining pages are still extracted.

use std::sync::Arc;

use lopdf::content::Content;
use lopdf::{Document, Object};
use tracing::{debug, info, warn};

use crate::document::{BackendId, DocumentRef, ExtractedText};
use crate::error::BackendError;
use crate::store::{load_document, BlobStore};

pub const EMPTY_PAGE: &str = "[No text on this page]";

#[derive(Debug, Clone, PartialEq)]
enum PageText {
    Text(String),
    Empty,
    Failed,
}

impl PageText {
    fn from_extracted(text: String) -> Self {
        if text.trim().is_empty() {
            Self::Empty
        } else {
            Self::Text(text)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strictness {
    Strict,
    Lenient,
}

#[derive(Debug)]
struct LevelResult {
    level: Strictness,
    pages: Vec<PageText>,
}

impl LevelResult {
    fn failed(&self) -> usize {
        self.pages.iter().filter(|p| **p == PageText::Failed).count()
    }

    fn all_failed(&self) -> bool {
        !self.pages.is_empty() && self.failed() == self.pages.len()
    }
}

/// Text of a parsed PDF with one section per page.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPdf {
    pub text: String,
    pub pages: u32,
    pub failed_pages: usize,
}

pub struct NativeTextLayer {
    store: Arc<dyn BlobStore>,
}

impl NativeTextLayer {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn extract(&self, doc: &DocumentRef) -> Result<ExtractedText, BackendError> {
        let data = load_document(doc, self.store.as_ref()).await?;
        let parsed = parse_in_background(data).await?;
        info!(
            "NativeTextLayer: {} pages, {} failed, {} chars from {}",
            parsed.pages,
            parsed.failed_pages,
            parsed.text.len(),
            doc.display_name()
        );
        Ok(ExtractedText::new(parsed.text, BackendId::NativeText).with_pages(Some(parsed.pages)))
    }
}

/// Run [`parse_pdf`] on the blocking pool.
pub async fn parse_in_background(data: Arc<[u8]>) -> Result<ParsedPdf, BackendError> {
    tokio::task::spawn_blocking(move || parse_pdf(&data))
        .await
        .map_err(|e| BackendError::fatal("ParserPanicked", e.to_string()))?
}

pub fn parse_pdf(data: &[u8]) -> Result<ParsedPdf, BackendError> {
    let strict = strict_level(data);
    if let Some(result) = &strict {
        if result.failed() == 0 {
            return assemble(result);
        }
        warn!(
            "NativeTextLayer: {} of {} pages failed strict parsing, trying lenient",
            result.failed(),
            result.pages.len()
        );
    } else {
        warn!("NativeTextLayer: strict load failed, trying lenient");
    }

    let lenient = lenient_level(data);
    let best = match (strict, lenient) {
        (Some(s), Some(l)) => {
            if l.failed() < s.failed() {
                l
            } else {
                s
            }
        }
        (Some(s), None) => s,
        (None, Some(l)) => l,
        (None, None) => {
            return Err(BackendError::fatal(
                "MalformedDocument",
                "document could not be loaded at any strictness level",
            ))
        }
    };
    debug!("NativeTextLayer: using {:?} level", best.level);
    assemble(&best)
}

fn assemble(result: &LevelResult) -> Result<ParsedPdf, BackendError> {
    if result.all_failed() {
        return Err(BackendError::fatal(
            "MalformedDocument",
            format!("text extraction failed on all {} pages", result.pages.len()),
        ));
    }
    if !result.pages.iter().any(|p| matches!(p, PageText::Text(_))) {
        return Err(BackendError::LowQuality(
            "document has no embedded text layer".to_string(),
        ));
    }

    let sections: Vec<String> = result
        .pages
        .iter()
        .enumerate()
        .map(|(i, page)| {
            let number = i + 1;
            let body = match page {
                PageText::Text(text) => text.trim_end().to_string(),
                PageText::Empty => EMPTY_PAGE.to_string(),
                PageText::Failed => format!("[Error extracting text from page {}]", number),
            };
            format!("--- Page {} ---\n{}", number, body)
        })
        .collect();

    Ok(ParsedPdf {
        text: sections.join("\n\n"),
        pages: result.pages.len() as u32,
        failed_pages: result.failed(),
    })
}

fn strict_level(data: &[u8]) -> Option<LevelResult> {
    let doc = match Document::load_mem(data) {
        Ok(doc) => doc,
        Err(e) => {
            debug!("NativeTextLayer: strict load error: {}", e);
            return None;
        }
    };

    let pages = doc
        .get_pages()
        .into_keys()
        .map(|number| match doc.extract_text(&[number]) {
            Ok(text) => PageText::from_extracted(text),
            Err(e) => {
                debug!("NativeTextLayer: strict page {} failed: {}", number, e);
                PageText::Failed
            }
        })
        .collect();

    Some(LevelResult {
        level: Strictness::Strict,
        pages,
    })
}

fn lenient_level(data: &[u8]) -> Option<LevelResult> {
    let repaired = repair(data);
    let doc = match Document::load_mem(repaired) {
        Ok(doc) => doc,
        Err(e) => {
            debug!("NativeTextLayer: lenient load error: {}", e);
            return None;
        }
    };

    let pages = doc
        .get_pages()
        .into_iter()
        .map(|(number, page_id)| {
            let font_aware = doc.extract_text(&[number]).ok().map(PageText::from_extracted);
            match font_aware {
                Some(PageText::Text(text)) => PageText::Text(text),
                font_aware => match doc
                    .get_page_content(page_id)
                    .map_err(|e| e.to_string())
                    .and_then(|raw| scan_content_strings(&raw))
                {
                    Ok(text) => PageText::from_extracted(text),
                    Err(e) => {
                        debug!("NativeTextLayer: lenient page {} failed: {}", number, e);
                        font_aware.unwrap_or(PageText::Failed)
                    }
                },
            }
        })
        .collect();

    Some(LevelResult {
        level: Strictness::Lenient,
        pages,
    })
}

/// Drop junk before the `%PDF-` header and after the last `%%EOF` marker.
fn repair(data: &[u8]) -> &[u8] {
    let start = find(data, b"%PDF-").unwrap_or(0);
    let data = &data[start..];
    match rfind(data, b"%%EOF") {
        Some(end) => &data[..end + b"%%EOF".len()],
        None => data,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Collect the string operands of text-showing operators without font decoding.
fn scan_content_strings(raw: &[u8]) -> Result<String, String> {
    let content = Content::decode(raw).map_err(|e| e.to_string())?;
    let mut text = String::new();

    for op in &content.operations {
        match op.operator.as_str() {
            "Tj" | "'" | "\"" => {
                if let Some(Object::String(bytes, _)) = op.operands.last() {
                    text.push_str(&decode_pdf_string(bytes));
                }
            }
            "TJ" => {
                if let Some(Object::Array(parts)) = op.operands.first() {
                    for part in parts {
                        if let Object::String(bytes, _) = part {
                            text.push_str(&decode_pdf_string(bytes));
                        }
                    }
                }
            }
            "T*" | "Td" | "TD" | "ET" => {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
            }
            _ => {}
        }
    }
    Ok(text)
}

/// UTF-16BE when it carries a byte-order mark, otherwise one char per byte.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{FsBlobStore, Locator};
    use lopdf::content::Operation;
    use lopdf::{dictionary, Stream};

    /// In-memory PDF with one text line per page; empty strings make blank pages.
    pub(crate) fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
        pdf_from_operations(pages.iter().map(|text| text_line(text, "F1".into())).collect())
    }

    fn text_line(text: &str, font: Object) -> Vec<Operation> {
        if text.is_empty() {
            return Vec::new();
        }
        vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![font, 12.into()]),
            Operation::new("Td", vec![72.into(), 720.into()]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ]
    }

    /// In-memory PDF with one page per operation list, sharing a Courier font as `F1`.
    fn pdf_from_operations(pages: Vec<Vec<Operation>>) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
            "Encoding" => "WinAnsiEncoding",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        });

        let mut kids: Vec<Object> = Vec::new();
        for operations in pages {
            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
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
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_pages_get_headers_and_placeholders() {
        let data = pdf_with_pages(&["Management assertion", "", "Control testing results"]);
        let parsed = parse_pdf(&data).unwrap();

        assert_eq!(parsed.pages, 3);
        assert_eq!(parsed.failed_pages, 0);
        assert!(parsed.text.starts_with("--- Page 1 ---\n"));
        assert!(parsed.text.contains("Management assertion"));
        assert!(parsed.text.contains("--- Page 2 ---\n[No text on this page]"));
        assert!(parsed.text.contains("Control testing results"));
    }

    #[test]
    fn test_failed_page_gets_placeholder_beside_good_page() {
        let result = LevelResult {
            level: Strictness::Strict,
            pages: vec![PageText::Text("Good page".to_string()), PageText::Failed],
        };
        let parsed = assemble(&result).unwrap();

        assert_eq!(parsed.pages, 2);
        assert_eq!(parsed.failed_pages, 1);
        assert!(parsed.text.contains("--- Page 1 ---\nGood page"));
        assert!(parsed.text.contains("--- Page 2 ---\n[Error extracting text from page 2]"));
    }

    #[test]
    fn test_every_page_failed_is_fatal() {
        let result = LevelResult {
            level: Strictness::Lenient,
            pages: vec![PageText::Failed, PageText::Failed],
        };
        let err = assemble(&result).unwrap_err();
        assert_eq!(err.detail().code, "MalformedDocument");
    }

    #[test]
    fn test_page_failing_strict_parse_is_recovered_leniently() {
        // A numeric font operand makes font-aware extraction fail on page 2 only.
        let data = pdf_from_operations(vec![
            text_line("Independent auditor's report", "F1".into()),
            text_line("Exceptions noted", 12.into()),
        ]);

        let strict = strict_level(&data).unwrap();
        assert!(matches!(strict.pages[0], PageText::Text(_)));
        assert!(matches!(strict.pages[1], PageText::Failed));

        let parsed = parse_pdf(&data).unwrap();
        assert_eq!(parsed.pages, 2);
        assert_eq!(parsed.failed_pages, 0);
        assert!(parsed.text.contains("Independent auditor's report"));
        assert!(parsed.text.contains("--- Page 2 ---\nExceptions noted"));
    }

    #[test]
    fn test_blank_document_is_low_quality() {
        let data = pdf_with_pages(&["", ""]);
        let err = parse_pdf(&data).unwrap_err();
        assert!(matches!(err, BackendError::LowQuality(_)));
    }

    #[test]
    fn test_unloadable_document_is_fatal() {
        let err = parse_pdf(b"%PDF-1.4\nthis is not a pdf body").unwrap_err();
        assert_eq!(err.outcome(), crate::document::AttemptOutcome::Fatal);
        assert_eq!(err.detail().code, "MalformedDocument");
    }

    #[test]
    fn test_leading_and_trailing_junk_is_tolerated() {
        let mut data = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        data.extend(pdf_with_pages(&["Recovered after repair"]));
        data.extend_from_slice(b"\ntrailing garbage");

        let parsed = parse_pdf(&data).unwrap();
        assert!(parsed.text.contains("Recovered after repair"));
    }

    #[test]
    fn test_repair_trims_to_markers() {
        assert_eq!(repair(b"junk%PDF-1.4 body %%EOF tail"), b"%PDF-1.4 body %%EOF");
        assert_eq!(repair(b"%PDF-1.4 no end"), b"%PDF-1.4 no end");
    }

    #[test]
    fn test_raw_scan_reads_tj_and_tj_arrays() {
        let text = scan_content_strings(b"BT /F1 12 Tf (Hello) Tj 0 -14 Td [(Wor) -20 (ld)] TJ ET").unwrap();
        assert_eq!(text, "Hello\nWorld\n");
    }

    #[test]
    fn test_decode_utf16_strings() {
        assert_eq!(decode_pdf_string(&[0xFE, 0xFF, 0x00, 0x41, 0x00, 0xE9]), "Aé");
        assert_eq!(decode_pdf_string(b"plain"), "plain");
    }

    #[tokio::test]
    async fn test_extract_stored_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsBlobStore::new(dir.path()));
        let loc = Locator::new("uploads", "acme.pdf");
        store
            .put(&loc, &pdf_with_pages(&["Type II report"]), "application/pdf")
            .await
            .unwrap();

        let text = NativeTextLayer::new(store)
            .extract(&DocumentRef::stored(loc))
            .await
            .unwrap();
        assert_eq!(text.source_backend, BackendId::NativeText);
        assert_eq!(text.page_count, Some(1));
        assert!(text.content.contains("Type II report"));
    }

    #[tokio::test]
    async fn test_missing_object_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsBlobStore::new(dir.path()));

        let err = NativeTextLayer::new(store)
            .extract(&DocumentRef::stored(Locator::new("uploads", "none.pdf")))
            .await
            .unwrap_err();
        assert_eq!(err.detail().code, "NoSuchKey");
    }
}
