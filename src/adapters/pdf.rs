//! Full-text extraction from open-access PDFs.
//!
//! Page text comes from lopdf's text extraction; embedded JPEG images
//! (DCTDecode XObjects) are written out as figures, captioned from
//! `Figure N` / `Fig. N` lines on the same page. Papers without a PDF, or
//! whose PDF cannot be used, fall back to the abstract.

use std::path::Path;

use async_trait::async_trait;
use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::{debug, info, warn};

use crate::config::PdfProcessingConfig;
use crate::core::error::CollaboratorError;
use crate::domain::{ExtractedContent, Figure, PaperRecord};

use super::{send_checked, ContentExtractor};

pub struct PdfExtractor {
    client: reqwest::Client,
    config: PdfProcessingConfig,
}

/// Text and figures parsed from one PDF
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPdf {
    pub text: String,
    pub figures: Vec<Figure>,
    pub page_count: usize,
}

impl PdfExtractor {
    pub fn new(client: reqwest::Client, config: PdfProcessingConfig) -> Self {
        Self { client, config }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, CollaboratorError> {
        let response = send_checked(self.client.get(url)).await?;

        if let Some(len) = response.content_length() {
            if len > self.config.max_pdf_bytes {
                return Err(CollaboratorError::InvalidInput(format!(
                    "PDF is {} bytes (limit {})",
                    len, self.config.max_pdf_bytes
                )));
            }
        }

        let bytes = response.bytes().await.map_err(super::classify_transport)?;
        Ok(bytes.to_vec())
    }

    /// Parse downloaded bytes, falling back to the abstract if allowed
    pub async fn extract_from_bytes(
        &self,
        paper: &PaperRecord,
        bytes: Vec<u8>,
        work_dir: &Path,
    ) -> Result<ExtractedContent, CollaboratorError> {
        let figures_dir = work_dir.join("figures");
        let keywords = self.config.caption_keywords.clone();

        let parsed = tokio::task::spawn_blocking(move || parse_pdf(&bytes, &figures_dir, &keywords))
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("PDF parser task failed: {}", e)))?;

        match parsed {
            Ok(parsed) if !parsed.text.trim().is_empty() => {
                info!(
                    paper_id = %paper.id,
                    pages = parsed.page_count,
                    figures = parsed.figures.len(),
                    "Extracted PDF content"
                );
                Ok(ExtractedContent {
                    text: parsed.text,
                    figures: parsed.figures,
                    abstract_only: false,
                })
            }
            Ok(_) => self.fallback(paper, CollaboratorError::Extraction("PDF has no text layer".into())),
            Err(e) => self.fallback(paper, e),
        }
    }

    fn fallback(
        &self,
        paper: &PaperRecord,
        cause: CollaboratorError,
    ) -> Result<ExtractedContent, CollaboratorError> {
        if !self.config.fallback_to_abstract {
            return Err(cause);
        }
        warn!(paper_id = %paper.id, error = %cause, "Falling back to abstract");
        abstract_only(paper)
    }
}

#[async_trait]
impl ContentExtractor for PdfExtractor {
    async fn extract(
        &self,
        paper: &PaperRecord,
        work_dir: &Path,
    ) -> Result<ExtractedContent, CollaboratorError> {
        let Some(ref url) = paper.pdf_url else {
            debug!(paper_id = %paper.id, "No open-access PDF, using abstract");
            return abstract_only(paper);
        };

        let bytes = match self.download(url).await {
            Ok(bytes) => bytes,
            // Worth another attempt
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => return self.fallback(paper, e),
        };

        self.extract_from_bytes(paper, bytes, work_dir).await
    }
}

fn abstract_only(paper: &PaperRecord) -> Result<ExtractedContent, CollaboratorError> {
    if paper.abstract_text.trim().is_empty() {
        return Err(CollaboratorError::Extraction(format!(
            "paper {} has neither full text nor an abstract",
            paper.id
        )));
    }
    Ok(ExtractedContent {
        text: paper.abstract_text.clone(),
        figures: Vec::new(),
        abstract_only: true,
    })
}

/// Parse a PDF, writing embedded JPEGs into `figures_dir`
pub fn parse_pdf(
    bytes: &[u8],
    figures_dir: &Path,
    caption_keywords: &[String],
) -> Result<ParsedPdf, CollaboratorError> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| CollaboratorError::Extraction(format!("unreadable PDF: {}", e)))?;

    let pages = doc.get_pages();
    let mut text = String::new();
    let mut figures = Vec::new();

    for (page_num, page_id) in &pages {
        let page_text = doc.extract_text(&[*page_num]).unwrap_or_default();
        let captions = find_captions(&page_text, caption_keywords);

        for (index, image) in page_jpegs(&doc, *page_id).into_iter().enumerate() {
            let id = format!("p{}-img{}", page_num, index + 1);
            let path = figures_dir.join(format!("{}.jpg", id));

            if let Err(e) = write_image(&path, &image.data) {
                warn!(figure = %id, error = %e, "Failed to write figure");
                continue;
            }

            figures.push(Figure {
                id,
                page: *page_num,
                caption: captions.get(index).cloned().unwrap_or_default(),
                image_path: path,
                width: image.width,
                height: image.height,
                quality_score: None,
            });
        }

        text.push_str(page_text.trim());
        text.push('\n');
    }

    Ok(ParsedPdf {
        text: text.trim().to_string(),
        figures,
        page_count: pages.len(),
    })
}

fn write_image(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)
}

/// Caption lines on a page, in reading order
pub fn find_captions(page_text: &str, keywords: &[String]) -> Vec<String> {
    page_text
        .lines()
        .map(str::trim)
        .filter(|line| {
            keywords.iter().any(|keyword| {
                line.strip_prefix(keyword.as_str())
                    .map(|rest| rest.trim_start().starts_with(|c: char| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
        .map(str::to_string)
        .collect()
}

struct PageImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match obj {
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn is_dct(filter: &Object) -> bool {
    match filter {
        Object::Name(name) => name.as_slice() == b"DCTDecode",
        Object::Array(filters) => filters.iter().any(is_dct),
        _ => false,
    }
}

/// JPEG image XObjects referenced from a page's own resources
fn page_jpegs(doc: &Document, page_id: ObjectId) -> Vec<PageImage> {
    let xobjects = doc
        .get_dictionary(page_id)
        .ok()
        .and_then(|page| page.get(b"Resources").ok())
        .and_then(|resources| resolve_dict(doc, resources))
        .and_then(|resources| resources.get(b"XObject").ok())
        .and_then(|xobjects| resolve_dict(doc, xobjects));

    let Some(xobjects) = xobjects else {
        return Vec::new();
    };

    let mut images = Vec::new();
    for (_, obj) in xobjects.iter() {
        let Ok(id) = obj.as_reference() else {
            continue;
        };
        let Ok(Object::Stream(stream)) = doc.get_object(id) else {
            continue;
        };

        let dict = &stream.dict;
        let is_image = dict
            .get(b"Subtype")
            .map(|subtype| matches!(subtype, Object::Name(name) if name.as_slice() == b"Image"))
            .unwrap_or(false);
        let is_jpeg = dict.get(b"Filter").map(is_dct).unwrap_or(false);
        if !is_image || !is_jpeg {
            continue;
        }

        let dimension = |key: &[u8]| {
            dict.get(key)
                .ok()
                .and_then(|v| v.as_i64().ok())
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0)
        };

        images.push(PageImage {
            width: dimension(b"Width"),
            height: dimension(b"Height"),
            data: stream.content.clone(),
        });
    }
    images
}
