//! Document text extraction
//!
//! - **pdf**: text layer via `pdf-extract`
//! - **docx**: `<w:t>` runs of `word/document.xml`, one line per paragraph
//! - **txt / csv**: UTF-8 as-is
//! - **png / jpg / jpeg**: the gateway's vision call
//!
//! An empty result is valid and left to the caller to handle.

use std::io::{Cursor, Read};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use lendscope_core::CompletionGateway;
use regex::Regex;

use crate::error::ExtractError;

static PARAGRAPH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<w:p[ >].*?</w:p>").expect("valid paragraph regex"));
static TEXT_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>").expect("valid text run regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Png,
    Jpeg,
    Docx,
    Txt,
    Csv,
}

impl DocumentFormat {
    pub const ACCEPTED: &'static str = "pdf, png, jpg, jpeg, docx, txt, csv";

    /// Format by file extension, case-insensitive.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "png" => Some(DocumentFormat::Png),
            "jpg" | "jpeg" => Some(DocumentFormat::Jpeg),
            "docx" => Some(DocumentFormat::Docx),
            "txt" => Some(DocumentFormat::Txt),
            "csv" => Some(DocumentFormat::Csv),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "application/pdf",
            DocumentFormat::Png => "image/png",
            DocumentFormat::Jpeg => "image/jpeg",
            DocumentFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            DocumentFormat::Txt => "text/plain",
            DocumentFormat::Csv => "text/csv",
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, DocumentFormat::Png | DocumentFormat::Jpeg)
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, bytes: &[u8], filename: &str) -> Result<String, ExtractError>;
}

/// Extractor for every accepted upload format.
pub struct DocumentExtractor {
    gateway: Arc<dyn CompletionGateway>,
}

impl DocumentExtractor {
    pub fn new(gateway: Arc<dyn CompletionGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl TextExtractor for DocumentExtractor {
    async fn extract_text(&self, bytes: &[u8], filename: &str) -> Result<String, ExtractError> {
        let format = DocumentFormat::from_filename(filename)
            .ok_or_else(|| ExtractError::Unsupported(filename.to_string()))?;

        let text = match format {
            DocumentFormat::Pdf => {
                let owned = bytes.to_vec();
                tokio::task::spawn_blocking(move || pdf_text(&owned))
                    .await
                    .map_err(|e| ExtractError::Task(e.to_string()))??
            }
            DocumentFormat::Docx => docx_text(bytes)?,
            DocumentFormat::Txt | DocumentFormat::Csv => {
                String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::Encoding)?
            }
            DocumentFormat::Png | DocumentFormat::Jpeg => {
                self.gateway.vision_extract_text(bytes, format.mime()).await?
            }
        };

        tracing::debug!(filename = %filename, chars = text.len(), "Extracted document text");
        Ok(text.trim().to_string())
    }
}

fn pdf_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let raw = pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n"))
}

fn docx_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Docx(e.to_string()))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::Docx(e.to_string()))?
        .read_to_string(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    Ok(docx_xml_text(&xml))
}

/// Paragraph text from a WordprocessingML body.
fn docx_xml_text(xml: &str) -> String {
    PARAGRAPH_RE
        .find_iter(xml)
        .map(|p| {
            TEXT_RUN_RE
                .captures_iter(p.as_str())
                .filter_map(|c| c.get(1))
                .map(|m| decode_entities(m.as_str()))
                .collect::<String>()
        })
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
