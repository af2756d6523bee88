//! Document source: pre-parsed documents from a directory.
//!
//! `.txt` and `.md` files are split into pages on form feeds. `.json` files
//! are page dumps produced by an external parser:
//!
//! ```json
//! {"parse_method": "ocr", "pages": [{"page_number": 1, "text": "...", "image": "p1.png"}]}
//! ```
//!
//! A bare array of pages is accepted too. Image paths are resolved against the
//! dump's directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyextract_core::{NewDocument, Page};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::PipelineError;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md"];

#[derive(Deserialize)]
#[serde(untagged)]
enum PageDump {
    Document {
        #[serde(default)]
        parse_method: Option<String>,
        pages: Vec<DumpPage>,
    },
    Pages(Vec<DumpPage>),
}

#[derive(Deserialize)]
struct DumpPage {
    #[serde(default)]
    page_number: Option<u32>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    image: Option<String>,
}

/// Parse `{broker}：{title}_{authors}_{category}_{date}` style file names.
///
/// The broker prefix is optional and may use a full-width or ASCII colon. The
/// rest is split from the right on `_` into at most four parts; with fewer
/// parts the trailing keys are left out, and without any `_` the whole name
/// is the title.
pub fn filename_metadata(filename: &str) -> BTreeMap<String, String> {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let mut meta = BTreeMap::new();

    let rest = match stem.split_once('：').or_else(|| stem.split_once(':')) {
        Some((broker, rest)) => {
            meta.insert("broker".to_string(), broker.trim().to_string());
            rest.trim()
        }
        None => stem,
    };

    let mut segments: Vec<&str> = rest.rsplitn(4, '_').collect();
    segments.reverse();
    let keys: &[&str] = match segments.len() {
        4 => &["title", "authors", "category", "date"],
        3 => &["title", "authors", "category"],
        2 => &["title", "authors"],
        _ => {
            meta.insert("title".to_string(), rest.to_string());
            return meta;
        }
    };
    for (key, value) in keys.iter().zip(segments) {
        meta.insert(key.to_string(), value.trim().to_string());
    }
    meta
}

/// Hex SHA-256 of a file's content.
pub fn content_hash(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

/// Read one document file. Returns `None` for unsupported extensions.
pub fn read_document(path: &Path) -> Result<Option<NewDocument>, PipelineError> {
    let Some(ext) = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) else {
        return Ok(None);
    };
    let is_text = TEXT_EXTENSIONS.contains(&ext.as_str());
    if !is_text && ext != "json" {
        return Ok(None);
    }

    let bytes = std::fs::read(path).map_err(|e| PipelineError::io(path.display().to_string(), e))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let (pages, parse_method) = if is_text {
        let text = String::from_utf8_lossy(&bytes);
        (split_pages(&text), "text".to_string())
    } else {
        let dump: PageDump = match serde_json::from_slice(&bytes) {
            Ok(dump) => dump,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping JSON file that is not a page dump");
                return Ok(None);
            }
        };
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let (parse_method, raw) = match dump {
            PageDump::Document { parse_method, pages } => {
                (parse_method.unwrap_or_else(|| "json".to_string()), pages)
            }
            PageDump::Pages(pages) => ("json".to_string(), pages),
        };
        (dump_pages(raw, &base), parse_method)
    };

    Ok(Some(NewDocument {
        file_hash: content_hash(&bytes),
        metadata: filename_metadata(&filename),
        filename,
        source_path: path.display().to_string(),
        pages,
        parse_method,
    }))
}

fn dump_pages(raw: Vec<DumpPage>, base: &Path) -> Vec<Page> {
    raw.into_iter()
        .enumerate()
        .map(|(idx, p)| Page {
            page_number: p.page_number.unwrap_or(idx as u32 + 1),
            text: p.text,
            image: p.image.map(|img| base.join(img).display().to_string()),
        })
        .collect()
}

fn split_pages(text: &str) -> Vec<Page> {
    let mut pages: Vec<Page> = text
        .split('\x0c')
        .filter(|chunk| !chunk.trim().is_empty())
        .enumerate()
        .map(|(idx, chunk)| Page::new(idx as u32 + 1, chunk.trim()))
        .collect();
    if pages.is_empty() {
        pages.push(Page::new(1, ""));
    }
    pages
}

/// Read every supported document under `input` (a file or a directory,
/// non-recursive), in file-name order.
pub fn read_documents(input: &Path) -> Result<Vec<NewDocument>, PipelineError> {
    let paths: Vec<PathBuf> = if input.is_dir() {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(input)
            .map_err(|e| PipelineError::io(input.display().to_string(), e))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        paths
    } else {
        vec![input.to_path_buf()]
    };

    let mut docs = Vec::new();
    for path in paths {
        match read_document(&path)? {
            Some(doc) => {
                debug!(file = %doc.filename, pages = doc.pages.len(), "read document");
                docs.push(doc);
            }
            None => debug!(path = %path.display(), "skipped unsupported file"),
        }
    }
    Ok(docs)
}

/// Render a page image as a `data:` URI for vision judging.
pub fn page_image_data_uri(page: &Page) -> Option<String> {
    let path = Path::new(page.image.as_deref()?);
    let mime = match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => return None,
    };
    match std::fs::read(path) {
        Ok(bytes) => Some(format!("data:{mime};base64,{}", STANDARD.encode(bytes))),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "page image unreadable");
            None
        }
    }
}
