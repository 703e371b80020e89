//! Input document loading.
//!
//! Documents are read as text with invalid UTF-8 replaced, so a PDF whose
//! text layer is plain enough still yields its identifying markers. No
//! layout-aware extraction is attempted.

use crate::models::{PeruseError, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Read a document as text.
pub fn load(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .map_err(|e| PeruseError::io(format!("reading document {}", path.display()), e))?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    debug!(path = %path.display(), bytes = bytes.len(), chars = text.chars().count(), "Loaded document");
    Ok(text)
}

/// Read a document, or an empty string when it cannot be read.
///
/// Used where content is only a hint, such as identity resolution.
pub fn load_or_empty(path: &Path) -> String {
    load(path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Document unreadable, continuing without content");
        String::new()
    })
}
