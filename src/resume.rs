//! Résumé file handling for the analysis upload: type validation and loading.

use std::path::Path;

use crate::error::ChatError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOC: &str = "application/msword";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// MIME types accepted for résumé analysis.
pub const ALLOWED_MIME_TYPES: &[&str] = &[MIME_PDF, MIME_DOC, MIME_DOCX];

/// File extensions accepted for résumé analysis (lowercase, with dot).
pub const ALLOWED_EXTENSIONS: &[&str] = &[".pdf", ".doc", ".docx"];

/// Multipart form field the backend reads the upload from.
pub const RESUME_FORM_FIELD: &str = "resume";

const REJECTION: &str =
    "Please select a PDF or Word file (.pdf, .doc, .docx) for resume analysis.";

/// An in-memory résumé ready to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeFile {
    pub name: String,
    /// Declared MIME type, if the caller knows one.
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

impl ResumeFile {
    pub fn new(name: impl Into<String>, mime: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime,
            bytes,
        }
    }

    /// Read a résumé from disk. The file is validated before it is read.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ChatError::Validation(format!("not a file: {}", path.display())))?;
        let candidate = ResumeFile::new(name, None, Vec::new());
        candidate.validate()?;
        let bytes = tokio::fs::read(path).await?;
        Ok(ResumeFile { bytes, ..candidate })
    }

    /// Accept the file if either its MIME type or its extension is allowed.
    pub fn validate(&self) -> Result<(), ChatError> {
        let mime_ok = self
            .mime
            .as_deref()
            .is_some_and(|m| ALLOWED_MIME_TYPES.contains(&m));
        let lower = self.name.to_lowercase();
        let ext_ok = ALLOWED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext));
        if mime_ok || ext_ok {
            Ok(())
        } else {
            Err(ChatError::Validation(REJECTION.to_string()))
        }
    }

    /// MIME type to send: the declared one, else inferred from the extension.
    pub fn content_type(&self) -> &str {
        if let Some(m) = self.mime.as_deref() {
            return m;
        }
        let lower = self.name.to_lowercase();
        if lower.ends_with(".pdf") {
            MIME_PDF
        } else if lower.ends_with(".docx") {
            MIME_DOCX
        } else if lower.ends_with(".doc") {
            MIME_DOC
        } else {
            "application/octet-stream"
        }
    }
}
