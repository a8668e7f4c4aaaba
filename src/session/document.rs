use sha2::{Digest, Sha256};

use super::errors::SessionError;

/// Essay text as produced by the external extractor: plain text with
/// `[PAGE n]` markers between pages. The id is a content digest, so the same
/// essay keeps the same identity across runs and machines.
#[derive(Debug, Clone)]
pub(crate) struct EssayDocument {
    text: String,
    essay_id: String,
    page_count: usize,
}

impl EssayDocument {
    pub(crate) fn from_text(text: &str) -> Result<Self, SessionError> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Err(SessionError::Validation("document text is empty".to_string()));
        }

        let page_count = normalized.lines().filter(|line| is_page_marker(line)).count().max(1);
        let essay_id = content_digest(&normalized);

        Ok(Self { text: normalized, essay_id, page_count })
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn essay_id(&self) -> &str {
        &self.essay_id
    }

    pub(crate) fn page_count(&self) -> usize {
        self.page_count
    }
}

// Line endings vary by extractor platform; the digest must not.
fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

fn is_page_marker(line: &str) -> bool {
    let trimmed = line.trim();
    let Some(inner) = trimmed.strip_prefix("[PAGE ").and_then(|rest| rest.strip_suffix(']'))
    else {
        return false;
    };
    !inner.is_empty() && inner.chars().all(|ch| ch.is_ascii_digit())
}

fn content_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
