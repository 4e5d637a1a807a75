use crate::models::Referral;

pub const MAX_DOCUMENT_CHARS: usize = 3_000;
pub const MAX_DOCUMENTS: usize = 1;

/// Bounds how much referral content leaves the process in a single request.
#[derive(Debug, Clone, Copy)]
pub struct PayloadSanitizer {
    max_document_chars: usize,
}

impl PayloadSanitizer {
    pub fn new(max_document_chars: usize) -> Self {
        Self { max_document_chars }
    }

    /// Returns a deep copy keeping only the first document, with its text cut
    /// to `max_document_chars` characters. Never fails.
    pub fn sanitize(&self, referral: &Referral) -> Referral {
        let mut sanitized = referral.clone();
        sanitized.documents.truncate(MAX_DOCUMENTS);
        for document in &mut sanitized.documents {
            truncate_chars_in_place(&mut document.text, self.max_document_chars);
        }
        sanitized
    }
}

impl Default for PayloadSanitizer {
    fn default() -> Self {
        Self::new(MAX_DOCUMENT_CHARS)
    }
}

/// Truncates on a character boundary, never inside a multi-byte sequence.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

fn truncate_chars_in_place(text: &mut String, max_chars: usize) {
    let keep = truncate_chars(text, max_chars).len();
    text.truncate(keep);
}
