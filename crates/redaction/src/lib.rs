//! nova_redaction
//!
//! Security boundary with two distinct duties:
//! - Redaction (for logs/errors): fixed catalogue of secret/PII shapes,
//!   replaced with `[XXX_REDACTED]` markers. Deterministic and idempotent.
//! - Prompt sanitization: unicode normalization + token-based detection of
//!   suspicious patterns across eight categories.
//!
//! IMPORTANT:
//! - No backtracking regex on untrusted text. Everything here is a linear
//!   scanner or a token-window match, O(tokens x patterns).
//! - Redaction MUST be idempotent: redact(redact(s)) == redact(s).

use unicode_normalization::UnicodeNormalization;

pub mod redact;
pub mod sanitize;

pub use redact::{redact_text, redact_url, redact_value};
pub use sanitize::{
    PatternCategory, PatternHit, PatternMatchMode, PatternSeverity, PromptSanitizer,
    SanitizationResult, SanitizerConfig,
};

/// Field names whose values are always redacted, regardless of content.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "passphrase",
    "secret",
    "token",
    "access_token",
    "refresh_token",
    "api_key",
    "apikey",
    "authorization",
    "cookie",
    "session",
    "private_key",
    "encryption_key",
    "jwt",
    "credit_card",
    "ssn",
];

/// Query parameters whose values are always redacted in URLs.
pub const SENSITIVE_QUERY_PARAMS: &[&str] =
    &["key", "api_key", "apikey", "token", "access_token", "secret", "authorization", "signature"];

/// Normalize untrusted text: NFC, strip control chars (keep \t \n), strip
/// null bytes, enforce the length cap. First step of sanitization, also used
/// standalone by boundary validators.
pub fn normalize_input(text: &str, max_len: usize) -> (String, bool) {
    let mut modified = false;
    let nfc: String = text.nfc().collect();
    if nfc != text {
        modified = true;
    }
    let mut out = String::with_capacity(nfc.len().min(max_len));
    for ch in nfc.chars() {
        if ch == '\0' || (ch.is_control() && ch != '\t' && ch != '\n') {
            modified = true;
            continue;
        }
        out.push(ch);
    }
    if out.chars().count() > max_len {
        out = out.chars().take(max_len).collect();
        modified = true;
    }
    (out, modified)
}
