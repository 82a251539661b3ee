//! nova_entities
//!
//! Rule-driven extraction of live-data entities from user text, canonical
//! resolution, and provider-backed validation with a bounded LRU cache.
//!
//! Extraction is linear scanning over tokens; no regex on user text.

use serde::{Deserialize, Serialize};

use nova_providers::DataCategory;

pub mod validate;

pub use validate::{EntityValidator, ValidationOutcome, ValidationStatus, ValidatorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Ticker,
    CryptoSymbol,
    CurrencyPair,
    Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    Ambiguous,
    Unresolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub raw_text: String,
    pub entity_type: EntityType,
    /// Invariant: `status == Resolved` iff this is Some.
    pub canonical_id: Option<String>,
    pub category: Option<DataCategory>,
    pub status: ResolutionStatus,
    pub resolution_confidence: f64,
}

impl ResolvedEntity {
    fn resolved(raw: &str, entity_type: EntityType, canonical: String, category: DataCategory, confidence: f64) -> Self {
        Self {
            raw_text: raw.to_string(),
            entity_type,
            canonical_id: Some(canonical),
            category: Some(category),
            status: ResolutionStatus::Resolved,
            resolution_confidence: confidence,
        }
    }

    fn unresolved(raw: &str, entity_type: EntityType) -> Self {
        Self {
            raw_text: raw.to_string(),
            entity_type,
            canonical_id: None,
            category: None,
            status: ResolutionStatus::Unresolved,
            resolution_confidence: 0.0,
        }
    }
}

// ----------------------------
// Alias tables
// ----------------------------

const COMPANY_ALIASES: &[(&str, &str)] = &[
    ("apple", "AAPL"),
    ("microsoft", "MSFT"),
    ("google", "GOOGL"),
    ("alphabet", "GOOGL"),
    ("amazon", "AMZN"),
    ("tesla", "TSLA"),
    ("nvidia", "NVDA"),
    ("meta", "META"),
    ("netflix", "NFLX"),
];

const CRYPTO_ALIASES: &[(&str, &str)] = &[
    ("bitcoin", "BTC"),
    ("btc", "BTC"),
    ("ethereum", "ETH"),
    ("eth", "ETH"),
    ("solana", "SOL"),
    ("sol", "SOL"),
    ("cardano", "ADA"),
    ("dogecoin", "DOGE"),
    ("doge", "DOGE"),
    ("ripple", "XRP"),
    ("xrp", "XRP"),
];

const CURRENCY_CODES: &[&str] = &[
    "USD", "EUR", "GBP", "JPY", "CHF", "CAD", "AUD", "NZD", "CNY", "INR", "SEK", "NOK", "MXN", "BRL", "KRW",
];

/// Common uppercase words that look like tickers but are not.
const TICKER_STOPWORDS: &[&str] = &["I", "A", "THE", "AND", "OR", "FOR", "TO", "IN", "ON", "AT", "IS", "IT", "USA", "CEO", "AI", "LLM", "API", "FAQ", "ETF", "IPO", "OK"];

fn is_currency_code(s: &str) -> bool {
    CURRENCY_CODES.contains(&s)
}

// ----------------------------
// Extraction + resolution
// ----------------------------

/// Extract and canonicalize every recognizable entity in one pass.
pub fn extract_entities(text: &str) -> Vec<ResolvedEntity> {
    let mut out: Vec<ResolvedEntity> = Vec::new();

    extract_dollar_tickers(text, &mut out);
    extract_currency_pairs(text, &mut out);
    extract_aliases(text, &mut out);
    extract_bare_tickers(text, &mut out);
    extract_locations(text, &mut out);

    // Deduplicate by (type, canonical) keeping the highest-confidence find.
    out.sort_by(|a, b| {
        (a.entity_type as u8, a.canonical_id.clone())
            .cmp(&(b.entity_type as u8, b.canonical_id.clone()))
            .then(b.resolution_confidence.partial_cmp(&a.resolution_confidence).unwrap_or(std::cmp::Ordering::Equal))
    });
    out.dedup_by(|a, b| a.entity_type == b.entity_type && a.canonical_id == b.canonical_id && a.canonical_id.is_some());
    out
}

/// `$AAPL` style: dollar sign followed by 1-5 uppercase letters.
fn extract_dollar_tickers(text: &str, out: &mut Vec<ResolvedEntity>) {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' {
            let mut sym = String::new();
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_ascii_uppercase() && sym.len() < 5 {
                sym.push(chars[j]);
                j += 1;
            }
            let boundary_ok = j >= chars.len() || !chars[j].is_ascii_alphanumeric();
            if !sym.is_empty() && boundary_ok {
                out.push(ResolvedEntity::resolved(
                    &format!("${sym}"),
                    EntityType::Ticker,
                    sym,
                    DataCategory::Market,
                    0.95,
                ));
                i = j;
                continue;
            }
        }
        i += 1;
    }
}

/// `USD/EUR`, `USDEUR`, and "usd to eur" forms.
fn extract_currency_pairs(text: &str, out: &mut Vec<ResolvedEntity>) {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for (idx, token) in tokens.iter().enumerate() {
        let cleaned: String = token.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '/').collect();
        let upper = cleaned.to_uppercase();

        // USD/EUR
        if let Some((a, b)) = upper.split_once('/') {
            if is_currency_code(a) && is_currency_code(b) && a != b {
                out.push(ResolvedEntity::resolved(
                    token,
                    EntityType::CurrencyPair,
                    format!("{a}/{b}"),
                    DataCategory::Fx,
                    0.95,
                ));
                continue;
            }
        }
        // USDEUR
        if upper.len() == 6 && upper.chars().all(|c| c.is_ascii_uppercase()) {
            let (a, b) = upper.split_at(3);
            if is_currency_code(a) && is_currency_code(b) && a != b {
                out.push(ResolvedEntity::resolved(
                    token,
                    EntityType::CurrencyPair,
                    format!("{a}/{b}"),
                    DataCategory::Fx,
                    0.85,
                ));
                continue;
            }
        }
        // "usd to eur"
        if idx + 2 < tokens.len() && tokens[idx + 1].eq_ignore_ascii_case("to") {
            let a = upper.clone();
            let b: String = tokens[idx + 2]
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .collect::<String>()
                .to_uppercase();
            if is_currency_code(&a) && is_currency_code(&b) && a != b {
                out.push(ResolvedEntity::resolved(
                    &format!("{} to {}", token, tokens[idx + 2]),
                    EntityType::CurrencyPair,
                    format!("{a}/{b}"),
                    DataCategory::Fx,
                    0.9,
                ));
            }
        }
    }
}

/// Company and crypto alias tables.
fn extract_aliases(text: &str, out: &mut Vec<ResolvedEntity>) {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    for token in &tokens {
        for (alias, symbol) in COMPANY_ALIASES {
            if token == alias {
                out.push(ResolvedEntity::resolved(token, EntityType::Ticker, symbol.to_string(), DataCategory::Market, 0.9));
            }
        }
        for (alias, symbol) in CRYPTO_ALIASES {
            if token == alias {
                out.push(ResolvedEntity::resolved(token, EntityType::CryptoSymbol, symbol.to_string(), DataCategory::Crypto, 0.9));
            }
        }
    }
}

/// Bare uppercase tokens 2-5 chars reading as tickers, low confidence.
fn extract_bare_tickers(text: &str, out: &mut Vec<ResolvedEntity>) {
    for token in text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '$')) {
        if token.starts_with('$') || token.is_empty() {
            continue;
        }
        let is_upper_run = token.len() >= 2
            && token.len() <= 5
            && token.chars().all(|c| c.is_ascii_uppercase());
        if !is_upper_run || TICKER_STOPWORDS.contains(&token) || is_currency_code(token) {
            continue;
        }
        // Crypto symbols read as crypto, not equities.
        if CRYPTO_ALIASES.iter().any(|(_, s)| *s == token) {
            out.push(ResolvedEntity::resolved(token, EntityType::CryptoSymbol, token.to_string(), DataCategory::Crypto, 0.7));
        } else {
            out.push(ResolvedEntity::resolved(token, EntityType::Ticker, token.to_string(), DataCategory::Market, 0.6));
        }
    }
}

/// "weather in <place>" / "temperature in <place>" phrases.
///
/// Cues are matched case-insensitively against the original text so the
/// extracted byte spans stay valid even when the message mixes in characters
/// whose lowercase form changes byte length.
fn extract_locations(text: &str, out: &mut Vec<ResolvedEntity>) {
    for cue in ["weather in ", "temperature in ", "forecast for ", "how hot is it in ", "how cold is it in "] {
        let Some(pos) = find_ascii_ci(text, cue) else {
            continue;
        };
        let start = pos + cue.len();
        let tail = &text[start..];
        let end = tail
            .find(|c: char| c == '?' || c == '!' || c == '.' || c == ',' || c == '\n')
            .unwrap_or(tail.len());
        let place = tail[..end].trim();
        if place.is_empty() || place.len() > 60 {
            continue;
        }
        let canonical = place.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
        out.push(ResolvedEntity::resolved(place, EntityType::Location, canonical, DataCategory::Weather, 0.85));
    }
}

/// First ASCII-case-insensitive occurrence of `needle` (ASCII lowercase) in
/// `haystack`, as a byte offset into `haystack`. A full byte-wise match of an
/// ASCII needle is necessarily boundary-aligned, so the offset is safe to
/// slice with regardless of surrounding multi-byte characters.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || h.len() < n.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| {
        h[i..i + n.len()]
            .iter()
            .zip(n)
            .all(|(a, b)| a.to_ascii_lowercase() == *b)
    })
}
