//! Numeric leak guard.
//!
//! Scans the final natural-language answer for numeric literals and checks
//! each against exactly one allow rule:
//!  (i)  matches an evidence token within tolerance, with the token's
//!       context subject mentioned nearby;
//!  (ii) hits the fixed exemption table (small enumeration integers, years
//!       in contextual phrases);
//!  (iii) sits inside a verbatim quote of pack narrative evidence.
//! Anything else is a violation. Fail closed.

use serde::{Deserialize, Serialize};

use nova_evidence::EvidencePack;

/// Relative tolerance for token matching.
const REL_TOLERANCE: f64 = 0.005;
const ABS_TOLERANCE: f64 = 0.01;
/// How far around a literal we look for its context subject.
const CONTEXT_WINDOW_CHARS: usize = 80;

const SMALL_INT_MAX: f64 = 12.0;
const YEAR_MIN: f64 = 1900.0;
const YEAR_MAX: f64 = 2100.0;
const YEAR_CUES: &[&str] = &["in", "since", "by", "until", "from", "year", "of"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakVerdict {
    Pass,
    Violation,
    Exempted,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericLiteral {
    pub raw: String,
    pub value: f64,
    pub byte_start: usize,
    pub byte_end: usize,
    pub is_currency: bool,
    pub is_percent: bool,
    pub has_decimal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiteralRuling {
    TokenMatch,
    Exempt,
    QuotedEvidence,
    Violation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakFinding {
    pub literal: NumericLiteral,
    pub ruling: LiteralRuling,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakScan {
    pub verdict: LeakVerdict,
    pub findings: Vec<LeakFinding>,
}

impl LeakScan {
    pub fn violations(&self) -> impl Iterator<Item = &LeakFinding> {
        self.findings.iter().filter(|f| f.ruling == LiteralRuling::Violation)
    }
}

/// Scan one answer against the pack. Every literal gets a ruling.
pub fn scan_answer(answer: &str, pack: &EvidencePack) -> LeakScan {
    let literals = lex_numbers(answer);
    if literals.is_empty() {
        return LeakScan { verdict: LeakVerdict::Pass, findings: vec![] };
    }

    let mut findings = Vec::with_capacity(literals.len());
    for literal in literals {
        let ruling = rule_for(&literal, answer, pack);
        findings.push(ruling);
    }

    let any_violation = findings.iter().any(|f| f.ruling == LiteralRuling::Violation);
    let any_allowed = findings
        .iter()
        .any(|f| matches!(f.ruling, LiteralRuling::TokenMatch | LiteralRuling::QuotedEvidence));
    let verdict = if any_violation {
        LeakVerdict::Violation
    } else if any_allowed {
        LeakVerdict::Pass
    } else {
        LeakVerdict::Exempted
    };

    LeakScan { verdict, findings }
}

fn rule_for(literal: &NumericLiteral, answer: &str, pack: &EvidencePack) -> LeakFinding {
    // Rule (i): token match with subject mention in the context window.
    for token in &pack.tokens {
        if !value_matches(literal.value, token.value) {
            continue;
        }
        if subject_nearby(answer, literal, token.context_key.subject()) {
            return LeakFinding {
                literal: literal.clone(),
                ruling: LiteralRuling::TokenMatch,
                matched_key: Some(token.context_key.0.clone()),
            };
        }
    }

    // Rule (iii): verbatim quote of narrative evidence.
    if quoted_in_narrative(answer, literal, pack) {
        return LeakFinding { literal: literal.clone(), ruling: LiteralRuling::QuotedEvidence, matched_key: None };
    }

    // Rule (ii): fixed exemption table.
    if is_exempt(literal, answer) {
        return LeakFinding { literal: literal.clone(), ruling: LiteralRuling::Exempt, matched_key: None };
    }

    LeakFinding { literal: literal.clone(), ruling: LiteralRuling::Violation, matched_key: None }
}

fn value_matches(seen: f64, token: f64) -> bool {
    let diff = (seen - token).abs();
    diff <= ABS_TOLERANCE || diff <= token.abs() * REL_TOLERANCE
}

fn subject_nearby(answer: &str, literal: &NumericLiteral, subject: &str) -> bool {
    let window_start = answer[..literal.byte_start]
        .char_indices()
        .rev()
        .take(CONTEXT_WINDOW_CHARS)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    let window_end = {
        let tail = &answer[literal.byte_end..];
        let consumed: usize = tail.chars().take(CONTEXT_WINDOW_CHARS).map(char::len_utf8).sum();
        literal.byte_end + consumed
    };
    let window = answer[window_start..window_end].to_lowercase();
    let subject_lower = subject.to_lowercase();
    if window.contains(&subject_lower) {
        return true;
    }
    // Pair subjects like USD/EUR also match when both halves appear.
    if let Some((a, b)) = subject_lower.split_once('/') {
        return window.contains(a) && window.contains(b);
    }
    false
}

fn quoted_in_narrative(answer: &str, literal: &NumericLiteral, pack: &EvidencePack) -> bool {
    // The literal counts as quoted when it appears inside a quoted span of
    // the answer whose content is a verbatim substring of pack narrative.
    let before = &answer[..literal.byte_start];
    let after = &answer[literal.byte_end..];
    let Some(open) = before.rfind('"') else {
        return false;
    };
    let Some(close_rel) = after.find('"') else {
        return false;
    };
    let quoted = &answer[open + 1..literal.byte_end + close_rel];
    !quoted.is_empty() && pack.narrative_evidence.iter().any(|n| n.contains(quoted))
}

fn is_exempt(literal: &NumericLiteral, answer: &str) -> bool {
    if literal.is_currency || literal.is_percent {
        return false;
    }
    // Small integers read as enumeration, not data.
    if !literal.has_decimal && literal.value >= 0.0 && literal.value <= SMALL_INT_MAX {
        return true;
    }
    // Years, when phrased as years.
    if !literal.has_decimal
        && literal.raw.len() == 4
        && (YEAR_MIN..=YEAR_MAX).contains(&literal.value)
    {
        let before = answer[..literal.byte_start].to_lowercase();
        let tail: String = before.chars().rev().take(30).collect::<Vec<_>>().into_iter().rev().collect();
        return YEAR_CUES.iter().any(|cue| {
            tail.split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .any(|t| t == *cue)
        });
    }
    false
}

/// Replace violating literals with qualitative wording.
pub fn strip_violations(answer: &str, scan: &LeakScan) -> String {
    let mut spans: Vec<(usize, usize)> = scan
        .violations()
        .map(|f| (f.literal.byte_start, f.literal.byte_end))
        .collect();
    spans.sort();

    let mut out = String::with_capacity(answer.len());
    let mut cursor = 0;
    for (start, end) in spans {
        if start < cursor {
            continue;
        }
        out.push_str(&answer[cursor..start]);
        out.push_str("an up-to-date figure");
        cursor = end;
    }
    out.push_str(&answer[cursor..]);
    out
}

// ----------------------------
// Numeric lexer
// ----------------------------

/// Hand-rolled scan for numeric literals: `$1,234.56`, `42`, `3.5%`, `2024`.
pub fn lex_numbers(text: &str) -> Vec<NumericLiteral> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let starts_number = c.is_ascii_digit()
            || (c == '$' && i + 1 < bytes.len() && (bytes[i + 1] as char).is_ascii_digit());
        if !starts_number {
            i += 1;
            continue;
        }
        // Do not start mid-identifier (e.g. "v2", "sha256", "x86_64").
        let ident_char = |b: u8| (b as char).is_ascii_alphanumeric() || b == b'_';
        if i > 0 && ident_char(bytes[i - 1]) {
            i += 1;
            while i < bytes.len() && ident_char(bytes[i]) {
                i += 1;
            }
            continue;
        }

        let start = i;
        let is_currency = c == '$';
        if is_currency {
            i += 1;
        }
        let mut digits = String::new();
        let mut has_decimal = false;
        while i < bytes.len() {
            let ch = bytes[i] as char;
            if ch.is_ascii_digit() {
                digits.push(ch);
                i += 1;
            } else if ch == ',' && i + 1 < bytes.len() && (bytes[i + 1] as char).is_ascii_digit() {
                i += 1;
            } else if ch == '.' && !has_decimal && i + 1 < bytes.len() && (bytes[i + 1] as char).is_ascii_digit() {
                has_decimal = true;
                digits.push('.');
                i += 1;
            } else {
                break;
            }
        }
        let mut is_percent = false;
        if i < bytes.len() && bytes[i] as char == '%' {
            is_percent = true;
            i += 1;
        }
        if let Ok(value) = digits.parse::<f64>() {
            out.push(NumericLiteral {
                raw: text[start..i].to_string(),
                value,
                byte_start: start,
                byte_end: i,
                is_currency,
                is_percent,
                has_decimal,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_evidence::{EvidencePackBuilder, NumericContextKey, NumericToken};
    use nova_lens::TruthMode;
    use nova_telemetry::CorrelationContext;

    fn pack_with_token(key: &str, value: f64) -> EvidencePack {
        let correlation = CorrelationContext::new("conv", "hash", "test", "0.1.0");
        let mut pack = EvidencePackBuilder::new(correlation, TruthMode::External).seal();
        pack.tokens.push(NumericToken {
            context_key: NumericContextKey(key.to_string()),
            value,
            unit: Some("USD".into()),
            source: "finnhub".into(),
            fetched_at: 1,
            confidence: 0.95,
        });
        pack
    }

    fn empty_pack() -> EvidencePack {
        let correlation = CorrelationContext::new("conv", "hash", "test", "0.1.0");
        EvidencePackBuilder::new(correlation, TruthMode::Local).seal()
    }

    #[test]
    fn lexer_handles_currency_grouping_percent() {
        let nums = lex_numbers("price $1,234.56 up 3.5% from 1200 in 2024");
        let raws: Vec<&str> = nums.iter().map(|n| n.raw.as_str()).collect();
        assert_eq!(raws, vec!["$1,234.56", "3.5%", "1200", "2024"]);
        assert_eq!(nums[0].value, 1234.56);
        assert!(nums[0].is_currency);
        assert!(nums[1].is_percent);
        assert!(!nums[2].has_decimal);
    }

    #[test]
    fn lexer_skips_identifiers() {
        let nums = lex_numbers("sha256 v2 x86_64 has no standalone numbers");
        assert!(nums.is_empty());
    }

    #[test]
    fn token_match_with_context_passes() {
        let pack = pack_with_token("AAPL.price", 192.53);
        let scan = scan_answer("AAPL is trading at $192.53 right now.", &pack);
        assert_eq!(scan.verdict, LeakVerdict::Pass);
        assert_eq!(scan.findings[0].ruling, LiteralRuling::TokenMatch);
        assert_eq!(scan.findings[0].matched_key.as_deref(), Some("AAPL.price"));
    }

    #[test]
    fn matching_value_without_subject_context_violates() {
        let pack = pack_with_token("AAPL.price", 192.53);
        let scan = scan_answer(
            "The magic number is 192.53 which has nothing to do with any stock symbol whatsoever, \
             it simply appeared in a dream about unrelated things entirely.",
            &pack,
        );
        assert_eq!(scan.verdict, LeakVerdict::Violation);
    }

    #[test]
    fn unverified_number_is_violation() {
        let pack = pack_with_token("AAPL.price", 192.53);
        let scan = scan_answer("AAPL will hit $500.00 next week.", &pack);
        assert_eq!(scan.verdict, LeakVerdict::Violation);
    }

    #[test]
    fn small_integers_and_years_are_exempt() {
        let scan = scan_answer("Here are 3 ideas from 2019 onwards... wait, since 2019.", &empty_pack());
        assert_ne!(scan.verdict, LeakVerdict::Violation);
        assert!(scan.findings.iter().all(|f| f.ruling != LiteralRuling::Violation));
    }

    #[test]
    fn bare_year_without_cue_is_not_exempt() {
        let scan = scan_answer("The answer is 2042.", &empty_pack());
        assert_eq!(scan.verdict, LeakVerdict::Violation);
    }

    #[test]
    fn numbers_in_passthrough_reply_violate() {
        let scan = scan_answer("Roughly $48.20 I'd guess.", &empty_pack());
        assert_eq!(scan.verdict, LeakVerdict::Violation);
    }

    #[test]
    fn no_numbers_passes() {
        let scan = scan_answer("Hello there, nice to meet you!", &empty_pack());
        assert_eq!(scan.verdict, LeakVerdict::Pass);
        assert!(scan.findings.is_empty());
    }

    #[test]
    fn quoted_narrative_is_allowed() {
        let correlation = CorrelationContext::new("conv", "hash", "test", "0.1.0");
        let mut pack = EvidencePackBuilder::new(correlation, TruthMode::External).seal();
        pack.narrative_evidence.push("AAPL trading at 192.53 USD (-0.21%), day range 191.40-193.10 [finnhub]".into());
        let scan = scan_answer("Per the feed: \"AAPL trading at 192.53 USD\" as of this morning.", &pack);
        assert!(scan.findings.iter().all(|f| f.ruling != LiteralRuling::Violation));
    }

    #[test]
    fn tolerance_accepts_rounding() {
        let pack = pack_with_token("AAPL.price", 192.53);
        let scan = scan_answer("AAPL trades near 192.5 currently.", &pack);
        assert_eq!(scan.findings[0].ruling, LiteralRuling::TokenMatch);
    }

    #[test]
    fn strip_violations_replaces_offending_numbers() {
        let pack = pack_with_token("AAPL.price", 192.53);
        let answer = "AAPL is at $192.53 but will surely reach $500.00 soon.";
        let scan = scan_answer(answer, &pack);
        let cleaned = strip_violations(answer, &scan);
        assert!(cleaned.contains("$192.53"));
        assert!(!cleaned.contains("$500.00"));
        assert!(cleaned.contains("an up-to-date figure"));
    }
}
