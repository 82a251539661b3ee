//! Token estimation and budget-preserving truncation.
//!
//! Estimation is the standard chars/4 heuristic with a 10% safety margin.
//! Truncation never drops a system message; non-system messages are trimmed
//! oldest-first, and within a message the cut degrades gracefully:
//! paragraph > sentence > word > hard cut.

use crate::ChatMessage;

pub const TRUNCATION_SUFFIX: &str = "…[truncated]";

/// `ceil(len/4) x 1.1`, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    let quarter = (text.len() as u64).div_ceil(4);
    ((quarter as f64) * 1.1).ceil() as u64
}

pub fn estimate_messages(messages: &[ChatMessage]) -> u64 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Cut `text` down to roughly `budget_tokens`, preferring clean boundaries.
pub fn smart_truncate(text: &str, budget_tokens: u64) -> String {
    if estimate_tokens(text) <= budget_tokens {
        return text.to_string();
    }
    // Work in chars: invert the estimate to a char budget, reserving room
    // for the suffix marker.
    let budget_chars = ((budget_tokens as f64 / 1.1) * 4.0) as usize;
    let budget_chars = budget_chars.saturating_sub(TRUNCATION_SUFFIX.len()).max(8);

    // Paragraph boundary.
    if let Some(cut) = best_boundary(text, budget_chars, "\n\n") {
        return format!("{}{TRUNCATION_SUFFIX}", &text[..cut]);
    }
    // Sentence boundary.
    if let Some(cut) = best_boundary(text, budget_chars, ". ") {
        return format!("{}{TRUNCATION_SUFFIX}", &text[..cut + 1]);
    }
    // Word boundary.
    if let Some(cut) = best_boundary(text, budget_chars, " ") {
        return format!("{}{TRUNCATION_SUFFIX}", &text[..cut]);
    }
    // Hard cut on a char boundary.
    let mut cut = budget_chars.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_SUFFIX}", &text[..cut])
}

/// Last occurrence of `sep` at or before `limit` bytes, if it keeps a
/// meaningful prefix.
fn best_boundary(text: &str, limit: usize, sep: &str) -> Option<usize> {
    if limit >= text.len() {
        return None;
    }
    let slice_end = floor_char_boundary(text, limit);
    let cut = text[..slice_end].rfind(sep)?;
    if cut < limit / 4 {
        return None;
    }
    Some(cut)
}

fn floor_char_boundary(text: &str, mut at: usize) -> usize {
    at = at.min(text.len());
    while at > 0 && !text.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Fit `messages` under `budget_tokens`.
///
/// System messages are preserved (truncated in place only if they alone bust
/// the budget). Non-system messages keep their relative order; the oldest are
/// dropped or trimmed first. Returns None when even the system messages do
/// not fit.
pub fn truncate_messages(messages: &[ChatMessage], budget_tokens: u64) -> Option<Vec<ChatMessage>> {
    let total = estimate_messages(messages);
    if total <= budget_tokens {
        return Some(messages.to_vec());
    }

    let system_cost: u64 = messages.iter().filter(|m| m.is_system()).map(|m| estimate_tokens(&m.content)).sum();
    if system_cost > budget_tokens {
        return None;
    }

    let mut remaining = budget_tokens - system_cost;
    // Walk non-system messages newest-first, recording which indices survive.
    let mut kept: Vec<(usize, ChatMessage)> = Vec::new();
    for (idx, message) in messages.iter().enumerate().rev().filter(|(_, m)| !m.is_system()) {
        if remaining == 0 {
            continue;
        }
        let cost = estimate_tokens(&message.content);
        if cost <= remaining {
            remaining -= cost;
            kept.push((idx, message.clone()));
        } else if kept.is_empty() && remaining > 8 {
            // Never return zero conversation content if any room remains.
            let trimmed = smart_truncate(&message.content, remaining);
            remaining = 0;
            kept.push((idx, ChatMessage { role: message.role.clone(), content: trimmed }));
        }
        // Older messages that do not fit are dropped.
    }
    kept.sort_by_key(|(idx, _)| *idx);

    // Reassemble preserving the original order.
    let mut kept_iter = kept.into_iter().peekable();
    let mut out = Vec::new();
    for (idx, message) in messages.iter().enumerate() {
        if message.is_system() {
            out.push(message.clone());
        } else if kept_iter.peek().map(|(k, _)| *k == idx).unwrap_or(false) {
            let (_, survivor) = kept_iter.next().unwrap_or_else(|| (idx, message.clone()));
            out.push(survivor);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_matches_formula() {
        // 100 chars -> ceil(100/4)=25 -> 25*1.1=27.5 -> 28.
        assert_eq!(estimate_tokens(&"a".repeat(100)), 28);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn under_budget_is_untouched() {
        let msgs = vec![ChatMessage::system("sys"), ChatMessage::user("short")];
        let out = truncate_messages(&msgs, 1_000).unwrap();
        assert_eq!(out, msgs);
    }

    #[test]
    fn system_messages_survive_truncation() {
        let msgs = vec![
            ChatMessage::system("you are the lens gate"),
            ChatMessage::user(&"old ".repeat(500)),
            ChatMessage::user(&"new ".repeat(100)),
        ];
        let out = truncate_messages(&msgs, 200).unwrap();
        assert!(out.iter().any(|m| m.is_system() && m.content == "you are the lens gate"));
        // Non-system order preserved; the oldest was dropped first.
        let non_system: Vec<_> = out.iter().filter(|m| !m.is_system()).collect();
        assert!(!non_system.is_empty());
        assert!(non_system.last().unwrap().content.starts_with("new "));
    }

    #[test]
    fn system_over_budget_returns_none() {
        let msgs = vec![ChatMessage::system(&"x".repeat(10_000))];
        assert!(truncate_messages(&msgs, 100).is_none());
    }

    #[test]
    fn smart_truncate_prefers_paragraphs() {
        let text = format!("{}\n\n{}", "first paragraph. ".repeat(10), "second paragraph. ".repeat(50));
        let cut = smart_truncate(&text, 60);
        assert!(cut.ends_with(TRUNCATION_SUFFIX));
        assert!(cut.contains("first paragraph"));
        assert!(estimate_tokens(&cut) <= 70);
    }

    #[test]
    fn smart_truncate_falls_back_to_sentences_then_words() {
        let sentences = "one two three. four five six. seven eight nine. ".repeat(20);
        let cut = smart_truncate(&sentences, 20);
        assert!(cut.ends_with(TRUNCATION_SUFFIX));

        let no_sentences = "word ".repeat(400);
        let cut2 = smart_truncate(&no_sentences, 20);
        assert!(cut2.ends_with(TRUNCATION_SUFFIX));

        let unbroken = "x".repeat(2_000);
        let cut3 = smart_truncate(&unbroken, 20);
        assert!(cut3.ends_with(TRUNCATION_SUFFIX));
        assert!(cut3.len() < 200);
    }

    #[test]
    fn truncation_is_noop_for_fitting_text() {
        assert_eq!(smart_truncate("tiny", 100), "tiny");
    }
}
