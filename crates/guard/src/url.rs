//! URL extraction and canonicalization for the hallucination guard.
//!
//! Canonical form: lowercase scheme and host, no default port, no `www.`
//! prefix, no fragment, no trailing slash. Idempotent.

/// Extract every http(s) URL from free text.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for marker in ["https://", "http://"] {
        let mut from = 0;
        while let Some(rel) = text[from..].find(marker) {
            let start = from + rel;
            // Skip matches that are the tail of a longer scheme (e.g. "xhttp://").
            if start > 0 && text[..start].ends_with(|c: char| c.is_ascii_alphanumeric()) {
                from = start + marker.len();
                continue;
            }
            let tail = &text[start..];
            let end = tail
                .find(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '"' | '\'' | ')' | ']' | '}' | ','))
                .unwrap_or(tail.len());
            let mut url = &tail[..end];
            // Trailing sentence punctuation is not part of the URL.
            url = url.trim_end_matches(['.', ';', '!', '?']);
            if url.len() > marker.len() {
                out.push(url.to_string());
            }
            from = start + end.max(marker.len());
        }
    }
    out
}

/// Normalize a URL so fabricated variants cannot dodge the verified set.
pub fn canonicalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((s, r)) => (s.to_lowercase(), r),
        None => return trimmed.trim_end_matches('/').to_lowercase(),
    };

    // Split off fragment first, then query.
    let rest = rest.split_once('#').map(|(r, _)| r).unwrap_or(rest);
    let (authority_path, query) = match rest.split_once('?') {
        Some((ap, q)) => (ap, Some(q)),
        None => (rest, None),
    };
    let (authority, path) = match authority_path.find('/') {
        Some(i) => (&authority_path[..i], &authority_path[i..]),
        None => (authority_path, ""),
    };

    let mut host = authority.to_lowercase();
    if let Some(stripped) = host.strip_prefix("www.") {
        host = stripped.to_string();
    }
    // Default ports are noise.
    for (s, port) in [("http", ":80"), ("https", ":443")] {
        if scheme == s {
            if let Some(stripped) = host.strip_suffix(port) {
                host = stripped.to_string();
            }
        }
    }

    let path = path.trim_end_matches('/');
    match query {
        Some(q) if !q.is_empty() => format!("{scheme}://{host}{path}?{q}"),
        _ => format!("{scheme}://{host}{path}"),
    }
}
