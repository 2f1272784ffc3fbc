//! PII masking for text that leaves the trust boundary or lands in the
//! audit trail. The redactor runs after the sanitizer and before any model
//! call; downstream stages only ever see the masked copy.

/// Classification is token-based and conservative: a token that looks like
/// contact or identity data is replaced wholesale with `[REDACTED:kind]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Redactor;

impl Redactor {
    pub fn new() -> Self {
        Self
    }

    pub fn redact(&self, raw: &str) -> String {
        let mut output = String::with_capacity(raw.len());
        let mut rest = raw;

        while let Some(start) = rest.find(|ch: char| !ch.is_whitespace()) {
            let (gap, tail) = rest.split_at(start);
            output.push_str(gap);
            let end = tail
                .find(|ch: char| ch.is_whitespace())
                .unwrap_or(tail.len());
            let (token, remainder) = tail.split_at(end);
            output.push_str(&mask_token(token));
            rest = remainder;
        }
        output.push_str(rest);

        output
    }
}

fn mask_token(token: &str) -> String {
    // Trailing sentence punctuation stays visible.
    let trimmed = token.trim_end_matches([',', '.', ';', ':', '!', '?', ')']);
    let suffix = &token[trimmed.len()..];
    let core = trimmed.trim_start_matches(['(']);
    let prefix = &trimmed[..trimmed.len() - core.len()];

    let Some(kind) = classify(core) else {
        return token.to_string();
    };
    format!("{prefix}[REDACTED:{kind}]{suffix}")
}

fn classify(token: &str) -> Option<&'static str> {
    if token.is_empty() {
        return None;
    }
    if looks_like_email(token) {
        return Some("email");
    }
    if looks_like_ssn(token) {
        return Some("ssn");
    }
    if looks_like_phone(token) {
        return Some("phone");
    }
    if is_long_digit_run(token) {
        return Some("number");
    }
    None
}

fn looks_like_email(token: &str) -> bool {
    let Some(at) = token.find('@') else {
        return false;
    };
    let (local, domain) = token.split_at(at);
    let domain = &domain[1..];
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

fn looks_like_ssn(token: &str) -> bool {
    let parts: Vec<&str> = token.split('-').collect();
    parts.len() == 3
        && parts[0].len() == 3
        && parts[1].len() == 2
        && parts[2].len() == 4
        && parts.iter().all(|part| part.chars().all(|ch| ch.is_ascii_digit()))
}

fn looks_like_phone(token: &str) -> bool {
    let mut digits = 0usize;
    for ch in token.chars() {
        if ch.is_ascii_digit() {
            digits += 1;
        } else if !matches!(ch, '-' | '.' | '(' | ')' | '+' | ' ') {
            return false;
        }
    }
    // A bare digit run is handled by the long-run rule; phones need at
    // least one separator or a leading plus.
    digits >= 7 && token.chars().any(|ch| !ch.is_ascii_digit())
}

fn is_long_digit_run(token: &str) -> bool {
    token.len() >= 9 && token.chars().all(|ch| ch.is_ascii_digit())
}
