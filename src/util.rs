//! Shared utility functions used across the codebase.

use std::sync::LazyLock;

use regex::Regex;

/// Characters of an identifier kept visible at the start when masking.
pub const MASK_PREFIX_LEN: usize = 6;
/// Characters of an identifier kept visible at the end when masking.
pub const MASK_SUFFIX_LEN: usize = 4;

static VERIFICATION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{24}$").expect("static regex"));

/// Normalise a client-supplied verification identifier.
///
/// Accepts either the bare 24-character hex id or a verification URL carrying
/// a `verificationId` query parameter. Returns `None` for anything else.
pub fn parse_verification_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidate = if trimmed.contains("://") {
        let url = url::Url::parse(trimmed).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == "verificationId")
            .map(|(_, v)| v.into_owned())?
    } else {
        trimmed.to_string()
    };

    let candidate = candidate.trim().to_ascii_lowercase();
    VERIFICATION_ID_RE
        .is_match(&candidate)
        .then_some(candidate)
}

/// Redact the middle of an identifier for responses and logs.
///
/// Long identifiers keep a fixed prefix and suffix around `****`; short ones
/// keep only their first character.
pub fn mask_identifier(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= MASK_PREFIX_LEN + MASK_SUFFIX_LEN {
        let mut out = String::with_capacity(chars.len());
        out.push(chars[0]);
        out.extend(std::iter::repeat('*').take(chars.len() - 1));
        return out;
    }
    let prefix: String = chars[..MASK_PREFIX_LEN].iter().collect();
    let suffix: String = chars[chars.len() - MASK_SUFFIX_LEN..].iter().collect();
    format!("{}****{}", prefix, suffix)
}

/// Compare two secrets without short-circuiting on the first difference.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a_bytes.iter().zip(b_bytes.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
