//! Scan target validation.
//!
//! SECURITY: every target that reaches a tool's argv goes through
//! [`validate_target`] first. The check order is fixed: trim, length,
//! decode-then-normalize, deny-list, safe-set, shape. Decoding happens before
//! any character check so percent-encoded or full-width metacharacters cannot
//! slip past the deny-list (CWE-78, CWE-20).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use serde::Serialize;
use url::Url;

use crate::error::ValidationError;

/// Maximum target length in characters (DNS name limit).
pub const MAX_TARGET_LEN: usize = 253;

/// Characters that are never accepted, whatever the shape.
pub const DENIED_CHARS: &[char] = &[
    ';', '|', '&', '$', '`', '\n', '\r', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '!',
    '#', '%', '^', '"', '\'', '\\',
];

/// Which accepted shape a target matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Hostname,
    Ipv4,
    Ipv6,
    Cidr,
    Url,
}

/// A validated scan destination.
///
/// Only constructible through [`validate_target`] (or `str::parse`), so
/// holding a `Target` proves the value passed every check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    value: String,
    kind: TargetKind,
}

impl Target {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn kind(&self) -> TargetKind {
        self.kind
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl FromStr for Target {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_target(s)
    }
}

/// Turn an untrusted client string into a [`Target`] or say why not.
///
/// The returned target holds the trimmed, percent-decoded,
/// homoglyph-folded value.
pub fn validate_target(raw: &str) -> Result<Target, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    if trimmed.chars().count() > MAX_TARGET_LEN {
        return Err(ValidationError::TooLong);
    }

    let normalized = normalize(trimmed)?;
    if normalized.contains(DENIED_CHARS) || !normalized.chars().all(is_safe_char) {
        return Err(ValidationError::IllegalCharacters);
    }

    let kind = classify(&normalized).ok_or(ValidationError::UnrecognizedShape)?;
    Ok(Target {
        value: normalized,
        kind,
    })
}

/// Percent-decode, then fold full-width homoglyphs to ASCII. Anything still
/// outside ASCII afterwards is rejected.
fn normalize(input: &str) -> Result<String, ValidationError> {
    let decoded = percent_decode_str(input)
        .decode_utf8()
        .map_err(|_| ValidationError::IllegalCharacters)?;

    decoded
        .chars()
        .map(fold_homoglyph)
        .map(|c| {
            if c.is_ascii() {
                Ok(c)
            } else {
                Err(ValidationError::IllegalCharacters)
            }
        })
        .collect()
}

/// Map the Unicode full-width forms block onto the ASCII characters it mimics.
fn fold_homoglyph(c: char) -> char {
    match c {
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(u32::from(c) - 0xFEE0).unwrap_or(c),
        '\u{3000}' => ' ',
        _ => c,
    }
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '/' | '_')
}

fn classify(s: &str) -> Option<TargetKind> {
    if s.parse::<Ipv4Addr>().is_ok() {
        Some(TargetKind::Ipv4)
    } else if s.parse::<Ipv6Addr>().is_ok() {
        Some(TargetKind::Ipv6)
    } else if is_cidr(s) {
        Some(TargetKind::Cidr)
    } else if is_url(s) {
        Some(TargetKind::Url)
    } else if is_hostname(s) {
        Some(TargetKind::Hostname)
    } else {
        None
    }
}

fn is_label(label: &str) -> bool {
    (1..=63).contains(&label.len())
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn is_hostname(s: &str) -> bool {
    let labels: Vec<&str> = s.split('.').collect();
    let Some(tld) = labels.last() else {
        return false;
    };
    labels.len() >= 2
        && labels.iter().all(|label| is_label(label))
        && tld.len() >= 2
        && tld.bytes().all(|b| b.is_ascii_alphabetic())
}

/// Decimal without a sign or leading zeros.
fn is_plain_decimal(digits: &str) -> bool {
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !(digits.len() > 1 && digits.starts_with('0'))
}

fn is_cidr(s: &str) -> bool {
    let Some((addr, prefix)) = s.split_once('/') else {
        return false;
    };
    if !is_plain_decimal(prefix) {
        return false;
    }
    let Ok(bits) = prefix.parse::<u8>() else {
        return false;
    };
    if addr.parse::<Ipv4Addr>().is_ok() {
        bits <= 32
    } else if addr.parse::<Ipv6Addr>().is_ok() {
        bits <= 128
    } else {
        false
    }
}

fn is_url(s: &str) -> bool {
    let Some(rest) = s
        .strip_prefix("http://")
        .or_else(|| s.strip_prefix("https://"))
    else {
        return false;
    };

    // The authority is checked on the raw text: the WHATWG parser would
    // happily expand shorthand like `http://1.2.3` into an address.
    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    };
    if let Some(port) = port
        && !(is_plain_decimal(port) && port.parse::<u16>().is_ok_and(|p| p > 0))
    {
        return false;
    }
    if !(is_hostname(host) || host.parse::<Ipv4Addr>().is_ok()) {
        return false;
    }

    Url::parse(s).is_ok_and(|url| {
        matches!(url.scheme(), "http" | "https")
            && url.username().is_empty()
            && url.password().is_none()
            && url.query().is_none()
            && url.fragment().is_none()
    })
}
