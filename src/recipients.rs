//! Recipient list cleaning, validation and deduplication

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Permissive `local@domain.tld` shape, deliberately not RFC 5322
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@.]+(\.[^\s@.]+)+$").expect("email pattern is valid")
});

/// Result of [`validate_and_hash_emails`]
#[derive(Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRecipients {
    /// Unique cleaned addresses in first-seen order
    pub valid_emails: Vec<String>,
    /// Entries that failed validation, as cleaned
    pub invalid_emails: Vec<String>,
    pub duplicates_removed: usize,
}

/// Trims and lowercases an address
pub fn clean_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn validate_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Cleans every entry, drops invalid ones into `invalid_emails` and removes
/// duplicates by cleaned address.
///
/// `valid + invalid + duplicates_removed` always equals the input length.
pub fn validate_and_hash_emails<I, S>(raw: I) -> ProcessedRecipients
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = ProcessedRecipients::default();

    for entry in raw {
        let email = clean_email(entry.as_ref());
        if !validate_email(&email) {
            out.invalid_emails.push(email);
        } else if seen.insert(email.clone()) {
            out.valid_emails.push(email);
        } else {
            out.duplicates_removed += 1;
        }
    }

    out
}
