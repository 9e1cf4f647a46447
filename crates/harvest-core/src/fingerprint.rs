//! Canonical identity hashes for reconciled entity kinds.
//!
//! Pure functions over normalized identifying fields: the same logical
//! entity always produces the same hash, regardless of case or surrounding
//! whitespace in its fields. Collisions between distinct entities are
//! tolerated by the rest of the system and guarded against at merge time.

use sha2::{Digest, Sha256};

/// Field separator inside the hashed preimage so adjacent fields cannot
/// bleed into each other.
const SEP: &str = "\u{1f}";

fn normalize(input: &str) -> String {
    input.trim().to_lowercase()
}

fn normalize_opt(input: Option<&str>) -> String {
    input.map(normalize).unwrap_or_default()
}

/// Coordinates rounded to ~1m precision so float noise does not split
/// identities.
fn coordinate(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.5}")).unwrap_or_default()
}

fn digest(parts: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join(SEP).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn company_identity(name: &str, website: Option<&str>) -> String {
    digest(&[normalize(name), normalize_opt(website)])
}

pub fn location_identity(
    name: Option<&str>,
    country: Option<&str>,
    latitude: Option<f64>,
    longitude: Option<f64>,
) -> String {
    digest(&[
        normalize_opt(name),
        normalize_opt(country),
        coordinate(latitude),
        coordinate(longitude),
    ])
}

/// A branch is identified by its owning company's identity input plus its
/// location's identity (empty when the branch has no location).
pub fn branch_identity(
    company_name: &str,
    company_website: Option<&str>,
    location_identity: Option<&str>,
) -> String {
    digest(&[
        normalize(company_name),
        normalize_opt(company_website),
        location_identity.unwrap_or_default().to_string(),
    ])
}

pub fn contact_identity(address: &str) -> String {
    digest(&[normalize(address)])
}

/// Online lookup key: title + owning company name only. The resolver uses
/// this within a recency window; the URL is checked separately and first.
pub fn posting_match_key(title: &str, company_name: &str) -> String {
    digest(&[normalize(title), normalize(company_name)])
}

/// Offline reconciliation identity: title + owning company name + URL.
pub fn posting_identity(title: &str, company_name: &str, url: &str) -> String {
    digest(&[
        normalize(title),
        normalize(company_name),
        url.trim().to_string(),
    ])
}
