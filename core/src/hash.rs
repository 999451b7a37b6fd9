//! Deterministic digests for claim references and chain payloads.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonical form of a team label: trimmed, inner whitespace collapsed,
/// lowercased.
pub fn normalize_team(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Serialize)]
struct ClaimFingerprint<'a> {
    home_team: String,
    away_team: String,
    home_score: u32,
    away_score: u32,
    submitter: &'a str,
    played_at: i64,
}

/// Derive the external reference for a claim when the caller supplies none.
///
/// Process:
/// 1. Normalize both team labels
/// 2. Serialize the fingerprint as JSON (field order is fixed by the struct)
/// 3. SHA-256 the JSON and hex-encode it
///
/// The same match reported twice by the same submitter therefore collides.
pub fn claim_reference(
    home_team: &str,
    away_team: &str,
    home_score: u32,
    away_score: u32,
    submitter: &str,
    played_at: DateTime<Utc>,
) -> String {
    let fingerprint = ClaimFingerprint {
        home_team: normalize_team(home_team),
        away_team: normalize_team(away_team),
        home_score,
        away_score,
        submitter,
        played_at: played_at.timestamp(),
    };
    let json = serde_json::to_vec(&fingerprint).unwrap_or_default();
    sha256_hex(&json)
}

/// Hex-encoded SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
