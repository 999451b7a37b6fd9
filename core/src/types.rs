//! Shared types for match result claims and their attestations.
//!
//! These are the records the engine persists and the reporting layer reads:
//! - `MatchClaim`: a submitted result and its running tallies
//! - `Attestation` / `Dispute`: one identity's approve or reject vote
//! - `ReputationRecord`: an identity's long-lived standing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Role an attester asserts for itself when voting on a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifierRole {
    Player,
    Referee,
    Coach,
    Official,
    Spectator,
}

/// Vote weight per role, indexed by the enum discriminant.
const ROLE_WEIGHTS: [u32; 5] = [10, 50, 20, 30, 5];

impl VerifierRole {
    pub const ALL: [VerifierRole; 5] = [
        VerifierRole::Player,
        VerifierRole::Referee,
        VerifierRole::Coach,
        VerifierRole::Official,
        VerifierRole::Spectator,
    ];

    /// Trust weight contributed by one vote cast in this role.
    pub const fn weight(self) -> u32 {
        ROLE_WEIGHTS[self as usize]
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            VerifierRole::Player => "PLAYER",
            VerifierRole::Referee => "REFEREE",
            VerifierRole::Coach => "COACH",
            VerifierRole::Official => "OFFICIAL",
            VerifierRole::Spectator => "SPECTATOR",
        }
    }
}

impl fmt::Display for VerifierRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerifierRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VerifierRole::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError::new("verifier role", s))
    }
}

/// Lifecycle status of a claim.
///
/// PENDING, VERIFIED and DISPUTED are live; RESOLVED and REJECTED are terminal
/// and only reachable through an explicit resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Pending,
    Verified,
    Disputed,
    Resolved,
    Rejected,
}

impl ClaimStatus {
    pub const ALL: [ClaimStatus; 5] = [
        ClaimStatus::Pending,
        ClaimStatus::Verified,
        ClaimStatus::Disputed,
        ClaimStatus::Resolved,
        ClaimStatus::Rejected,
    ];

    pub const fn is_terminal(self) -> bool {
        matches!(self, ClaimStatus::Resolved | ClaimStatus::Rejected)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Pending => "PENDING",
            ClaimStatus::Verified => "VERIFIED",
            ClaimStatus::Disputed => "DISPUTED",
            ClaimStatus::Resolved => "RESOLVED",
            ClaimStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClaimStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError::new("claim status", s))
    }
}

/// Status of a single dispute row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    Open,
    Investigating,
    Resolved,
    Dismissed,
}

impl DisputeStatus {
    pub const ALL: [DisputeStatus; 4] = [
        DisputeStatus::Open,
        DisputeStatus::Investigating,
        DisputeStatus::Resolved,
        DisputeStatus::Dismissed,
    ];

    /// Open and investigating disputes are still awaiting a decision.
    pub const fn is_live(self) -> bool {
        matches!(self, DisputeStatus::Open | DisputeStatus::Investigating)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DisputeStatus::Open => "OPEN",
            DisputeStatus::Investigating => "INVESTIGATING",
            DisputeStatus::Resolved => "RESOLVED",
            DisputeStatus::Dismissed => "DISMISSED",
        }
    }
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisputeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DisputeStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError::new("dispute status", s))
    }
}

/// Outcome chosen by the governance step that closes a disputed claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// The disputers were right: the claim is REJECTED.
    Upheld,
    /// The claimed result stands: the claim is RESOLVED.
    Dismissed,
}

impl ResolutionOutcome {
    pub const fn claim_status(self) -> ClaimStatus {
        match self {
            ResolutionOutcome::Upheld => ClaimStatus::Rejected,
            ResolutionOutcome::Dismissed => ClaimStatus::Resolved,
        }
    }

    pub const fn dispute_status(self) -> DisputeStatus {
        match self {
            ResolutionOutcome::Upheld => DisputeStatus::Resolved,
            ResolutionOutcome::Dismissed => DisputeStatus::Dismissed,
        }
    }
}

/// Failed to parse one of the string-encoded enums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

/// A submitted match result awaiting corroboration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchClaim {
    pub id: Uuid,
    /// Reference shared with the on-chain record; unique across claims.
    pub external_ref: String,
    pub home_team: String,
    pub away_team: String,
    pub home_score: u32,
    pub away_score: u32,
    pub submitter: String,
    /// Submitter's reputation score when the claim was made.
    pub submitter_reputation: i64,
    pub status: ClaimStatus,
    /// Approve weight needed to reach VERIFIED.
    pub required_weight: u32,
    pub approve_weight: u32,
    pub dispute_weight: u32,
    #[serde(default)]
    pub metadata: Option<String>,
    /// Confirmed anchor transaction, if the mirror has caught up.
    #[serde(default)]
    pub chain_tx: Option<String>,
    pub played_at: DateTime<Utc>,
    /// Set when the claim first reached VERIFIED and attesters were rewarded.
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One identity's approving vote on a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub verifier: String,
    pub verifier_reputation: i64,
    pub role: VerifierRole,
    pub weight: u32,
    #[serde(default)]
    pub chain_tx: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One identity's rejecting vote on a claim, with justification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub disputer: String,
    pub disputer_reputation: i64,
    pub role: VerifierRole,
    pub reason: String,
    #[serde(default)]
    pub evidence: Option<String>,
    pub weight: u32,
    pub status: DisputeStatus,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub chain_tx: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An identity's standing. Created lazily and never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub identity: String,
    pub score: i64,
    pub verification_count: u64,
    pub successful_verifications: u64,
    pub disputes_raised: u64,
    pub disputes_won: u64,
    pub updated_at: DateTime<Utc>,
}

/// Audit entry for a single reputation delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub identity: String,
    /// Requested delta before clamping.
    pub delta: i64,
    pub reason: String,
    pub score_after: i64,
    pub at: DateTime<Utc>,
}

/// Emitted once per claim status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub claim_id: Uuid,
    pub external_ref: String,
    pub from: ClaimStatus,
    pub to: ClaimStatus,
    pub at: DateTime<Utc>,
}
