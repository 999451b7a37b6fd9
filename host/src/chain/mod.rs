//! Distributed-ledger mirror of the off-chain claim lifecycle.
//!
//! The relational store is authoritative. Every write here is a
//! write-behind side effect: recorded in the mirror outbox, signed,
//! submitted, and polled for confirmation a bounded number of times.

mod http;
mod mirror;
mod signer;
mod simulated;

pub use http::HttpLedgerNode;
pub use mirror::{ChainMirror, MirrorReport};
pub use signer::{KeySource, SignedTransaction, TxSigner};
pub use simulated::SimulatedLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// One contract call against the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainOp {
    SubmitMatch {
        external_ref: String,
        home_team: String,
        away_team: String,
        home_score: u32,
        away_score: u32,
        submitter: String,
        metadata: String,
    },
    VerifyMatch {
        external_ref: String,
        verifier: String,
        approve: bool,
        weight: u32,
    },
    DisputeMatch {
        external_ref: String,
        disputer: String,
        reason: String,
        evidence: String,
    },
    UpdateReputation {
        identity: String,
        delta: i64,
        reason: String,
    },
}

impl ChainOp {
    pub fn name(&self) -> &'static str {
        match self {
            ChainOp::SubmitMatch { .. } => "submit_match",
            ChainOp::VerifyMatch { .. } => "verify_match",
            ChainOp::DisputeMatch { .. } => "dispute_match",
            ChainOp::UpdateReputation { .. } => "update_reputation",
        }
    }
}

/// Off-chain row whose chain reference is filled in on confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MirrorTarget {
    Claim { claim_id: Uuid },
    Attestation { claim_id: Uuid, attestation_id: Uuid },
    Dispute { claim_id: Uuid, dispute_id: Uuid },
    Reputation { claim_id: Uuid, identity: String },
}

impl MirrorTarget {
    pub fn claim_id(&self) -> Uuid {
        match self {
            MirrorTarget::Claim { claim_id }
            | MirrorTarget::Attestation { claim_id, .. }
            | MirrorTarget::Dispute { claim_id, .. }
            | MirrorTarget::Reputation { claim_id, .. } => *claim_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MirrorStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
    TimedOut,
}

impl MirrorStatus {
    pub const ALL: [MirrorStatus; 5] = [
        MirrorStatus::Pending,
        MirrorStatus::Submitted,
        MirrorStatus::Confirmed,
        MirrorStatus::Failed,
        MirrorStatus::TimedOut,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            MirrorStatus::Pending => "PENDING",
            MirrorStatus::Submitted => "SUBMITTED",
            MirrorStatus::Confirmed => "CONFIRMED",
            MirrorStatus::Failed => "FAILED",
            MirrorStatus::TimedOut => "TIMED_OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        MirrorStatus::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Statuses the retry loop picks up once a record has gone stale.
    /// SUBMITTED only lingers when its driver died mid-poll.
    pub const fn needs_retry(self) -> bool {
        !matches!(self, MirrorStatus::Confirmed)
    }

    /// A stored tx id is polled again instead of resubmitted.
    pub const fn resumes(self) -> bool {
        matches!(self, MirrorStatus::Submitted | MirrorStatus::TimedOut)
    }
}

/// Outbox row tracking one chain write independently of the off-chain write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub id: Uuid,
    pub target: MirrorTarget,
    pub operation: ChainOp,
    pub status: MirrorStatus,
    pub attempts: u32,
    pub tx_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MirrorRecord {
    pub fn new(target: MirrorTarget, operation: ChainOp) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target,
            operation,
            status: MirrorStatus::Pending,
            attempts: 0,
            tx_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Ledger-side view of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Pending,
    Confirmed { round: u64 },
    Rejected { reason: String },
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("ledger node unavailable: {0}")]
    Unavailable(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("transaction encoding failed: {0}")]
    Encoding(String),
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        ChainError::Unavailable(err.to_string())
    }
}

impl From<bincode::Error> for ChainError {
    fn from(err: bincode::Error) -> Self {
        ChainError::Encoding(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("{0}")]
    Unavailable(String),
    #[error("transaction {tx_id} not confirmed after {rounds} rounds")]
    Timeout { tx_id: String, rounds: u32 },
    #[error("transaction rejected by ledger: {0}")]
    Rejected(String),
    #[error("mirror record {0} is being driven by another worker")]
    Superseded(Uuid),
    #[error("mirror outbox: {0}")]
    Store(#[from] StoreError),
}

impl From<ChainError> for MirrorError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Rejected(reason) => MirrorError::Rejected(reason),
            other => MirrorError::Unavailable(other.to_string()),
        }
    }
}

/// A node of the distributed ledger that accepts signed transactions.
#[async_trait]
pub trait LedgerNode: Send + Sync {
    /// Submit a signed transaction; returns the node-assigned transaction id.
    async fn submit(&self, tx: &SignedTransaction) -> Result<String, ChainError>;

    /// Current confirmation state of a previously submitted transaction.
    async fn confirmation(&self, tx_id: &str) -> Result<Confirmation, ChainError>;

    /// Label for logging.
    fn name(&self) -> &'static str;
}
