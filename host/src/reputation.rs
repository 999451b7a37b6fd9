//! Reputation Ledger: per-identity scores with an append-only delta history.

use matchproof_core::{ReputationChange, ReputationEvent, ReputationPolicy, ReputationRecord};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::error::EngineError;
use crate::locks::KeyedLocks;
use crate::store::{Store, StoreError};

pub struct ReputationLedger {
    store: Arc<dyn Store>,
    policy: ReputationPolicy,
    identities: KeyedLocks<String>,
}

impl ReputationLedger {
    pub fn new(store: Arc<dyn Store>, policy: ReputationPolicy) -> Self {
        Self {
            store,
            policy,
            identities: KeyedLocks::new(),
        }
    }

    pub fn policy(&self) -> &ReputationPolicy {
        &self.policy
    }

    /// Current standing; first-seen identities get the initial score without
    /// a row being created.
    pub async fn get(&self, identity: &str) -> Result<ReputationRecord, StoreError> {
        Ok(self
            .store
            .reputation(identity)
            .await?
            .unwrap_or_else(|| self.policy.fresh_record(identity, Utc::now())))
    }

    pub async fn apply_delta(
        &self,
        identity: &str,
        delta: i64,
        reason: &str,
    ) -> Result<ReputationEvent, StoreError> {
        let (_, event) = self
            .apply(&ReputationChange::new(identity, delta, reason))
            .await?;
        Ok(event)
    }

    /// Clamped read-modify-write, serialized per identity.
    pub async fn apply(
        &self,
        change: &ReputationChange,
    ) -> Result<(ReputationRecord, ReputationEvent), StoreError> {
        let _guard = self.identities.lock(&change.identity).await;
        let (record, event) = self.store.apply_reputation(change, &self.policy).await?;
        debug!(
            identity = %change.identity,
            delta = change.delta,
            score = record.score,
            reason = %change.reason,
            "Reputation updated"
        );
        Ok((record, event))
    }

    /// Reject identities below the participation minimum.
    pub async fn ensure_eligible(&self, identity: &str) -> Result<ReputationRecord, EngineError> {
        let record = self.get(identity).await?;
        if record.score < self.policy.min_participation {
            return Err(EngineError::InsufficientReputation {
                identity: identity.to_string(),
                score: record.score,
                required: self.policy.min_participation,
            });
        }
        Ok(record)
    }

    pub async fn history(
        &self,
        identity: &str,
        limit: u32,
    ) -> Result<Vec<ReputationEvent>, StoreError> {
        self.store.reputation_history(identity, limit).await
    }

    pub async fn leaderboard(&self, limit: u32) -> Result<Vec<ReputationRecord>, StoreError> {
        self.store.leaderboard(limit).await
    }
}
