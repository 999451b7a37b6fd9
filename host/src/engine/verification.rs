//! Verification Collector: record attestations and drive PENDING -> VERIFIED.

use chrono::Utc;
use matchproof_core::{Attestation, VerifierRole};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{check_identity, Engine, VoteReceipt};
use crate::chain::{ChainOp, MirrorTarget};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AttestRequest {
    pub role: VerifierRole,
}

impl Engine {
    /// Record an approving vote.
    ///
    /// Duplicate votes are rejected without touching the tally. Votes on a
    /// VERIFIED or DISPUTED claim are still recorded but never move it
    /// forward; only the vote that crosses the threshold rewards the
    /// contributing verifiers.
    pub async fn attest(
        &self,
        claim_id: Uuid,
        verifier: &str,
        request: AttestRequest,
    ) -> Result<VoteReceipt<Attestation>, EngineError> {
        check_identity(verifier)?;
        let claim = self.store.claim(claim_id).await?;
        if claim.submitter == verifier {
            return Err(EngineError::SelfVerification {
                claim_id,
                identity: verifier.to_string(),
            });
        }
        let standing = self.reputation.ensure_eligible(verifier).await?;

        let guard = self.claims.lock(&claim_id).await;
        let attestation = Attestation {
            id: Uuid::new_v4(),
            claim_id,
            verifier: verifier.to_string(),
            verifier_reputation: standing.score,
            role: request.role,
            weight: request.role.weight(),
            chain_tx: None,
            created_at: Utc::now(),
        };
        let commit = self
            .store
            .commit_attestation(attestation, &self.config.thresholds, self.reputation.policy())
            .await?;
        drop(guard);
        let transition = commit.transitioned();

        info!(
            claim_id = %claim_id,
            verifier = %verifier,
            role = %request.role,
            approve_weight = commit.claim.approve_weight,
            status = %commit.claim.status,
            "Attestation recorded"
        );
        if let Some(change) = &transition {
            self.events.publish(change);
        }
        self.mirror_reputation(claim_id, commit.reputation);

        let mut receipt = VoteReceipt {
            vote: commit.vote,
            claim: commit.claim,
        };
        let op = ChainOp::VerifyMatch {
            external_ref: receipt.claim.external_ref.clone(),
            verifier: verifier.to_string(),
            approve: true,
            weight: receipt.vote.weight,
        };
        let target = MirrorTarget::Attestation {
            claim_id,
            attestation_id: receipt.vote.id,
        };
        let tx_id = self.mirror_op(target, op).await?;
        receipt.vote.chain_tx = Some(tx_id);
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::chain::MirrorRecord;
    use crate::store::{ClaimFilter, ClaimPage, MemoryStore, ResolutionCommit, Store, StoreError, VoteCommit};
    use chrono::DateTime;
    use matchproof_core::{
        ClaimStatus, Dispute, MatchClaim, ReputationChange, ReputationEvent, ReputationPolicy,
        ReputationRecord, ResolutionOutcome, ThresholdPolicy,
    };
    use std::sync::Arc;

    async fn submitted(h: &Harness) -> MatchClaim {
        h.engine
            .submit("alice", match_request("Red Lions", "Blue Sharks"))
            .await
            .unwrap()
    }

    fn player() -> AttestRequest {
        AttestRequest {
            role: VerifierRole::Player,
        }
    }

    #[tokio::test]
    async fn test_three_players_verify_and_are_rewarded() {
        let h = harness();
        let mut events = h.events.subscribe();
        let claim = submitted(&h).await;

        for who in ["bob", "carol"] {
            let receipt = h.engine.attest(claim.id, who, player()).await.unwrap();
            assert_eq!(receipt.claim.status, ClaimStatus::Pending);
        }
        let receipt = h.engine.attest(claim.id, "dave", player()).await.unwrap();
        assert_eq!(receipt.claim.approve_weight, 30);
        assert_eq!(receipt.claim.status, ClaimStatus::Verified);
        assert!(receipt.claim.verified_at.is_some());
        assert!(receipt.vote.chain_tx.is_some());

        let event = events.recv().await.unwrap();
        assert_eq!(event.from, ClaimStatus::Pending);
        assert_eq!(event.to, ClaimStatus::Verified);

        for who in ["bob", "carol", "dave"] {
            let record = h.engine.reputation(who).await.unwrap();
            assert_eq!(record.score, 105);
            assert_eq!(record.verification_count, 1);
            assert_eq!(record.successful_verifications, 1);
        }
    }

    #[tokio::test]
    async fn test_late_attestation_is_recorded_without_reward() {
        let h = harness();
        let claim = submitted(&h).await;
        let referee = AttestRequest {
            role: VerifierRole::Referee,
        };
        let receipt = h.engine.attest(claim.id, "ref-jane", referee).await.unwrap();
        assert_eq!(receipt.claim.status, ClaimStatus::Verified);

        let late = h.engine.attest(claim.id, "erin", player()).await.unwrap();
        assert_eq!(late.claim.status, ClaimStatus::Verified);
        assert_eq!(late.claim.approve_weight, 60);
        let erin = h.engine.reputation("erin").await.unwrap();
        assert_eq!(erin.score, 100);
        assert_eq!(erin.verification_count, 1);
        assert_eq!(erin.successful_verifications, 0);
    }

    #[tokio::test]
    async fn test_duplicate_attestation_leaves_tally_unchanged() {
        let h = harness();
        let claim = submitted(&h).await;
        h.engine.attest(claim.id, "bob", player()).await.unwrap();
        let err = h.engine.attest(claim.id, "bob", player()).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateAttestation { .. }));
        let stored = h.store.claim(claim.id).await.unwrap();
        assert_eq!(stored.approve_weight, 10);
        assert_eq!(h.store.attestations(claim.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_self_verification_creates_no_row() {
        let h = harness();
        let claim = submitted(&h).await;
        let err = h.engine.attest(claim.id, "alice", player()).await.unwrap_err();
        assert!(matches!(err, EngineError::SelfVerification { .. }));
        assert!(h.store.attestations(claim.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_claim_is_not_found() {
        let h = harness();
        let err = h
            .engine
            .attest(Uuid::new_v4(), "bob", player())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_chain_outage_does_not_block_transition() {
        let h = harness();
        let claim = submitted(&h).await;
        h.ledger.set_offline(true);
        let err = h
            .engine
            .attest(
                claim.id,
                "ref-jane",
                AttestRequest {
                    role: VerifierRole::Referee,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_mirror_pending());
        assert_eq!(
            h.store.claim(claim.id).await.unwrap().status,
            ClaimStatus::Verified
        );
    }

    #[tokio::test]
    async fn test_concurrent_attestations_reach_verified() {
        let h = std::sync::Arc::new(harness());
        let claim = submitted(&h).await;
        let mut handles = Vec::new();
        for i in 0..6 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.engine
                    .attest(claim.id, &format!("player-{i}"), player())
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let stored = h.store.claim(claim.id).await.unwrap();
        assert_eq!(stored.approve_weight, 60);
        assert_eq!(stored.status, ClaimStatus::Verified);
        let rewarded = count_rewarded(&h, 6).await;
        assert_eq!(rewarded, 3);
    }

    async fn count_rewarded(h: &Harness, n: usize) -> usize {
        let mut rewarded = 0;
        for i in 0..n {
            let record = h.engine.reputation(&format!("player-{i}")).await.unwrap();
            if record.successful_verifications == 1 {
                rewarded += 1;
            }
        }
        rewarded
    }

    /// Memory store whose standalone reputation writes always fail.
    struct ReputationWritesFail(MemoryStore);

    #[async_trait::async_trait]
    impl Store for ReputationWritesFail {
        async fn insert_claim(&self, claim: &MatchClaim) -> Result<(), StoreError> {
            self.0.insert_claim(claim).await
        }

        async fn claim(&self, id: Uuid) -> Result<MatchClaim, StoreError> {
            self.0.claim(id).await
        }

        async fn list_claims(&self, filter: &ClaimFilter) -> Result<ClaimPage, StoreError> {
            self.0.list_claims(filter).await
        }

        async fn attestations(&self, claim_id: Uuid) -> Result<Vec<Attestation>, StoreError> {
            self.0.attestations(claim_id).await
        }

        async fn disputes(&self, claim_id: Uuid) -> Result<Vec<Dispute>, StoreError> {
            self.0.disputes(claim_id).await
        }

        async fn commit_attestation(
            &self,
            attestation: Attestation,
            thresholds: &ThresholdPolicy,
            reputation: &ReputationPolicy,
        ) -> Result<VoteCommit<Attestation>, StoreError> {
            self.0.commit_attestation(attestation, thresholds, reputation).await
        }

        async fn commit_dispute(
            &self,
            dispute: Dispute,
            thresholds: &ThresholdPolicy,
            reputation: &ReputationPolicy,
        ) -> Result<VoteCommit<Dispute>, StoreError> {
            self.0.commit_dispute(dispute, thresholds, reputation).await
        }

        async fn mark_investigating(&self, claim_id: Uuid) -> Result<Vec<Dispute>, StoreError> {
            self.0.mark_investigating(claim_id).await
        }

        async fn commit_resolution(
            &self,
            claim_id: Uuid,
            outcome: ResolutionOutcome,
            resolution: &str,
            reputation: &ReputationPolicy,
        ) -> Result<ResolutionCommit, StoreError> {
            self.0
                .commit_resolution(claim_id, outcome, resolution, reputation)
                .await
        }

        async fn set_chain_tx(&self, target: &MirrorTarget, tx_id: &str) -> Result<(), StoreError> {
            self.0.set_chain_tx(target, tx_id).await
        }

        async fn reputation(&self, identity: &str) -> Result<Option<ReputationRecord>, StoreError> {
            self.0.reputation(identity).await
        }

        async fn apply_reputation(
            &self,
            _change: &ReputationChange,
            _policy: &ReputationPolicy,
        ) -> Result<(ReputationRecord, ReputationEvent), StoreError> {
            Err(StoreError::Corrupt("reputation table unavailable".into()))
        }

        async fn reputation_history(
            &self,
            identity: &str,
            limit: u32,
        ) -> Result<Vec<ReputationEvent>, StoreError> {
            self.0.reputation_history(identity, limit).await
        }

        async fn leaderboard(&self, limit: u32) -> Result<Vec<ReputationRecord>, StoreError> {
            self.0.leaderboard(limit).await
        }

        async fn enqueue_mirror(&self, record: &MirrorRecord) -> Result<(), StoreError> {
            self.0.enqueue_mirror(record).await
        }

        async fn update_mirror(&self, record: &MirrorRecord) -> Result<(), StoreError> {
            self.0.update_mirror(record).await
        }

        async fn claim_mirror(
            &self,
            record: &MirrorRecord,
            seen_attempts: u32,
        ) -> Result<bool, StoreError> {
            self.0.claim_mirror(record, seen_attempts).await
        }

        async fn mirror_backlog(
            &self,
            max_attempts: u32,
            stale_before: DateTime<Utc>,
            limit: u32,
        ) -> Result<Vec<MirrorRecord>, StoreError> {
            self.0.mirror_backlog(max_attempts, stale_before, limit).await
        }

        async fn mirror_records(&self, target: &MirrorTarget) -> Result<Vec<MirrorRecord>, StoreError> {
            self.0.mirror_records(target).await
        }
    }

    #[tokio::test]
    async fn test_rewards_commit_with_the_transition() {
        let store = Arc::new(ReputationWritesFail(MemoryStore::new()));
        let engine = engine_over(store.clone());
        let claim = engine
            .submit("alice", match_request("Red Lions", "Blue Sharks"))
            .await
            .unwrap();

        for who in ["bob", "carol", "dave"] {
            engine.attest(claim.id, who, player()).await.unwrap();
        }
        assert_eq!(store.claim(claim.id).await.unwrap().status, ClaimStatus::Verified);
        for who in ["bob", "carol", "dave"] {
            let record = engine.reputation(who).await.unwrap();
            assert_eq!(record.score, 105);
            assert_eq!(record.successful_verifications, 1);
            assert_eq!(engine.reputation_history(who, None).await.unwrap().len(), 2);
        }
    }
}
