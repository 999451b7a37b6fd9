//! Dispute Handler: disputes, forced DISPUTED transitions and governance resolution.

use chrono::Utc;
use matchproof_core::{Dispute, DisputeStatus, MatchClaim, ReputationChange, ResolutionOutcome};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{
    check_identity, check_text, Engine, VoteReceipt, MAX_EVIDENCE_LEN, MAX_REASON_LEN,
    MAX_RESOLUTION_LEN,
};
use crate::chain::{ChainOp, MirrorTarget};
use crate::error::EngineError;

#[derive(Debug, Clone, Deserialize)]
pub struct DisputeRequest {
    pub reason: String,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub outcome: ResolutionOutcome,
    pub resolution: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionReceipt {
    pub claim: MatchClaim,
    pub disputes: Vec<Dispute>,
    pub reputation: Vec<ReputationChange>,
}

impl Engine {
    /// Record a rejecting vote. Crossing the dispute threshold forces
    /// DISPUTED from PENDING or VERIFIED regardless of approve weight.
    pub async fn dispute(
        &self,
        claim_id: Uuid,
        disputer: &str,
        request: DisputeRequest,
    ) -> Result<VoteReceipt<Dispute>, EngineError> {
        check_identity(disputer)?;
        check_text("reason", &request.reason, MAX_REASON_LEN, false)?;
        if let Some(evidence) = &request.evidence {
            check_text("evidence", evidence, MAX_EVIDENCE_LEN, true)?;
        }
        let claim = self.store.claim(claim_id).await?;
        if claim.submitter == disputer {
            return Err(EngineError::SelfVerification {
                claim_id,
                identity: disputer.to_string(),
            });
        }
        let standing = self.reputation.ensure_eligible(disputer).await?;
        let role = self.roles.role_for(&claim, disputer);

        let guard = self.claims.lock(&claim_id).await;
        let now = Utc::now();
        let dispute = Dispute {
            id: Uuid::new_v4(),
            claim_id,
            disputer: disputer.to_string(),
            disputer_reputation: standing.score,
            role,
            reason: request.reason.trim().to_string(),
            evidence: request.evidence.filter(|e| !e.trim().is_empty()),
            weight: role.weight(),
            status: DisputeStatus::Open,
            resolution: None,
            chain_tx: None,
            created_at: now,
            updated_at: now,
        };
        let commit = self
            .store
            .commit_dispute(dispute, &self.config.thresholds, self.reputation.policy())
            .await?;
        drop(guard);

        info!(
            claim_id = %claim_id,
            disputer = %disputer,
            role = %role,
            dispute_weight = commit.claim.dispute_weight,
            status = %commit.claim.status,
            "Dispute recorded"
        );
        if let Some(change) = commit.transitioned() {
            self.events.publish(&change);
        }

        let mut receipt = VoteReceipt {
            vote: commit.vote,
            claim: commit.claim,
        };
        let op = ChainOp::DisputeMatch {
            external_ref: receipt.claim.external_ref.clone(),
            disputer: disputer.to_string(),
            reason: receipt.vote.reason.clone(),
            evidence: receipt.vote.evidence.clone().unwrap_or_default(),
        };
        let target = MirrorTarget::Dispute {
            claim_id,
            dispute_id: receipt.vote.id,
        };
        let tx_id = self.mirror_op(target, op).await?;
        receipt.vote.chain_tx = Some(tx_id);
        Ok(receipt)
    }

    /// Move the open disputes of a DISPUTED claim under investigation.
    pub async fn investigate(
        &self,
        claim_id: Uuid,
        resolver: &str,
    ) -> Result<Vec<Dispute>, EngineError> {
        self.authorize_resolver(resolver)?;
        let _guard = self.claims.lock(&claim_id).await;
        let disputes = self.store.mark_investigating(claim_id).await?;
        info!(claim_id = %claim_id, resolver = %resolver, count = disputes.len(), "Disputes under investigation");
        Ok(disputes)
    }

    /// Close a DISPUTED claim as REJECTED (upheld) or RESOLVED (dismissed)
    /// and settle reputation for everyone involved.
    pub async fn resolve(
        &self,
        claim_id: Uuid,
        resolver: &str,
        request: ResolveRequest,
    ) -> Result<ResolutionReceipt, EngineError> {
        self.authorize_resolver(resolver)?;
        check_text("resolution", &request.resolution, MAX_RESOLUTION_LEN, false)?;

        let guard = self.claims.lock(&claim_id).await;
        let commit = self
            .store
            .commit_resolution(
                claim_id,
                request.outcome,
                request.resolution.trim(),
                self.reputation.policy(),
            )
            .await?;
        drop(guard);

        info!(
            claim_id = %claim_id,
            resolver = %resolver,
            outcome = ?request.outcome,
            status = %commit.claim.status,
            "Dispute resolved"
        );
        if let Some(change) = commit.transitioned() {
            self.events.publish(&change);
        }
        self.mirror_reputation(claim_id, commit.reputation.clone());

        Ok(ResolutionReceipt {
            claim: commit.claim,
            disputes: commit.disputes,
            reputation: commit.reputation,
        })
    }

    fn authorize_resolver(&self, resolver: &str) -> Result<(), EngineError> {
        check_identity(resolver)?;
        if !self.config.is_resolver(resolver) {
            return Err(EngineError::Unauthorized(resolver.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::store::Store;
    use super::super::AttestRequest;
    use super::*;
    use matchproof_core::{ClaimStatus, VerifierRole};

    fn reason() -> DisputeRequest {
        DisputeRequest {
            reason: "score was 1-2".into(),
            evidence: Some("https://example.org/scoresheet.jpg".into()),
        }
    }

    fn player() -> AttestRequest {
        AttestRequest {
            role: VerifierRole::Player,
        }
    }

    async fn disputed(h: &Harness) -> MatchClaim {
        let claim = h
            .engine
            .submit("alice", match_request("Red Lions", "Blue Sharks"))
            .await
            .unwrap();
        h.engine.attest(claim.id, "bob", player()).await.unwrap();
        h.engine.dispute(claim.id, "carol", reason()).await.unwrap();
        let receipt = h.engine.dispute(claim.id, "dave", reason()).await.unwrap();
        assert_eq!(receipt.claim.status, ClaimStatus::Disputed);
        receipt.claim
    }

    #[tokio::test]
    async fn test_two_player_disputes_preempt_later_approvals() {
        let h = harness();
        let claim = disputed(&h).await;
        for who in ["erin", "frank", "gina"] {
            let receipt = h.engine.attest(claim.id, who, player()).await.unwrap();
            assert_eq!(receipt.claim.status, ClaimStatus::Disputed);
        }
        let stored = h.store.claim(claim.id).await.unwrap();
        assert_eq!(stored.approve_weight, 40);
        assert_eq!(stored.status, ClaimStatus::Disputed);
    }

    #[tokio::test]
    async fn test_late_dispute_moves_verified_to_disputed() {
        let h = harness();
        let claim = h
            .engine
            .submit("alice", match_request("Red Lions", "Blue Sharks"))
            .await
            .unwrap();
        h.roster.assign("coach-tom", VerifierRole::Coach);
        let referee = AttestRequest {
            role: VerifierRole::Referee,
        };
        h.engine.attest(claim.id, "ref-jane", referee).await.unwrap();
        let receipt = h.engine.dispute(claim.id, "coach-tom", reason()).await.unwrap();
        assert_eq!(receipt.vote.weight, 20);
        assert_eq!(receipt.claim.status, ClaimStatus::Disputed);
    }

    #[tokio::test]
    async fn test_dispute_guards() {
        let h = harness();
        let claim = h
            .engine
            .submit("alice", match_request("Red Lions", "Blue Sharks"))
            .await
            .unwrap();
        h.engine.attest(claim.id, "bob", player()).await.unwrap();
        h.engine.dispute(claim.id, "carol", reason()).await.unwrap();

        let err = h.engine.dispute(claim.id, "carol", reason()).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateDispute { .. }));
        let err = h.engine.dispute(claim.id, "bob", reason()).await.unwrap_err();
        assert!(matches!(err, EngineError::ConflictingVote { .. }));
        let err = h.engine.dispute(claim.id, "alice", reason()).await.unwrap_err();
        assert!(matches!(err, EngineError::SelfVerification { .. }));
        let blank = DisputeRequest {
            reason: "  ".into(),
            evidence: None,
        };
        let err = h.engine.dispute(claim.id, "dave", blank).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let stored = h.store.claim(claim.id).await.unwrap();
        assert_eq!(stored.dispute_weight, 10);
        let carol = h.engine.reputation("carol").await.unwrap();
        assert_eq!(carol.disputes_raised, 1);
    }

    #[tokio::test]
    async fn test_resolution_requires_allowlisted_resolver() {
        let h = harness();
        let claim = disputed(&h).await;
        let request = ResolveRequest {
            outcome: ResolutionOutcome::Upheld,
            resolution: "video review".into(),
        };
        let err = h
            .engine
            .resolve(claim.id, "bob", request.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
        let err = h.engine.investigate(claim.id, "bob").await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
        assert_eq!(
            h.store.claim(claim.id).await.unwrap().status,
            ClaimStatus::Disputed
        );
    }

    #[tokio::test]
    async fn test_upheld_dispute_rejects_claim_and_settles_reputation() {
        let h = harness();
        let claim = disputed(&h).await;
        let mut events = h.events.subscribe();

        let investigating = h.engine.investigate(claim.id, "league-admin").await.unwrap();
        assert_eq!(investigating.len(), 2);

        let receipt = h
            .engine
            .resolve(
                claim.id,
                "league-admin",
                ResolveRequest {
                    outcome: ResolutionOutcome::Upheld,
                    resolution: "scoresheet shows 1-2".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.claim.status, ClaimStatus::Rejected);
        assert!(receipt
            .disputes
            .iter()
            .all(|d| d.status == DisputeStatus::Resolved));
        let event = events.recv().await.unwrap();
        assert_eq!(event.to, ClaimStatus::Rejected);

        let carol = h.engine.reputation("carol").await.unwrap();
        assert_eq!(carol.score, 110);
        assert_eq!(carol.disputes_won, 1);
        assert_eq!(h.engine.reputation("alice").await.unwrap().score, 80);
        assert_eq!(h.engine.reputation("bob").await.unwrap().score, 95);

        let err = h.engine.attest(claim.id, "erin", player()).await.unwrap_err();
        assert!(matches!(err, EngineError::ClaimClosed { .. }));
    }

    #[tokio::test]
    async fn test_dismissed_dispute_resolves_claim_and_rewards_attesters() {
        let h = harness();
        let claim = disputed(&h).await;
        let receipt = h
            .engine
            .resolve(
                claim.id,
                "league-admin",
                ResolveRequest {
                    outcome: ResolutionOutcome::Dismissed,
                    resolution: "referee report confirms 2-1".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.claim.status, ClaimStatus::Resolved);
        assert!(receipt
            .disputes
            .iter()
            .all(|d| d.status == DisputeStatus::Dismissed));

        assert_eq!(h.engine.reputation("carol").await.unwrap().score, 90);
        let bob = h.engine.reputation("bob").await.unwrap();
        assert_eq!(bob.score, 105);
        assert_eq!(bob.successful_verifications, 1);
        assert_eq!(h.engine.reputation("alice").await.unwrap().score, 100);
    }

    #[tokio::test]
    async fn test_resolving_undisputed_claim_is_invalid() {
        let h = harness();
        let claim = h
            .engine
            .submit("alice", match_request("Red Lions", "Blue Sharks"))
            .await
            .unwrap();
        let err = h
            .engine
            .resolve(
                claim.id,
                "league-admin",
                ResolveRequest {
                    outcome: ResolutionOutcome::Dismissed,
                    resolution: "nothing to resolve".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { status: ClaimStatus::Pending, .. }
        ));
    }
}
