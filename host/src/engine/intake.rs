//! Submission Intake: validate, create the PENDING claim, anchor it on chain.

use chrono::{DateTime, Utc};
use matchproof_core::{claim_reference, normalize_team, ClaimStatus, MatchClaim};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{
    check_identity, check_text, Engine, MAX_METADATA_LEN, MAX_REFERENCE_LEN, MAX_TEAM_LEN,
};
use crate::chain::{ChainOp, MirrorTarget};
use crate::error::EngineError;

/// A result claim as reported by the submitter.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitClaim {
    pub home_team: String,
    pub away_team: String,
    /// Signed so negative input is a validation error, not a parse error.
    pub home_score: i64,
    pub away_score: i64,
    #[serde(default)]
    pub metadata: Option<String>,
    /// Chain reference chosen by the caller; derived when absent.
    #[serde(default)]
    pub external_ref: Option<String>,
    #[serde(default)]
    pub played_at: Option<DateTime<Utc>>,
}

fn check_score(field: &str, score: i64) -> Result<u32, EngineError> {
    u32::try_from(score)
        .map_err(|_| EngineError::Validation(format!("{field} must be a non-negative integer")))
}

impl SubmitClaim {
    /// Returns the validated scores.
    fn validate(&self) -> Result<(u32, u32), EngineError> {
        check_text("home_team", &self.home_team, MAX_TEAM_LEN, false)?;
        check_text("away_team", &self.away_team, MAX_TEAM_LEN, false)?;
        if normalize_team(&self.home_team) == normalize_team(&self.away_team) {
            return Err(EngineError::Validation(
                "home_team and away_team must differ".into(),
            ));
        }
        if let Some(metadata) = &self.metadata {
            check_text("metadata", metadata, MAX_METADATA_LEN, true)?;
        }
        if let Some(external_ref) = &self.external_ref {
            check_text("external_ref", external_ref, MAX_REFERENCE_LEN, false)?;
        }
        Ok((
            check_score("home_score", self.home_score)?,
            check_score("away_score", self.away_score)?,
        ))
    }
}

fn anchor_op(claim: &MatchClaim) -> ChainOp {
    ChainOp::SubmitMatch {
        external_ref: claim.external_ref.clone(),
        home_team: claim.home_team.clone(),
        away_team: claim.away_team.clone(),
        home_score: claim.home_score,
        away_score: claim.away_score,
        submitter: claim.submitter.clone(),
        metadata: claim.metadata.clone().unwrap_or_default(),
    }
}

impl Engine {
    /// Create a PENDING claim and anchor it.
    ///
    /// The claim is persisted before the ledger is touched; a chain failure
    /// returns `ChainUnavailable`/`ChainTimeout` while the claim stays
    /// PENDING with no chain reference.
    pub async fn submit(
        &self,
        submitter: &str,
        request: SubmitClaim,
    ) -> Result<MatchClaim, EngineError> {
        check_identity(submitter)?;
        let (home_score, away_score) = request.validate()?;
        let standing = self.reputation.ensure_eligible(submitter).await?;

        let now = Utc::now();
        let played_at = request.played_at.unwrap_or(now);
        let home_team = request.home_team.trim().to_string();
        let away_team = request.away_team.trim().to_string();
        let external_ref = match request.external_ref {
            Some(external_ref) => external_ref.trim().to_string(),
            None => claim_reference(
                &home_team, &away_team, home_score, away_score, submitter, played_at,
            ),
        };
        let mut claim = MatchClaim {
            id: Uuid::new_v4(),
            external_ref,
            home_team,
            away_team,
            home_score,
            away_score,
            submitter: submitter.to_string(),
            submitter_reputation: standing.score,
            status: ClaimStatus::Pending,
            required_weight: self.config.thresholds.acceptance_threshold,
            approve_weight: 0,
            dispute_weight: 0,
            metadata: request.metadata,
            chain_tx: None,
            played_at,
            verified_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_claim(&claim).await?;
        info!(
            claim_id = %claim.id,
            external_ref = %claim.external_ref,
            submitter = %claim.submitter,
            "Claim submitted"
        );

        let tx_id = self
            .mirror_op(MirrorTarget::Claim { claim_id: claim.id }, anchor_op(&claim))
            .await?;
        claim.chain_tx = Some(tx_id);
        Ok(claim)
    }

    /// Re-drive the anchor of a claim that has no chain reference yet.
    pub async fn reanchor(&self, claim_id: Uuid) -> Result<MatchClaim, EngineError> {
        let mut claim = self.store.claim(claim_id).await?;
        if claim.chain_tx.is_some() {
            return Ok(claim);
        }
        let target = MirrorTarget::Claim { claim_id };
        let pending = self
            .store
            .mirror_records(&target)
            .await?
            .into_iter()
            .filter(|record| record.status.needs_retry())
            .last();
        info!(claim_id = %claim_id, resumed = pending.is_some(), "Re-anchoring claim");
        let result = match pending {
            Some(record) => self.mirror.redrive(record).await,
            None => self.mirror.mirror(target, anchor_op(&claim)).await,
        };
        let tx_id = result.map_err(|err| EngineError::from_mirror(claim_id, err))?;
        claim.chain_tx = Some(tx_id);
        Ok(claim)
    }
}
