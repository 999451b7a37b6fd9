//! PostgreSQL store. Vote commits lock the claim row for the whole
//! insert / re-tally / update sequence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchproof_core::{
    normalize_team, Attestation, ClaimStatus, Dispute, DisputeStatus, MatchClaim,
    ReputationChange, ReputationEvent, ReputationPolicy, ReputationRecord, ResolutionOutcome,
    Tally, ThresholdPolicy, VerifierRole,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use super::{
    attestation_rewards, dispute_raised, ensure_open, settle_claim, settlement, ClaimFilter,
    ClaimPage, ResolutionCommit, Store, StoreError, VoteCommit,
};
use crate::chain::{ChainOp, MirrorRecord, MirrorStatus, MirrorTarget};

#[derive(sqlx::FromRow)]
struct ClaimRow {
    id: Uuid,
    external_ref: String,
    home_team: String,
    away_team: String,
    home_score: i64,
    away_score: i64,
    submitter: String,
    submitter_reputation: i64,
    status: String,
    required_weight: i64,
    approve_weight: i64,
    dispute_weight: i64,
    metadata: Option<String>,
    chain_tx: Option<String>,
    played_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ClaimRow> for MatchClaim {
    type Error = StoreError;

    fn try_from(row: ClaimRow) -> Result<Self, StoreError> {
        Ok(MatchClaim {
            id: row.id,
            external_ref: row.external_ref,
            home_team: row.home_team,
            away_team: row.away_team,
            home_score: to_u32("home_score", row.home_score)?,
            away_score: to_u32("away_score", row.away_score)?,
            submitter: row.submitter,
            submitter_reputation: row.submitter_reputation,
            status: parse_enum(&row.status)?,
            required_weight: to_u32("required_weight", row.required_weight)?,
            approve_weight: to_u32("approve_weight", row.approve_weight)?,
            dispute_weight: to_u32("dispute_weight", row.dispute_weight)?,
            metadata: row.metadata,
            chain_tx: row.chain_tx,
            played_at: row.played_at,
            verified_at: row.verified_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttestationRow {
    id: Uuid,
    claim_id: Uuid,
    verifier: String,
    verifier_reputation: i64,
    role: String,
    weight: i64,
    chain_tx: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AttestationRow> for Attestation {
    type Error = StoreError;

    fn try_from(row: AttestationRow) -> Result<Self, StoreError> {
        Ok(Attestation {
            id: row.id,
            claim_id: row.claim_id,
            verifier: row.verifier,
            verifier_reputation: row.verifier_reputation,
            role: parse_enum::<VerifierRole>(&row.role)?,
            weight: to_u32("weight", row.weight)?,
            chain_tx: row.chain_tx,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DisputeRow {
    id: Uuid,
    claim_id: Uuid,
    disputer: String,
    disputer_reputation: i64,
    role: String,
    reason: String,
    evidence: Option<String>,
    weight: i64,
    status: String,
    resolution: Option<String>,
    chain_tx: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DisputeRow> for Dispute {
    type Error = StoreError;

    fn try_from(row: DisputeRow) -> Result<Self, StoreError> {
        Ok(Dispute {
            id: row.id,
            claim_id: row.claim_id,
            disputer: row.disputer,
            disputer_reputation: row.disputer_reputation,
            role: parse_enum::<VerifierRole>(&row.role)?,
            reason: row.reason,
            evidence: row.evidence,
            weight: to_u32("weight", row.weight)?,
            status: parse_enum::<DisputeStatus>(&row.status)?,
            resolution: row.resolution,
            chain_tx: row.chain_tx,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReputationRow {
    identity: String,
    score: i64,
    verification_count: i64,
    successful_verifications: i64,
    disputes_raised: i64,
    disputes_won: i64,
    updated_at: DateTime<Utc>,
}

impl From<ReputationRow> for ReputationRecord {
    fn from(row: ReputationRow) -> Self {
        ReputationRecord {
            identity: row.identity,
            score: row.score,
            verification_count: row.verification_count.max(0) as u64,
            successful_verifications: row.successful_verifications.max(0) as u64,
            disputes_raised: row.disputes_raised.max(0) as u64,
            disputes_won: row.disputes_won.max(0) as u64,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    identity: String,
    delta: i64,
    reason: String,
    score_after: i64,
    at: DateTime<Utc>,
}

impl From<EventRow> for ReputationEvent {
    fn from(row: EventRow) -> Self {
        ReputationEvent {
            identity: row.identity,
            delta: row.delta,
            reason: row.reason,
            score_after: row.score_after,
            at: row.at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MirrorRow {
    id: Uuid,
    target: Json<MirrorTarget>,
    operation: Json<ChainOp>,
    status: String,
    attempts: i32,
    tx_id: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MirrorRow> for MirrorRecord {
    type Error = StoreError;

    fn try_from(row: MirrorRow) -> Result<Self, StoreError> {
        let status = MirrorStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("mirror status {:?}", row.status)))?;
        Ok(MirrorRecord {
            id: row.id,
            target: row.target.0,
            operation: row.operation.0,
            status,
            attempts: row.attempts.max(0) as u32,
            tx_id: row.tx_id,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_u32(field: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field} = {value}")))
}

/// The outbox `attempts` column is an INTEGER; saturate instead of wrapping.
fn attempts_column(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn parse_enum<T>(value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err: T::Err| StoreError::Corrupt(err.to_string()))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_claim(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<MatchClaim, StoreError> {
        let row = sqlx::query_as::<_, ClaimRow>("SELECT * FROM match_claims WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::ClaimNotFound(id))?;
        row.try_into()
    }

    async fn tally(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Tally, StoreError> {
        let (approve, dispute) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT \
                (SELECT COALESCE(SUM(weight), 0) FROM attestations WHERE claim_id = $1)::BIGINT, \
                (SELECT COALESCE(SUM(weight), 0) FROM disputes WHERE claim_id = $1)::BIGINT",
        )
        .bind(id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(Tally {
            approve: approve.clamp(0, i64::from(u32::MAX)) as u32,
            dispute: dispute.clamp(0, i64::from(u32::MAX)) as u32,
        })
    }

    async fn save_settled(
        tx: &mut Transaction<'_, Postgres>,
        claim: &MatchClaim,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE match_claims SET status = $2, approve_weight = $3, dispute_weight = $4, \
             verified_at = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(claim.id)
        .bind(claim.status.as_str())
        .bind(i64::from(claim.approve_weight))
        .bind(i64::from(claim.dispute_weight))
        .bind(claim.verified_at)
        .bind(claim.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn attestations_in(
        tx: &mut Transaction<'_, Postgres>,
        claim_id: Uuid,
    ) -> Result<Vec<Attestation>, StoreError> {
        sqlx::query_as::<_, AttestationRow>(
            "SELECT * FROM attestations WHERE claim_id = $1 ORDER BY created_at, id",
        )
        .bind(claim_id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(Attestation::try_from)
        .collect()
    }

    /// Clamped upsert of one identity plus its audit row, inside `tx`.
    async fn apply_in(
        tx: &mut Transaction<'_, Postgres>,
        change: &ReputationChange,
        policy: &ReputationPolicy,
    ) -> Result<(ReputationRecord, ReputationEvent), StoreError> {
        // Any delta wider than the score range clamps the same way; bounding
        // it keeps the SQL arithmetic inside BIGINT.
        let span = policy.ceiling.saturating_sub(policy.floor);
        let delta = change.delta.clamp(-span, span);
        let counters = change.counters;

        let row = sqlx::query_as::<_, ReputationRow>(
            "INSERT INTO reputations (identity, score, verification_count, successful_verifications, \
             disputes_raised, disputes_won, updated_at) \
             VALUES ($1, LEAST(GREATEST($2 + $3, $4), $5), $6, $7, $8, $9, now()) \
             ON CONFLICT (identity) DO UPDATE SET \
               score = LEAST(GREATEST(reputations.score + $3, $4), $5), \
               verification_count = reputations.verification_count + $6, \
               successful_verifications = reputations.successful_verifications + $7, \
               disputes_raised = reputations.disputes_raised + $8, \
               disputes_won = reputations.disputes_won + $9, \
               updated_at = now() \
             RETURNING *",
        )
        .bind(&change.identity)
        .bind(policy.initial)
        .bind(delta)
        .bind(policy.floor)
        .bind(policy.ceiling)
        .bind(counters.verifications as i64)
        .bind(counters.successful_verifications as i64)
        .bind(counters.disputes_raised as i64)
        .bind(counters.disputes_won as i64)
        .fetch_one(&mut **tx)
        .await?;
        let record = ReputationRecord::from(row);

        let event = ReputationEvent {
            identity: change.identity.clone(),
            delta: change.delta,
            reason: change.reason.clone(),
            score_after: record.score,
            at: record.updated_at,
        };
        sqlx::query(
            "INSERT INTO reputation_events (identity, delta, reason, score_after, at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&event.identity)
        .bind(event.delta)
        .bind(&event.reason)
        .bind(event.score_after)
        .bind(event.at)
        .execute(&mut **tx)
        .await?;
        Ok((record, event))
    }

    async fn credit(
        tx: &mut Transaction<'_, Postgres>,
        changes: &[ReputationChange],
        policy: &ReputationPolicy,
    ) -> Result<(), StoreError> {
        for change in changes {
            Self::apply_in(tx, change, policy).await?;
        }
        Ok(())
    }

    async fn voted(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        column: &str,
        claim_id: Uuid,
        identity: &str,
    ) -> Result<bool, StoreError> {
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE claim_id = $1 AND {column} = $2)");
        let (exists,) = sqlx::query_as::<_, (bool,)>(&sql)
            .bind(claim_id)
            .bind(identity)
            .fetch_one(&mut **tx)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_claim(&self, claim: &MatchClaim) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO match_claims (id, external_ref, home_team, away_team, home_key, away_key, \
             home_score, away_score, submitter, submitter_reputation, status, required_weight, \
             approve_weight, dispute_weight, metadata, chain_tx, played_at, verified_at, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
        )
        .bind(claim.id)
        .bind(&claim.external_ref)
        .bind(&claim.home_team)
        .bind(&claim.away_team)
        .bind(normalize_team(&claim.home_team))
        .bind(normalize_team(&claim.away_team))
        .bind(i64::from(claim.home_score))
        .bind(i64::from(claim.away_score))
        .bind(&claim.submitter)
        .bind(claim.submitter_reputation)
        .bind(claim.status.as_str())
        .bind(i64::from(claim.required_weight))
        .bind(i64::from(claim.approve_weight))
        .bind(i64::from(claim.dispute_weight))
        .bind(&claim.metadata)
        .bind(&claim.chain_tx)
        .bind(claim.played_at)
        .bind(claim.verified_at)
        .bind(claim.created_at)
        .bind(claim.updated_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::DuplicateReference(claim.external_ref.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn claim(&self, id: Uuid) -> Result<MatchClaim, StoreError> {
        sqlx::query_as::<_, ClaimRow>("SELECT * FROM match_claims WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::ClaimNotFound(id))?
            .try_into()
    }

    async fn list_claims(&self, filter: &ClaimFilter) -> Result<ClaimPage, StoreError> {
        const WHERE: &str = "WHERE ($1::TEXT IS NULL OR status = $1) \
                             AND ($2::TEXT IS NULL OR home_key = $2 OR away_key = $2)";
        let status = filter.status.map(ClaimStatus::as_str);
        let team = filter.team.as_deref().map(normalize_team);

        let (total,) = sqlx::query_as::<_, (i64,)>(&format!("SELECT COUNT(*) FROM match_claims {WHERE}"))
            .bind(status)
            .bind(&team)
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, ClaimRow>(&format!(
            "SELECT * FROM match_claims {WHERE} ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
        ))
        .bind(status)
        .bind(&team)
        .bind(i64::from(filter.limit()))
        .bind(i64::from(filter.offset()))
        .fetch_all(&self.pool)
        .await?;
        let claims = rows
            .into_iter()
            .map(MatchClaim::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClaimPage::new(claims, total.max(0) as u64, filter))
    }

    async fn attestations(&self, claim_id: Uuid) -> Result<Vec<Attestation>, StoreError> {
        sqlx::query_as::<_, AttestationRow>(
            "SELECT * FROM attestations WHERE claim_id = $1 ORDER BY created_at, id",
        )
        .bind(claim_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Attestation::try_from)
        .collect()
    }

    async fn disputes(&self, claim_id: Uuid) -> Result<Vec<Dispute>, StoreError> {
        sqlx::query_as::<_, DisputeRow>(
            "SELECT * FROM disputes WHERE claim_id = $1 ORDER BY created_at, id",
        )
        .bind(claim_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Dispute::try_from)
        .collect()
    }

    async fn commit_attestation(
        &self,
        attestation: Attestation,
        thresholds: &ThresholdPolicy,
        reputation: &ReputationPolicy,
    ) -> Result<VoteCommit<Attestation>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut claim = Self::lock_claim(&mut tx, attestation.claim_id).await?;
        ensure_open(&claim)?;
        if Self::voted(&mut tx, "disputes", "disputer", claim.id, &attestation.verifier).await? {
            return Err(StoreError::ConflictingVote {
                claim_id: claim.id,
                identity: attestation.verifier,
            });
        }
        let inserted = sqlx::query(
            "INSERT INTO attestations (id, claim_id, verifier, verifier_reputation, role, weight, \
             chain_tx, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(attestation.id)
        .bind(attestation.claim_id)
        .bind(&attestation.verifier)
        .bind(attestation.verifier_reputation)
        .bind(attestation.role.as_str())
        .bind(i64::from(attestation.weight))
        .bind(&attestation.chain_tx)
        .bind(attestation.created_at)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::DuplicateAttestation {
                    claim_id: claim.id,
                    identity: attestation.verifier,
                });
            }
            Err(err) => return Err(err.into()),
        }
        let tally = Self::tally(&mut tx, claim.id).await?;
        let previous = settle_claim(&mut claim, tally, thresholds, attestation.created_at);
        Self::save_settled(&mut tx, &claim).await?;
        let attesters = Self::attestations_in(&mut tx, claim.id).await?;
        let changes = attestation_rewards(&attestation, &attesters, previous, &claim, reputation);
        Self::credit(&mut tx, &changes, reputation).await?;
        tx.commit().await?;
        Ok(VoteCommit {
            vote: attestation,
            claim,
            previous,
            reputation: changes,
        })
    }

    async fn commit_dispute(
        &self,
        dispute: Dispute,
        thresholds: &ThresholdPolicy,
        reputation: &ReputationPolicy,
    ) -> Result<VoteCommit<Dispute>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut claim = Self::lock_claim(&mut tx, dispute.claim_id).await?;
        ensure_open(&claim)?;
        if Self::voted(&mut tx, "attestations", "verifier", claim.id, &dispute.disputer).await? {
            return Err(StoreError::ConflictingVote {
                claim_id: claim.id,
                identity: dispute.disputer,
            });
        }
        let inserted = sqlx::query(
            "INSERT INTO disputes (id, claim_id, disputer, disputer_reputation, role, reason, \
             evidence, weight, status, resolution, chain_tx, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(dispute.id)
        .bind(dispute.claim_id)
        .bind(&dispute.disputer)
        .bind(dispute.disputer_reputation)
        .bind(dispute.role.as_str())
        .bind(&dispute.reason)
        .bind(&dispute.evidence)
        .bind(i64::from(dispute.weight))
        .bind(dispute.status.as_str())
        .bind(&dispute.resolution)
        .bind(&dispute.chain_tx)
        .bind(dispute.created_at)
        .bind(dispute.updated_at)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::DuplicateDispute {
                    claim_id: claim.id,
                    identity: dispute.disputer,
                });
            }
            Err(err) => return Err(err.into()),
        }
        let tally = Self::tally(&mut tx, claim.id).await?;
        let previous = settle_claim(&mut claim, tally, thresholds, dispute.created_at);
        Self::save_settled(&mut tx, &claim).await?;
        let changes = dispute_raised(&dispute);
        Self::credit(&mut tx, &changes, reputation).await?;
        tx.commit().await?;
        Ok(VoteCommit {
            vote: dispute,
            claim,
            previous,
            reputation: changes,
        })
    }

    async fn mark_investigating(&self, claim_id: Uuid) -> Result<Vec<Dispute>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let claim = Self::lock_claim(&mut tx, claim_id).await?;
        if claim.status != ClaimStatus::Disputed {
            return Err(StoreError::InvalidState {
                claim_id,
                status: claim.status,
            });
        }
        let rows = sqlx::query_as::<_, DisputeRow>(
            "UPDATE disputes SET status = $2, updated_at = now() \
             WHERE claim_id = $1 AND status = $3 RETURNING *",
        )
        .bind(claim_id)
        .bind(DisputeStatus::Investigating.as_str())
        .bind(DisputeStatus::Open.as_str())
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.into_iter().map(Dispute::try_from).collect()
    }

    async fn commit_resolution(
        &self,
        claim_id: Uuid,
        outcome: ResolutionOutcome,
        resolution: &str,
        reputation: &ReputationPolicy,
    ) -> Result<ResolutionCommit, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut claim = Self::lock_claim(&mut tx, claim_id).await?;
        let previous = claim.status;
        if previous != ClaimStatus::Disputed {
            return Err(StoreError::InvalidState {
                claim_id,
                status: previous,
            });
        }
        let now = Utc::now();
        let disputes = sqlx::query_as::<_, DisputeRow>(
            "UPDATE disputes SET status = $2, resolution = $3, updated_at = $4 \
             WHERE claim_id = $1 AND status IN ($5, $6) RETURNING *",
        )
        .bind(claim_id)
        .bind(outcome.dispute_status().as_str())
        .bind(resolution)
        .bind(now)
        .bind(DisputeStatus::Open.as_str())
        .bind(DisputeStatus::Investigating.as_str())
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(Dispute::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        claim.status = outcome.claim_status();
        claim.updated_at = now;
        Self::save_settled(&mut tx, &claim).await?;

        let attestations = Self::attestations_in(&mut tx, claim_id).await?;
        let changes = settlement(&claim, outcome, &disputes, &attestations, reputation);
        Self::credit(&mut tx, &changes, reputation).await?;
        tx.commit().await?;

        Ok(ResolutionCommit {
            claim,
            previous,
            disputes,
            attestations,
            reputation: changes,
        })
    }

    async fn set_chain_tx(&self, target: &MirrorTarget, tx_id: &str) -> Result<(), StoreError> {
        let query = match target {
            MirrorTarget::Claim { claim_id } => {
                sqlx::query("UPDATE match_claims SET chain_tx = $2 WHERE id = $1").bind(*claim_id)
            }
            MirrorTarget::Attestation { attestation_id, .. } => {
                sqlx::query("UPDATE attestations SET chain_tx = $2 WHERE id = $1")
                    .bind(*attestation_id)
            }
            MirrorTarget::Dispute { dispute_id, .. } => {
                sqlx::query("UPDATE disputes SET chain_tx = $2 WHERE id = $1").bind(*dispute_id)
            }
            MirrorTarget::Reputation { .. } => return Ok(()),
        };
        query.bind(tx_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn reputation(&self, identity: &str) -> Result<Option<ReputationRecord>, StoreError> {
        let row = sqlx::query_as::<_, ReputationRow>("SELECT * FROM reputations WHERE identity = $1")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ReputationRecord::from))
    }

    async fn apply_reputation(
        &self,
        change: &ReputationChange,
        policy: &ReputationPolicy,
    ) -> Result<(ReputationRecord, ReputationEvent), StoreError> {
        let mut tx = self.pool.begin().await?;
        let applied = Self::apply_in(&mut tx, change, policy).await?;
        tx.commit().await?;
        Ok(applied)
    }

    async fn reputation_history(
        &self,
        identity: &str,
        limit: u32,
    ) -> Result<Vec<ReputationEvent>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT identity, delta, reason, score_after, at FROM reputation_events \
             WHERE identity = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(identity)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ReputationEvent::from).collect())
    }

    async fn leaderboard(&self, limit: u32) -> Result<Vec<ReputationRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ReputationRow>(
            "SELECT * FROM reputations ORDER BY score DESC, identity ASC LIMIT $1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ReputationRecord::from).collect())
    }

    async fn enqueue_mirror(&self, record: &MirrorRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO mirror_outbox (id, claim_id, target, operation, status, attempts, tx_id, \
             last_error, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.id)
        .bind(record.target.claim_id())
        .bind(Json(&record.target))
        .bind(Json(&record.operation))
        .bind(record.status.as_str())
        .bind(attempts_column(record.attempts))
        .bind(&record.tx_id)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_mirror(&self, record: &MirrorRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE mirror_outbox SET status = $2, attempts = $3, tx_id = $4, last_error = $5, \
             updated_at = $6 WHERE id = $1",
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(attempts_column(record.attempts))
        .bind(&record.tx_id)
        .bind(&record.last_error)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MirrorNotFound(record.id));
        }
        Ok(())
    }

    async fn claim_mirror(
        &self,
        record: &MirrorRecord,
        seen_attempts: u32,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE mirror_outbox SET attempts = $2, updated_at = $3 \
             WHERE id = $1 AND status = $4 AND attempts = $5",
        )
        .bind(record.id)
        .bind(attempts_column(record.attempts))
        .bind(record.updated_at)
        .bind(record.status.as_str())
        .bind(attempts_column(seen_attempts))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mirror_backlog(
        &self,
        max_attempts: u32,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<MirrorRecord>, StoreError> {
        let retryable: Vec<&str> = MirrorStatus::ALL
            .into_iter()
            .filter(|s| s.needs_retry())
            .map(MirrorStatus::as_str)
            .collect();
        sqlx::query_as::<_, MirrorRow>(
            "SELECT id, target, operation, status, attempts, tx_id, last_error, created_at, updated_at \
             FROM mirror_outbox \
             WHERE status = ANY($1) AND attempts < $2 AND updated_at < $3 \
             ORDER BY created_at LIMIT $4",
        )
        .bind(retryable)
        .bind(attempts_column(max_attempts))
        .bind(stale_before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(MirrorRecord::try_from)
        .collect()
    }

    async fn mirror_records(&self, target: &MirrorTarget) -> Result<Vec<MirrorRecord>, StoreError> {
        sqlx::query_as::<_, MirrorRow>(
            "SELECT id, target, operation, status, attempts, tx_id, last_error, created_at, updated_at \
             FROM mirror_outbox WHERE claim_id = $1 AND target = $2 ORDER BY created_at",
        )
        .bind(target.claim_id())
        .bind(Json(target))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(MirrorRecord::try_from)
        .collect()
    }
}
