//! In-process store: claim arena keyed by id with a write lock per claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchproof_core::{
    normalize_team, Attestation, ClaimStatus, Dispute, DisputeStatus, MatchClaim,
    ReputationChange, ReputationEvent, ReputationPolicy, ReputationRecord, ResolutionOutcome,
    Tally, ThresholdPolicy,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    attestation_rewards, dispute_raised, ensure_open, settle_claim, settlement, ClaimFilter,
    ClaimPage, ResolutionCommit, Store, StoreError, VoteCommit,
};
use crate::chain::{MirrorRecord, MirrorTarget};

struct ClaimEntry {
    claim: MatchClaim,
    attestations: Vec<Attestation>,
    disputes: Vec<Dispute>,
}

impl ClaimEntry {
    fn tally(&self) -> Tally {
        Tally::from_weights(
            self.attestations.iter().map(|a| a.weight),
            self.disputes.iter().map(|d| d.weight),
        )
    }

    fn has_attested(&self, identity: &str) -> bool {
        self.attestations.iter().any(|a| a.verifier == identity)
    }

    fn has_disputed(&self, identity: &str) -> bool {
        self.disputes.iter().any(|d| d.disputer == identity)
    }
}

type Slot = Arc<RwLock<ClaimEntry>>;

#[derive(Default)]
struct ClaimIndex {
    by_id: HashMap<Uuid, Slot>,
    by_ref: HashMap<String, Uuid>,
    /// Insertion order, oldest first.
    order: Vec<Uuid>,
}

#[derive(Default)]
struct ReputationBook {
    records: HashMap<String, ReputationRecord>,
    history: HashMap<String, Vec<ReputationEvent>>,
}

impl ReputationBook {
    fn apply(
        &mut self,
        change: &ReputationChange,
        policy: &ReputationPolicy,
        now: DateTime<Utc>,
    ) -> (ReputationRecord, ReputationEvent) {
        let record = self
            .records
            .entry(change.identity.clone())
            .or_insert_with(|| policy.fresh_record(&change.identity, now));
        let event = record.apply(change, policy, now);
        let record = record.clone();
        self.history
            .entry(change.identity.clone())
            .or_default()
            .push(event.clone());
        (record, event)
    }
}

/// Volatile store for tests, benchmarks and database-less runs.
#[derive(Default)]
pub struct MemoryStore {
    claims: RwLock<ClaimIndex>,
    reputation: Mutex<ReputationBook>,
    outbox: Mutex<Vec<MirrorRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch of changes. Callers hold the claim entry's write lock;
    /// the order is always claim entry, then reputation book.
    fn credit(&self, changes: &[ReputationChange], policy: &ReputationPolicy) {
        let now = Utc::now();
        let mut book = self.reputation.lock();
        for change in changes {
            book.apply(change, policy, now);
        }
    }

    fn slot(&self, id: Uuid) -> Result<Slot, StoreError> {
        self.claims
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(StoreError::ClaimNotFound(id))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_claim(&self, claim: &MatchClaim) -> Result<(), StoreError> {
        let mut index = self.claims.write();
        if index.by_ref.contains_key(&claim.external_ref) {
            return Err(StoreError::DuplicateReference(claim.external_ref.clone()));
        }
        let entry = ClaimEntry {
            claim: claim.clone(),
            attestations: Vec::new(),
            disputes: Vec::new(),
        };
        index.by_ref.insert(claim.external_ref.clone(), claim.id);
        index.by_id.insert(claim.id, Arc::new(RwLock::new(entry)));
        index.order.push(claim.id);
        Ok(())
    }

    async fn claim(&self, id: Uuid) -> Result<MatchClaim, StoreError> {
        Ok(self.slot(id)?.read().claim.clone())
    }

    async fn list_claims(&self, filter: &ClaimFilter) -> Result<ClaimPage, StoreError> {
        let team = filter.team.as_deref().map(normalize_team);
        let slots: Vec<Slot> = {
            let index = self.claims.read();
            index
                .order
                .iter()
                .rev()
                .filter_map(|id| index.by_id.get(id).cloned())
                .collect()
        };
        let matching: Vec<MatchClaim> = slots
            .iter()
            .map(|slot| slot.read().claim.clone())
            .filter(|claim| filter.status.map_or(true, |status| claim.status == status))
            .filter(|claim| {
                team.as_ref().map_or(true, |team| {
                    normalize_team(&claim.home_team) == *team
                        || normalize_team(&claim.away_team) == *team
                })
            })
            .collect();
        let total = matching.len() as u64;
        let claims = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit() as usize)
            .collect();
        Ok(ClaimPage::new(claims, total, filter))
    }

    async fn attestations(&self, claim_id: Uuid) -> Result<Vec<Attestation>, StoreError> {
        Ok(self.slot(claim_id)?.read().attestations.clone())
    }

    async fn disputes(&self, claim_id: Uuid) -> Result<Vec<Dispute>, StoreError> {
        Ok(self.slot(claim_id)?.read().disputes.clone())
    }

    async fn commit_attestation(
        &self,
        attestation: Attestation,
        thresholds: &ThresholdPolicy,
        reputation: &ReputationPolicy,
    ) -> Result<VoteCommit<Attestation>, StoreError> {
        let slot = self.slot(attestation.claim_id)?;
        let mut entry = slot.write();
        ensure_open(&entry.claim)?;
        if entry.has_attested(&attestation.verifier) {
            return Err(StoreError::DuplicateAttestation {
                claim_id: attestation.claim_id,
                identity: attestation.verifier,
            });
        }
        if entry.has_disputed(&attestation.verifier) {
            return Err(StoreError::ConflictingVote {
                claim_id: attestation.claim_id,
                identity: attestation.verifier,
            });
        }
        entry.attestations.push(attestation.clone());
        let tally = entry.tally();
        let previous = settle_claim(&mut entry.claim, tally, thresholds, attestation.created_at);
        let changes = attestation_rewards(
            &attestation,
            &entry.attestations,
            previous,
            &entry.claim,
            reputation,
        );
        self.credit(&changes, reputation);
        Ok(VoteCommit {
            vote: attestation,
            claim: entry.claim.clone(),
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
        let slot = self.slot(dispute.claim_id)?;
        let mut entry = slot.write();
        ensure_open(&entry.claim)?;
        if entry.has_disputed(&dispute.disputer) {
            return Err(StoreError::DuplicateDispute {
                claim_id: dispute.claim_id,
                identity: dispute.disputer,
            });
        }
        if entry.has_attested(&dispute.disputer) {
            return Err(StoreError::ConflictingVote {
                claim_id: dispute.claim_id,
                identity: dispute.disputer,
            });
        }
        entry.disputes.push(dispute.clone());
        let tally = entry.tally();
        let previous = settle_claim(&mut entry.claim, tally, thresholds, dispute.created_at);
        let changes = dispute_raised(&dispute);
        self.credit(&changes, reputation);
        Ok(VoteCommit {
            vote: dispute,
            claim: entry.claim.clone(),
            previous,
            reputation: changes,
        })
    }

    async fn mark_investigating(&self, claim_id: Uuid) -> Result<Vec<Dispute>, StoreError> {
        let slot = self.slot(claim_id)?;
        let mut entry = slot.write();
        if entry.claim.status != ClaimStatus::Disputed {
            return Err(StoreError::InvalidState {
                claim_id,
                status: entry.claim.status,
            });
        }
        let now = Utc::now();
        let mut moved = Vec::new();
        for dispute in entry
            .disputes
            .iter_mut()
            .filter(|d| d.status == DisputeStatus::Open)
        {
            dispute.status = DisputeStatus::Investigating;
            dispute.updated_at = now;
            moved.push(dispute.clone());
        }
        Ok(moved)
    }

    async fn commit_resolution(
        &self,
        claim_id: Uuid,
        outcome: ResolutionOutcome,
        resolution: &str,
        reputation: &ReputationPolicy,
    ) -> Result<ResolutionCommit, StoreError> {
        let slot = self.slot(claim_id)?;
        let mut entry = slot.write();
        let previous = entry.claim.status;
        if previous != ClaimStatus::Disputed {
            return Err(StoreError::InvalidState {
                claim_id,
                status: previous,
            });
        }
        let now = Utc::now();
        let mut closed = Vec::new();
        for dispute in entry.disputes.iter_mut().filter(|d| d.status.is_live()) {
            dispute.status = outcome.dispute_status();
            dispute.resolution = Some(resolution.to_string());
            dispute.updated_at = now;
            closed.push(dispute.clone());
        }
        entry.claim.status = outcome.claim_status();
        entry.claim.updated_at = now;
        let changes = settlement(&entry.claim, outcome, &closed, &entry.attestations, reputation);
        self.credit(&changes, reputation);
        Ok(ResolutionCommit {
            claim: entry.claim.clone(),
            previous,
            disputes: closed,
            attestations: entry.attestations.clone(),
            reputation: changes,
        })
    }

    async fn set_chain_tx(&self, target: &MirrorTarget, tx_id: &str) -> Result<(), StoreError> {
        let slot = self.slot(target.claim_id())?;
        let mut entry = slot.write();
        let tx = Some(tx_id.to_string());
        match target {
            MirrorTarget::Claim { .. } => entry.claim.chain_tx = tx,
            MirrorTarget::Attestation { attestation_id, .. } => {
                if let Some(a) = entry
                    .attestations
                    .iter_mut()
                    .find(|a| a.id == *attestation_id)
                {
                    a.chain_tx = tx;
                }
            }
            MirrorTarget::Dispute { dispute_id, .. } => {
                if let Some(d) = entry.disputes.iter_mut().find(|d| d.id == *dispute_id) {
                    d.chain_tx = tx;
                }
            }
            // Reputation updates only live in the outbox.
            MirrorTarget::Reputation { .. } => {}
        }
        Ok(())
    }

    async fn reputation(&self, identity: &str) -> Result<Option<ReputationRecord>, StoreError> {
        Ok(self.reputation.lock().records.get(identity).cloned())
    }

    async fn apply_reputation(
        &self,
        change: &ReputationChange,
        policy: &ReputationPolicy,
    ) -> Result<(ReputationRecord, ReputationEvent), StoreError> {
        Ok(self.reputation.lock().apply(change, policy, Utc::now()))
    }

    async fn reputation_history(
        &self,
        identity: &str,
        limit: u32,
    ) -> Result<Vec<ReputationEvent>, StoreError> {
        let book = self.reputation.lock();
        Ok(book
            .history
            .get(identity)
            .map(|events| events.iter().rev().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn leaderboard(&self, limit: u32) -> Result<Vec<ReputationRecord>, StoreError> {
        let mut records: Vec<ReputationRecord> =
            self.reputation.lock().records.values().cloned().collect();
        records.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.identity.cmp(&b.identity)));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn enqueue_mirror(&self, record: &MirrorRecord) -> Result<(), StoreError> {
        self.outbox.lock().push(record.clone());
        Ok(())
    }

    async fn update_mirror(&self, record: &MirrorRecord) -> Result<(), StoreError> {
        let mut outbox = self.outbox.lock();
        let slot = outbox
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(StoreError::MirrorNotFound(record.id))?;
        *slot = record.clone();
        Ok(())
    }

    async fn claim_mirror(
        &self,
        record: &MirrorRecord,
        seen_attempts: u32,
    ) -> Result<bool, StoreError> {
        let mut outbox = self.outbox.lock();
        let slot = outbox
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(StoreError::MirrorNotFound(record.id))?;
        if slot.status != record.status || slot.attempts != seen_attempts {
            return Ok(false);
        }
        slot.attempts = record.attempts;
        slot.updated_at = record.updated_at;
        Ok(true)
    }

    async fn mirror_backlog(
        &self,
        max_attempts: u32,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<MirrorRecord>, StoreError> {
        Ok(self
            .outbox
            .lock()
            .iter()
            .filter(|r| r.status.needs_retry())
            .filter(|r| r.attempts < max_attempts && r.updated_at < stale_before)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mirror_records(&self, target: &MirrorTarget) -> Result<Vec<MirrorRecord>, StoreError> {
        Ok(self
            .outbox
            .lock()
            .iter()
            .filter(|r| r.target == *target)
            .cloned()
            .collect())
    }
}
