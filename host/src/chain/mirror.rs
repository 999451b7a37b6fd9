//! Write-behind mirror: outbox record, sign, submit, bounded confirmation wait.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ChainOp, Confirmation, LedgerNode, MirrorError, MirrorRecord, MirrorStatus, MirrorTarget,
    TxSigner,
};
use crate::config::MirrorConfig;
use crate::locks::KeyedLocks;
use crate::store::Store;

/// Outcome counts of one retry pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MirrorReport {
    pub scanned: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Records another worker was already driving.
    pub skipped: usize,
}

pub struct ChainMirror {
    node: Arc<dyn LedgerNode>,
    signer: TxSigner,
    store: Arc<dyn Store>,
    /// One in-flight transaction per signing account.
    accounts: KeyedLocks<String>,
    /// Records a live call in this process is driving.
    owned: Mutex<HashSet<Uuid>>,
    nonce: AtomicU64,
    config: MirrorConfig,
}

/// Releases a record id from `ChainMirror::owned` when dropped.
struct Owned<'a> {
    owned: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for Owned<'_> {
    fn drop(&mut self) {
        self.owned.lock().remove(&self.id);
    }
}

impl ChainMirror {
    pub fn new(
        node: Arc<dyn LedgerNode>,
        signer: TxSigner,
        store: Arc<dyn Store>,
        config: MirrorConfig,
    ) -> Self {
        // Millisecond seed keeps nonces increasing across restarts.
        let seed = Utc::now().timestamp_millis().max(0) as u64;
        Self {
            node,
            signer,
            store,
            accounts: KeyedLocks::new(),
            owned: Mutex::new(HashSet::new()),
            nonce: AtomicU64::new(seed),
            config,
        }
    }

    pub fn node_name(&self) -> &'static str {
        self.node.name()
    }

    pub fn signer_address(&self) -> String {
        self.signer.address()
    }

    /// Record, submit and confirm one operation. The outbox row survives any
    /// failure so the retry loop can pick it up.
    pub async fn mirror(&self, target: MirrorTarget, op: ChainOp) -> Result<String, MirrorError> {
        let mut record = MirrorRecord::new(target, op);
        let _owned = self.own(record.id).ok_or(MirrorError::Superseded(record.id))?;
        self.store.enqueue_mirror(&record).await?;
        self.drive(&mut record).await
    }

    /// Re-drive a stored record. Submitted and timed-out records keep their
    /// transaction and are only polled again; the rest are signed and
    /// submitted afresh.
    pub async fn redrive(&self, mut record: MirrorRecord) -> Result<String, MirrorError> {
        let _owned = self.own(record.id).ok_or(MirrorError::Superseded(record.id))?;
        self.drive(&mut record).await
    }

    /// One pass over the outbox backlog.
    pub async fn retry_backlog(&self) -> Result<MirrorReport, MirrorError> {
        let window = self
            .config
            .poll_interval
            .saturating_mul(self.config.confirmation_rounds);
        let stale_before =
            Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let backlog = self
            .store
            .mirror_backlog(self.config.max_attempts, stale_before, self.config.retry_batch)
            .await?;

        let mut report = MirrorReport {
            scanned: backlog.len(),
            ..MirrorReport::default()
        };
        for record in backlog {
            let id = record.id;
            match self.redrive(record).await {
                Ok(_) => report.confirmed += 1,
                Err(MirrorError::Timeout { .. }) => report.timed_out += 1,
                Err(MirrorError::Superseded(_)) => report.skipped += 1,
                Err(err) => {
                    debug!(record_id = %id, error = %err, "Mirror retry failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn own(&self, id: Uuid) -> Option<Owned<'_>> {
        self.owned.lock().insert(id).then(|| Owned {
            owned: &self.owned,
            id,
        })
    }

    async fn drive(&self, record: &mut MirrorRecord) -> Result<String, MirrorError> {
        let _in_flight = self.accounts.lock(&self.signer.address()).await;
        // The copy we hold may be stale by now; only the worker whose claim
        // matches the stored row goes on to touch the ledger.
        let seen = record.attempts;
        record.attempts = seen.saturating_add(1);
        record.updated_at = Utc::now();
        if !self.store.claim_mirror(record, seen).await? {
            debug!(record_id = %record.id, "Mirror record already taken");
            return Err(MirrorError::Superseded(record.id));
        }
        let resume = if record.status.resumes() {
            record.tx_id.clone()
        } else {
            None
        };
        let tx_id = match resume {
            Some(tx_id) => tx_id,
            None => self.submit(record).await?,
        };
        self.await_confirmation(record, tx_id).await
    }

    async fn submit(&self, record: &mut MirrorRecord) -> Result<String, MirrorError> {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let submitted = match self.signer.sign(&record.operation, nonce) {
            Ok(tx) => self.node.submit(&tx).await,
            Err(err) => Err(err),
        };
        match submitted {
            Ok(tx_id) => {
                record.status = MirrorStatus::Submitted;
                record.tx_id = Some(tx_id.clone());
                record.last_error = None;
                record.updated_at = Utc::now();
                self.store.update_mirror(record).await?;
                debug!(
                    record_id = %record.id,
                    op = record.operation.name(),
                    tx_id = %tx_id,
                    node = self.node.name(),
                    "Chain transaction submitted"
                );
                Ok(tx_id)
            }
            Err(err) => {
                warn!(
                    record_id = %record.id,
                    op = record.operation.name(),
                    attempts = record.attempts,
                    error = %err,
                    "Chain submission failed"
                );
                self.fail(record, err.to_string()).await?;
                Err(err.into())
            }
        }
    }

    async fn await_confirmation(
        &self,
        record: &mut MirrorRecord,
        tx_id: String,
    ) -> Result<String, MirrorError> {
        let rounds = self.config.confirmation_rounds.max(1);
        for round in 0..rounds {
            if round > 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
            match self.node.confirmation(&tx_id).await {
                Ok(Confirmation::Confirmed { round: ledger_round }) => {
                    record.status = MirrorStatus::Confirmed;
                    record.last_error = None;
                    record.updated_at = Utc::now();
                    self.store.update_mirror(record).await?;
                    self.store.set_chain_tx(&record.target, &tx_id).await?;
                    info!(
                        claim_id = %record.target.claim_id(),
                        op = record.operation.name(),
                        tx_id = %tx_id,
                        ledger_round,
                        "Chain transaction confirmed"
                    );
                    return Ok(tx_id);
                }
                Ok(Confirmation::Rejected { reason }) => {
                    warn!(record_id = %record.id, tx_id = %tx_id, reason = %reason, "Chain transaction rejected");
                    self.fail(record, reason.clone()).await?;
                    return Err(MirrorError::Rejected(reason));
                }
                Ok(Confirmation::Pending) => {}
                Err(err) => {
                    debug!(tx_id = %tx_id, round, error = %err, "Confirmation poll failed");
                }
            }
        }

        record.status = MirrorStatus::TimedOut;
        record.last_error = Some(format!("unconfirmed after {rounds} rounds"));
        record.updated_at = Utc::now();
        self.store.update_mirror(record).await?;
        warn!(
            claim_id = %record.target.claim_id(),
            tx_id = %tx_id,
            rounds,
            "Chain confirmation timed out"
        );
        Err(MirrorError::Timeout { tx_id, rounds })
    }

    async fn fail(&self, record: &mut MirrorRecord, reason: String) -> Result<(), MirrorError> {
        record.status = MirrorStatus::Failed;
        record.tx_id = None;
        record.last_error = Some(reason);
        record.updated_at = Utc::now();
        self.store.update_mirror(record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{KeySource, SimulatedLedger};
    use crate::store::MemoryStore;
    use matchproof_core::{ClaimStatus, MatchClaim};
    use std::time::Duration;

    fn config() -> MirrorConfig {
        MirrorConfig {
            poll_interval: Duration::ZERO,
            ..MirrorConfig::default()
        }
    }

    fn signer() -> TxSigner {
        TxSigner::load(&KeySource::Seed("mirror-test".into())).unwrap()
    }

    async fn setup(ledger: Arc<SimulatedLedger>) -> (Arc<ChainMirror>, Arc<MemoryStore>, MatchClaim) {
        setup_with(ledger, config()).await
    }

    async fn setup_with(
        ledger: Arc<SimulatedLedger>,
        config: MirrorConfig,
    ) -> (Arc<ChainMirror>, Arc<MemoryStore>, MatchClaim) {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let claim = MatchClaim {
            id: Uuid::new_v4(),
            external_ref: "ref-1".into(),
            home_team: "Red Lions".into(),
            away_team: "Blue Sharks".into(),
            home_score: 3,
            away_score: 3,
            submitter: "alice".into(),
            submitter_reputation: 100,
            status: ClaimStatus::Pending,
            required_weight: 30,
            approve_weight: 0,
            dispute_weight: 0,
            metadata: None,
            chain_tx: None,
            played_at: now,
            verified_at: None,
            created_at: now,
            updated_at: now,
        };
        store.insert_claim(&claim).await.unwrap();
        let mirror = Arc::new(ChainMirror::new(ledger, signer(), store.clone(), config));
        (mirror, store, claim)
    }

    fn anchor(claim: &MatchClaim) -> ChainOp {
        ChainOp::SubmitMatch {
            external_ref: claim.external_ref.clone(),
            home_team: claim.home_team.clone(),
            away_team: claim.away_team.clone(),
            home_score: claim.home_score,
            away_score: claim.away_score,
            submitter: claim.submitter.clone(),
            metadata: String::new(),
        }
    }

    #[tokio::test]
    async fn test_confirmed_anchor_writes_back_tx() {
        let ledger = Arc::new(SimulatedLedger::with_confirm_after(1));
        let (mirror, store, claim) = setup(ledger.clone()).await;
        let target = MirrorTarget::Claim { claim_id: claim.id };

        let tx_id = mirror.mirror(target.clone(), anchor(&claim)).await.unwrap();
        assert!(ledger.is_confirmed(&tx_id));
        assert_eq!(store.claim(claim.id).await.unwrap().chain_tx, Some(tx_id));
        let records = store.mirror_records(&target).await.unwrap();
        assert_eq!(records[0].status, MirrorStatus::Confirmed);
        assert_eq!(records[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_offline_node_leaves_failed_record_then_retry_confirms() {
        let ledger = Arc::new(SimulatedLedger::new());
        let (mirror, store, claim) = setup(ledger.clone()).await;
        let target = MirrorTarget::Claim { claim_id: claim.id };

        ledger.set_offline(true);
        let err = mirror.mirror(target.clone(), anchor(&claim)).await.unwrap_err();
        assert!(matches!(err, MirrorError::Unavailable(_)));
        assert_eq!(store.claim(claim.id).await.unwrap().chain_tx, None);
        let records = store.mirror_records(&target).await.unwrap();
        assert_eq!(records[0].status, MirrorStatus::Failed);
        assert!(records[0].last_error.is_some());

        ledger.set_offline(false);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let report = mirror.retry_backlog().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert!(store.claim(claim.id).await.unwrap().chain_tx.is_some());
        assert_eq!(ledger.operations().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_repolled_without_resubmission() {
        let ledger = Arc::new(SimulatedLedger::new());
        let (mirror, store, claim) = setup(ledger.clone()).await;
        let target = MirrorTarget::Claim { claim_id: claim.id };

        ledger.set_never_confirm(true);
        let err = mirror.mirror(target.clone(), anchor(&claim)).await.unwrap_err();
        let MirrorError::Timeout { tx_id, rounds } = err else {
            panic!("expected a confirmation timeout");
        };
        assert_eq!(rounds, 4);
        assert_eq!(store.claim(claim.id).await.unwrap().chain_tx, None);

        ledger.set_never_confirm(false);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let report = mirror.retry_backlog().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(ledger.operations().len(), 1);
        assert_eq!(store.claim(claim.id).await.unwrap().chain_tx, Some(tx_id));
    }

    #[tokio::test]
    async fn test_exhausted_records_are_left_alone() {
        let ledger = Arc::new(SimulatedLedger::new());
        let (mirror, store, claim) = setup(ledger.clone()).await;
        let target = MirrorTarget::Claim { claim_id: claim.id };
        ledger.set_offline(true);
        let _ = mirror.mirror(target.clone(), anchor(&claim)).await;

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            mirror.retry_backlog().await.unwrap();
        }
        let records = store.mirror_records(&target).await.unwrap();
        assert_eq!(records[0].attempts, MirrorConfig::default().max_attempts);
        assert_eq!(records[0].status, MirrorStatus::Failed);
    }

    #[tokio::test]
    async fn test_backlog_never_resubmits_records_owned_by_live_calls() {
        let ledger = Arc::new(SimulatedLedger::new());
        ledger.set_never_confirm(true);
        let config = MirrorConfig {
            poll_interval: Duration::from_millis(10),
            confirmation_rounds: 4,
            ..MirrorConfig::default()
        };
        let (mirror, _store, claim) = setup_with(ledger.clone(), config).await;

        let mut calls = Vec::new();
        for i in 0..5 {
            let mirror = mirror.clone();
            let target = MirrorTarget::Reputation {
                claim_id: claim.id,
                identity: format!("player-{i}"),
            };
            let op = ChainOp::UpdateReputation {
                identity: format!("player-{i}"),
                delta: 5,
                reason: "verification accepted".into(),
            };
            calls.push(tokio::spawn(async move { mirror.mirror(target, op).await }));
        }
        // Later calls are still queued on the account lock, long past the
        // staleness window.
        tokio::time::sleep(Duration::from_millis(70)).await;
        let report = mirror.retry_backlog().await.unwrap();
        assert!(report.skipped >= 1);
        assert_eq!(report.confirmed, 0);

        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(MirrorError::Timeout { .. })));
        }
        assert_eq!(ledger.operations().len(), 5);

        ledger.set_never_confirm(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = mirror.retry_backlog().await.unwrap();
        assert_eq!(report.confirmed, 5);
        assert_eq!(ledger.operations().len(), 5);
    }

    #[tokio::test]
    async fn test_stale_copy_is_driven_by_one_worker_only() {
        let ledger = Arc::new(SimulatedLedger::new());
        let (mirror, store, claim) = setup(ledger.clone()).await;
        let target = MirrorTarget::Claim { claim_id: claim.id };
        ledger.set_offline(true);
        let _ = mirror.mirror(target.clone(), anchor(&claim)).await;
        ledger.set_offline(false);

        // A second process: same outbox and key, its own locks.
        let other = Arc::new(ChainMirror::new(ledger.clone(), signer(), store.clone(), config()));
        let stale = store.mirror_records(&target).await.unwrap().remove(0);
        let (first, second) = tokio::join!(
            mirror.redrive(stale.clone()),
            other.redrive(stale)
        );
        let superseded = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(MirrorError::Superseded(_))))
            .count();
        assert_eq!(superseded, 1);
        assert!(first.is_ok() || second.is_ok());
        assert_eq!(ledger.operations().len(), 1);
        assert_eq!(store.mirror_records(&target).await.unwrap()[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_stale_submitted_record_is_polled_not_resubmitted() {
        let ledger = Arc::new(SimulatedLedger::new());
        let (mirror, store, claim) = setup(ledger.clone()).await;
        let target = MirrorTarget::Claim { claim_id: claim.id };

        // The driver died between submission and confirmation.
        let op = anchor(&claim);
        let tx = signer().sign(&op, 7).unwrap();
        let tx_id = ledger.submit(&tx).await.unwrap();
        let mut record = MirrorRecord::new(target.clone(), op);
        record.status = MirrorStatus::Submitted;
        record.attempts = 1;
        record.tx_id = Some(tx_id.clone());
        record.updated_at = Utc::now() - chrono::Duration::minutes(1);
        store.enqueue_mirror(&record).await.unwrap();

        let report = mirror.retry_backlog().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.confirmed, 1);
        assert_eq!(ledger.operations().len(), 1);
        assert!(ledger.is_confirmed(&tx_id));
        assert_eq!(store.claim(claim.id).await.unwrap().chain_tx, Some(tx_id));
        let records = store.mirror_records(&target).await.unwrap();
        assert_eq!(records[0].status, MirrorStatus::Confirmed);
        assert_eq!(records[0].attempts, 2);
    }
}
