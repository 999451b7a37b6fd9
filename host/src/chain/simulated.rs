//! In-process ledger used for tests and local development.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{ChainError, ChainOp, Confirmation, LedgerNode, SignedTransaction};

#[derive(Default)]
struct LedgerState {
    offline: bool,
    never_confirm: bool,
    /// Polls a transaction needs before it confirms.
    confirm_after: u32,
    round: u64,
    pending: HashMap<String, u32>,
    confirmed: HashMap<String, u64>,
    log: Vec<ChainOp>,
}

/// Append-only in-memory ledger with switchable failure modes.
#[derive(Default)]
pub struct SimulatedLedger {
    state: Mutex<LedgerState>,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions confirm after `polls` confirmation checks.
    pub fn with_confirm_after(polls: u32) -> Self {
        let ledger = Self::default();
        ledger.state.lock().confirm_after = polls;
        ledger
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn set_never_confirm(&self, never: bool) {
        self.state.lock().never_confirm = never;
    }

    /// Operations accepted so far, in submission order.
    pub fn operations(&self) -> Vec<ChainOp> {
        self.state.lock().log.clone()
    }

    pub fn is_confirmed(&self, tx_id: &str) -> bool {
        self.state.lock().confirmed.contains_key(tx_id)
    }
}

#[async_trait]
impl LedgerNode for SimulatedLedger {
    async fn submit(&self, tx: &SignedTransaction) -> Result<String, ChainError> {
        tx.verify()?;
        let op = tx.operation()?;
        let tx_id = tx.digest()?;
        let mut state = self.state.lock();
        if state.offline {
            return Err(ChainError::Unavailable("simulated ledger offline".into()));
        }
        if state.pending.contains_key(&tx_id) || state.confirmed.contains_key(&tx_id) {
            return Err(ChainError::Rejected(format!("duplicate transaction {tx_id}")));
        }
        state.log.push(op);
        state.pending.insert(tx_id.clone(), 0);
        Ok(tx_id)
    }

    async fn confirmation(&self, tx_id: &str) -> Result<Confirmation, ChainError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(ChainError::Unavailable("simulated ledger offline".into()));
        }
        if let Some(round) = state.confirmed.get(tx_id) {
            return Ok(Confirmation::Confirmed { round: *round });
        }
        let confirm_after = state.confirm_after;
        let never_confirm = state.never_confirm;
        let Some(polls) = state.pending.get_mut(tx_id) else {
            return Ok(Confirmation::Rejected {
                reason: format!("unknown transaction {tx_id}"),
            });
        };
        *polls += 1;
        if never_confirm || *polls <= confirm_after {
            return Ok(Confirmation::Pending);
        }
        state.pending.remove(tx_id);
        state.round += 1;
        let round = state.round;
        state.confirmed.insert(tx_id.to_string(), round);
        Ok(Confirmation::Confirmed { round })
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
