//! Reputation arithmetic: clamping, counters and the reward/penalty table.

use crate::types::{ReputationEvent, ReputationRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scores, bounds and reward/penalty sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationPolicy {
    /// Score of a first-seen identity.
    pub initial: i64,
    pub floor: i64,
    pub ceiling: i64,
    /// Identities below this score may not submit, attest or dispute.
    pub min_participation: i64,
    pub verification_reward: i64,
    pub dispute_won_reward: i64,
    pub upheld_submitter_penalty: i64,
    pub dismissed_dispute_penalty: i64,
    pub overturned_attestation_penalty: i64,
}

impl Default for ReputationPolicy {
    fn default() -> Self {
        Self {
            initial: 100,
            floor: 0,
            ceiling: 1000,
            min_participation: 50,
            verification_reward: 5,
            dispute_won_reward: 10,
            upheld_submitter_penalty: 20,
            dismissed_dispute_penalty: 10,
            overturned_attestation_penalty: 5,
        }
    }
}

impl ReputationPolicy {
    /// Apply `delta` to `score`, clamped into `[floor, ceiling]`.
    pub fn clamp(&self, score: i64, delta: i64) -> i64 {
        score.saturating_add(delta).clamp(self.floor, self.ceiling)
    }

    pub fn fresh_record(&self, identity: &str, at: DateTime<Utc>) -> ReputationRecord {
        ReputationRecord {
            identity: identity.to_string(),
            score: self.initial,
            verification_count: 0,
            successful_verifications: 0,
            disputes_raised: 0,
            disputes_won: 0,
            updated_at: at,
        }
    }
}

/// Counter increments that accompany a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterBump {
    pub verifications: u64,
    pub successful_verifications: u64,
    pub disputes_raised: u64,
    pub disputes_won: u64,
}

impl CounterBump {
    pub const NONE: CounterBump = CounterBump {
        verifications: 0,
        successful_verifications: 0,
        disputes_raised: 0,
        disputes_won: 0,
    };

    pub fn verification() -> Self {
        Self {
            verifications: 1,
            ..Self::NONE
        }
    }

    pub fn successful_verification() -> Self {
        Self {
            successful_verifications: 1,
            ..Self::NONE
        }
    }

    pub fn dispute_raised() -> Self {
        Self {
            disputes_raised: 1,
            ..Self::NONE
        }
    }

    pub fn dispute_won() -> Self {
        Self {
            disputes_won: 1,
            ..Self::NONE
        }
    }
}

/// A requested change to one identity's standing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationChange {
    pub identity: String,
    pub delta: i64,
    pub reason: String,
    #[serde(default)]
    pub counters: CounterBump,
}

impl ReputationChange {
    pub fn new(identity: impl Into<String>, delta: i64, reason: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            delta,
            reason: reason.into(),
            counters: CounterBump::NONE,
        }
    }

    pub fn with_counters(mut self, counters: CounterBump) -> Self {
        self.counters = counters;
        self
    }
}

impl ReputationRecord {
    /// Apply a change in place and return the audit entry for it.
    pub fn apply(
        &mut self,
        change: &ReputationChange,
        policy: &ReputationPolicy,
        at: DateTime<Utc>,
    ) -> ReputationEvent {
        self.score = policy.clamp(self.score, change.delta);
        self.verification_count = self
            .verification_count
            .saturating_add(change.counters.verifications);
        self.successful_verifications = self
            .successful_verifications
            .saturating_add(change.counters.successful_verifications);
        self.disputes_raised = self
            .disputes_raised
            .saturating_add(change.counters.disputes_raised);
        self.disputes_won = self
            .disputes_won
            .saturating_add(change.counters.disputes_won);
        self.updated_at = at;

        ReputationEvent {
            identity: self.identity.clone(),
            delta: change.delta,
            reason: change.reason.clone(),
            score_after: self.score,
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_clamp_floor_and_ceiling() {
        let policy = ReputationPolicy::default();
        assert_eq!(policy.clamp(10, -50), 0);
        assert_eq!(policy.clamp(990, 50), 1000);
        assert_eq!(policy.clamp(100, 5), 105);
        assert_eq!(policy.clamp(0, i64::MIN), 0);
        assert_eq!(policy.clamp(1000, i64::MAX), 1000);
    }

    #[test]
    fn test_apply_bumps_counters_and_logs_requested_delta() {
        let policy = ReputationPolicy::default();
        let now = Utc::now();
        let mut record = policy.fresh_record("alice", now);
        let change = ReputationChange::new("alice", -500, "dispute upheld")
            .with_counters(CounterBump::dispute_won());
        let event = record.apply(&change, &policy, now);
        assert_eq!(record.score, 0);
        assert_eq!(record.disputes_won, 1);
        assert_eq!(event.delta, -500);
        assert_eq!(event.score_after, 0);
    }

    proptest! {
        #[test]
        fn score_stays_within_bounds(deltas in prop::collection::vec(any::<i64>(), 0..64)) {
            let policy = ReputationPolicy::default();
            let now = Utc::now();
            let mut record = policy.fresh_record("bob", now);
            for delta in deltas {
                record.apply(&ReputationChange::new("bob", delta, "fuzz"), &policy, now);
                prop_assert!(record.score >= policy.floor);
                prop_assert!(record.score <= policy.ceiling);
            }
        }
    }
}
