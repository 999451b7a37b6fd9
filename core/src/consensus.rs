//! Weighted quorum policy and the claim status state machine.
//!
//! Approve and dispute votes are tallied as role weights, not raw counts.
//! The defaults are calibrated so that three player-weight attestations
//! (3 x 10) verify a claim and two player-weight disputes (2 x 10) force it
//! into DISPUTED.

use crate::types::ClaimStatus;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ACCEPTANCE_THRESHOLD: u32 = 30;
pub const DEFAULT_DISPUTE_THRESHOLD: u32 = 20;

/// Thresholds applied to the cumulative tallies of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    /// Default approve weight a new claim must gather to become VERIFIED.
    pub acceptance_threshold: u32,
    /// Dispute weight that forces a claim into DISPUTED.
    pub dispute_threshold: u32,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            acceptance_threshold: DEFAULT_ACCEPTANCE_THRESHOLD,
            dispute_threshold: DEFAULT_DISPUTE_THRESHOLD,
        }
    }
}

/// Cumulative approve and dispute weight of one claim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approve: u32,
    pub dispute: u32,
}

impl Tally {
    /// Sum vote weights; saturates instead of wrapping.
    pub fn from_weights(
        approvals: impl IntoIterator<Item = u32>,
        disputes: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            approve: approvals.into_iter().fold(0u32, u32::saturating_add),
            dispute: disputes.into_iter().fold(0u32, u32::saturating_add),
        }
    }
}

/// Decide whether a claim moves after its tally changed.
///
/// Rules:
/// - terminal claims never move here (resolution is external)
/// - dispute weight at or above the threshold forces DISPUTED from PENDING
///   or VERIFIED, regardless of approve weight
/// - approve weight at or above `required_weight` moves PENDING to VERIFIED
/// - DISPUTED stays DISPUTED no matter how many approvals arrive
///
/// Returns `None` when the status is unchanged.
pub fn next_status(
    current: ClaimStatus,
    required_weight: u32,
    policy: &ThresholdPolicy,
    tally: Tally,
) -> Option<ClaimStatus> {
    let next = match current {
        ClaimStatus::Pending | ClaimStatus::Verified
            if tally.dispute >= policy.dispute_threshold =>
        {
            ClaimStatus::Disputed
        }
        ClaimStatus::Pending if tally.approve >= required_weight => ClaimStatus::Verified,
        _ => return None,
    };
    Some(next)
}

/// Every edge the status machine allows, automatic or by resolution.
pub fn can_transition(from: ClaimStatus, to: ClaimStatus) -> bool {
    use ClaimStatus::*;
    matches!(
        (from, to),
        (Pending, Verified)
            | (Pending, Disputed)
            | (Verified, Disputed)
            | (Disputed, Resolved)
            | (Disputed, Rejected)
    )
}
