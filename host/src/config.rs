//! Engine settings and their CLI/environment bindings.

use clap::Args;
use matchproof_core::{ReputationPolicy, ThresholdPolicy};
use std::time::Duration;

/// Chain mirror timing and retry limits.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Confirmation polls before a submission is reported as timed out.
    pub confirmation_rounds: u32,
    pub poll_interval: Duration,
    /// Pause between passes of the out-of-band retry loop.
    pub retry_interval: Duration,
    /// Records that failed this many times are left for manual inspection.
    pub max_attempts: u32,
    /// Records re-driven per retry pass.
    pub retry_batch: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            confirmation_rounds: 4,
            poll_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(30),
            max_attempts: 8,
            retry_batch: 16,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub thresholds: ThresholdPolicy,
    pub reputation: ReputationPolicy,
    pub mirror: MirrorConfig,
    /// Governance identities allowed to investigate and resolve disputes.
    pub resolvers: Vec<String>,
}

impl EngineConfig {
    pub fn is_resolver(&self, identity: &str) -> bool {
        self.resolvers.iter().any(|r| r == identity)
    }
}

/// Policy knobs exposed on the command line.
#[derive(Debug, Clone, Args)]
pub struct PolicyArgs {
    /// Approve weight a claim needs to become VERIFIED
    #[arg(long, env = "MATCHPROOF_ACCEPTANCE_THRESHOLD", default_value_t = 30)]
    pub acceptance_threshold: u32,
    /// Dispute weight that forces a claim into DISPUTED
    #[arg(long, env = "MATCHPROOF_DISPUTE_THRESHOLD", default_value_t = 20)]
    pub dispute_threshold: u32,
    /// Minimum reputation to submit, attest or dispute
    #[arg(long, env = "MATCHPROOF_MIN_REPUTATION", default_value_t = 50)]
    pub min_reputation: i64,
    #[arg(long, env = "MATCHPROOF_INITIAL_REPUTATION", default_value_t = 100)]
    pub initial_reputation: i64,
    /// Lowest score a penalty can push an identity to
    #[arg(long, env = "MATCHPROOF_REPUTATION_FLOOR", default_value_t = 0)]
    pub reputation_floor: i64,
    #[arg(long, env = "MATCHPROOF_REPUTATION_CEILING", default_value_t = 1000)]
    pub reputation_ceiling: i64,
    #[arg(long, env = "MATCHPROOF_VERIFICATION_REWARD", default_value_t = 5)]
    pub verification_reward: i64,
    #[arg(long, env = "MATCHPROOF_DISPUTE_WON_REWARD", default_value_t = 10)]
    pub dispute_won_reward: i64,
    #[arg(long, env = "MATCHPROOF_SUBMITTER_PENALTY", default_value_t = 20)]
    pub submitter_penalty: i64,
    #[arg(long, env = "MATCHPROOF_DISMISSED_DISPUTE_PENALTY", default_value_t = 10)]
    pub dismissed_dispute_penalty: i64,
    #[arg(long, env = "MATCHPROOF_ATTESTATION_PENALTY", default_value_t = 5)]
    pub attestation_penalty: i64,
    /// Confirmation polls per chain submission
    #[arg(long, env = "MATCHPROOF_CONFIRMATION_ROUNDS", default_value_t = 4)]
    pub confirmation_rounds: u32,
    #[arg(long, env = "MATCHPROOF_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,
    #[arg(long, env = "MATCHPROOF_RETRY_INTERVAL_SECS", default_value_t = 30)]
    pub retry_interval_secs: u64,
    #[arg(long, env = "MATCHPROOF_MAX_MIRROR_ATTEMPTS", default_value_t = 8)]
    pub max_mirror_attempts: u32,
    /// Identities allowed to resolve disputes (comma separated)
    #[arg(long, env = "MATCHPROOF_RESOLVERS", value_delimiter = ',')]
    pub resolvers: Vec<String>,
}

impl From<PolicyArgs> for EngineConfig {
    fn from(args: PolicyArgs) -> Self {
        let reputation = ReputationPolicy {
            initial: args.initial_reputation,
            floor: args.reputation_floor,
            ceiling: args.reputation_ceiling,
            min_participation: args.min_reputation,
            verification_reward: args.verification_reward,
            dispute_won_reward: args.dispute_won_reward,
            upheld_submitter_penalty: args.submitter_penalty,
            dismissed_dispute_penalty: args.dismissed_dispute_penalty,
            overturned_attestation_penalty: args.attestation_penalty,
        };
        Self {
            thresholds: ThresholdPolicy {
                acceptance_threshold: args.acceptance_threshold,
                dispute_threshold: args.dispute_threshold,
            },
            reputation,
            mirror: MirrorConfig {
                confirmation_rounds: args.confirmation_rounds,
                poll_interval: Duration::from_millis(args.poll_interval_ms),
                retry_interval: Duration::from_secs(args.retry_interval_secs),
                max_attempts: args.max_mirror_attempts,
                ..MirrorConfig::default()
            },
            resolvers: args
                .resolvers
                .into_iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }
}
