//! Criterion benchmarks for vote tallying.
//!
//! Run with:
//!
//!   cargo bench --bench tally
//!
//! - threshold_evaluation: pure status decision over a summed tally
//! - concurrent_attestations: N verifiers attesting one claim at once,
//!   through the engine, in-memory store and simulated ledger

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

use matchproof_core::{next_status, ClaimStatus, Tally, ThresholdPolicy, VerifierRole};
use matchproof_host::chain::{ChainMirror, KeySource, SimulatedLedger, TxSigner};
use matchproof_host::engine::{AttestRequest, SubmitClaim};
use matchproof_host::events::BroadcastSink;
use matchproof_host::roles::Roster;
use matchproof_host::{Engine, EngineConfig, MemoryStore, MirrorConfig};

fn engine() -> Arc<Engine> {
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        mirror: MirrorConfig {
            poll_interval: Duration::ZERO,
            ..MirrorConfig::default()
        },
        ..EngineConfig::default()
    };
    let signer = TxSigner::load(&KeySource::Seed("bench".into())).unwrap();
    let mirror = Arc::new(ChainMirror::new(
        Arc::new(SimulatedLedger::new()),
        signer,
        store.clone(),
        config.mirror.clone(),
    ));
    Arc::new(Engine::new(
        store,
        mirror,
        Arc::new(Roster::new()),
        Arc::new(BroadcastSink::new(16)),
        config,
    ))
}

fn claim_request(n: usize) -> SubmitClaim {
    SubmitClaim {
        home_team: format!("Home {n}"),
        away_team: format!("Away {n}"),
        home_score: 1,
        away_score: 0,
        metadata: None,
        external_ref: None,
        played_at: None,
    }
}

fn threshold_evaluation(c: &mut Criterion) {
    let policy = ThresholdPolicy::default();
    let weights: Vec<u32> = VerifierRole::ALL
        .iter()
        .cycle()
        .take(64)
        .map(|role| role.weight())
        .collect();

    c.bench_function("threshold_evaluation", |b| {
        b.iter(|| {
            let tally = Tally::from_weights(weights.iter().copied(), [10, 10]);
            next_status(
                black_box(ClaimStatus::Pending),
                policy.acceptance_threshold,
                &policy,
                black_box(tally),
            )
        })
    });
}

fn concurrent_attestations(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("concurrent_attestations");
    group.sample_size(20);

    for verifiers in [3usize, 16, 64] {
        let engine = engine();
        let mut round = 0usize;
        group.bench_with_input(
            BenchmarkId::from_parameter(verifiers),
            &verifiers,
            |b, &verifiers| {
                b.to_async(&runtime).iter(|| {
                    round += 1;
                    let engine = engine.clone();
                    let request = claim_request(round);
                    async move {
                        let claim = engine.submit("bench-submitter", request).await.unwrap();
                        let mut handles = Vec::with_capacity(verifiers);
                        for i in 0..verifiers {
                            let engine = engine.clone();
                            handles.push(tokio::spawn(async move {
                                engine
                                    .attest(
                                        claim.id,
                                        &format!("verifier-{i}"),
                                        AttestRequest {
                                            role: VerifierRole::Player,
                                        },
                                    )
                                    .await
                                    .unwrap()
                            }));
                        }
                        for handle in handles {
                            handle.await.unwrap();
                        }
                    }
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, threshold_evaluation, concurrent_attestations);
criterion_main!(benches);
