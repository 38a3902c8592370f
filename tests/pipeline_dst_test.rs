//! Pipeline DST Tests
//!
//! Deterministic simulation tests (seed-based) for the replication
//! pipeline. Each run appends workload rounds to an in-memory change log,
//! crashes and restarts the pipeline between rounds, and checks every
//! destination against a shadow model.
//!
//! ## Invariants checked
//!
//! 1. **Checkpoint safety**: nothing at or below a persisted checkpoint is
//!    missing from a destination
//! 2. **Monotonic checkpoints**: the persisted position never regresses
//! 3. **Exactly-once effect**: no destination holds an event twice or out
//!    of order, and the final state equals the shadow model
//!
//! ## Test Categories
//!
//! - **Calm tests**: No faults, verify basic correctness
//! - **Moderate tests**: Store, target and source faults with crashes
//! - **Chaos tests**: Many faults, stress test

use cdc_pipeline::dst::{run_dst_batch, summarize_batch, PipelineDstConfig, PipelineDstHarness};

// =============================================================================
// Single Seed Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_dst_single_calm() {
    let config = PipelineDstConfig::calm(12345);
    let rounds = config.rounds;
    let events_per_round = config.events_per_round;
    let result = PipelineDstHarness::new(config).run().await;
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Calm mode should not violate invariants: {:?}",
        result.invariant_violations
    );
    assert_eq!(result.crashes, 0);
    assert!(result.events >= (rounds * events_per_round) as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_dst_single_moderate() {
    let result = PipelineDstHarness::new(PipelineDstConfig::moderate(54321))
        .run()
        .await;
    println!("{}", result.summary());
    println!("Store stats: {:?}", result.store_stats);

    // Faults slow the run down; the fault-free final round drains the log
    assert!(result.events > 0);
    assert!(result.final_position.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn test_pipeline_dst_single_chaos() {
    let result = PipelineDstHarness::new(PipelineDstConfig::chaos(99999))
        .run()
        .await;
    println!("{}", result.summary());
    println!("Store stats: {:?}", result.store_stats);

    assert!(result.events > 0);
}

// =============================================================================
// Multi-Seed Batch Tests (DST)
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_dst_10_seeds_calm() {
    let results = run_dst_batch(0, 10, PipelineDstConfig::calm).await;

    let summary = summarize_batch(&results);
    println!("10 Seeds Calm:\n{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(
        passed,
        results.len(),
        "All calm runs should pass. Failed seeds: {:?}",
        results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.seed)
            .collect::<Vec<_>>()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_dst_10_seeds_moderate() {
    let results = run_dst_batch(1000, 10, PipelineDstConfig::moderate).await;

    let summary = summarize_batch(&results);
    println!("10 Seeds Moderate:\n{}", summary);

    let crashes: u64 = results.iter().map(|r| r.crashes).sum();
    assert!(crashes > 0, "Moderate batch should exercise crash recovery");

    // Most moderate runs should pass
    let passed = results.iter().filter(|r| r.is_success()).count();
    assert!(
        passed >= 8,
        "At least 80% of moderate runs should pass. Passed: {}/{}",
        passed,
        results.len()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_pipeline_dst_100_seeds_chaos() {
    let results = run_dst_batch(2000, 100, PipelineDstConfig::chaos).await;

    let summary = summarize_batch(&results);
    println!("100 Seeds Chaos:\n{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, results.len(), "{}", summary);
}
