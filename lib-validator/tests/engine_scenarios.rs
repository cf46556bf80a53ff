//! End-to-end engine scenarios
//!
//! Drives the full pipeline (submission, dispatch, scripted machine
//! execution, progress tracking, artifact emission) with the in-process
//! collaborator doubles from `lib_validator::testing`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use lib_machine::blake3_hash;
use lib_validator::testing::{ChainBuilder, NullStreamer, ScriptedMachineFactory, StaticInbox};
use lib_validator::{BlockValidator, BlockValidatorConfig};

const WAIT: Duration = Duration::from_secs(10);

fn test_config(root: &Path) -> BlockValidatorConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    BlockValidatorConfig {
        root_path: root.to_path_buf(),
        concurrent_runs_limit: 2,
        step_chunk: 4,
        ..Default::default()
    }
}

/// Artifact directory for `block_number`, if any launch emitted one.
fn artifact_dir(config: &BlockValidatorConfig, block_number: u64) -> Option<PathBuf> {
    let output = config.output_dir();
    let launches = std::fs::read_dir(output).ok()?;
    for launch in launches.flatten() {
        let candidate = launch.path().join(format!("block_{}", block_number));
        if candidate.is_dir() {
            return Some(candidate);
        }
    }
    None
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_single_block() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let factory = ScriptedMachineFactory::new(8);
    let inbox = StaticInbox::empty();
    let validator =
        BlockValidator::new(&factory, inbox, &NullStreamer, config.clone()).unwrap();
    validator.start().unwrap();

    let mut chain = ChainBuilder::new();
    // One block spanning a two-message batch.
    let block = chain.next_block(vec![0xa1, 0xa2], None);
    block.submit_block(&validator);
    block.submit_positions(&validator);

    assert!(validator.wait_for_block(1, WAIT).await);
    assert_eq!(validator.blocks_validated(), 1);
    // A valid, unrecorded block emits nothing.
    assert!(artifact_dir(&config, 1).is_none());

    validator.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn out_of_order_arrival_dispatches_in_position_order() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let factory = ScriptedMachineFactory::new(8);
    let validator =
        BlockValidator::new(&factory, StaticInbox::empty(), &NullStreamer, config).unwrap();
    validator.start().unwrap();

    let mut chain = ChainBuilder::new();
    let block1 = chain.next_block(vec![1], None);
    let block2 = chain.next_block(vec![2], None);

    // Block 2 arrives first; the dispatcher must hold it until block 1
    // has been dispatched and completed.
    block2.submit_block(&validator);
    block2.submit_positions(&validator);
    assert!(!validator.wait_for_block(1, Duration::from_millis(100)).await);

    block1.submit_block(&validator);
    block1.submit_positions(&validator);

    assert!(validator.wait_for_block(2, WAIT).await);
    assert_eq!(validator.blocks_validated(), 2);

    validator.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delayed_message_is_fetched_and_recorded() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.blocks_to_record = vec![1];

    let delayed_bytes = vec![0xd0, 0xd1, 0xd2];
    let factory = ScriptedMachineFactory::new(8);
    let inbox = StaticInbox::new(HashMap::from([(0u64, delayed_bytes.clone())]));
    let validator =
        BlockValidator::new(&factory, inbox.clone(), &NullStreamer, config.clone()).unwrap();
    validator.start().unwrap();

    let mut chain = ChainBuilder::new();
    let block = chain.next_block(vec![0x11], Some(delayed_bytes.clone()));
    block.submit_block(&validator);
    block.submit_positions(&validator);

    assert!(validator.wait_for_block(1, WAIT).await);
    // The engine asked the inbox tracker for message 0 (the parent nonce).
    assert_eq!(inbox.reads(), vec![0]);

    let artifact = artifact_dir(&config, 1).expect("recorded block must emit an artifact");
    assert_eq!(
        std::fs::read(artifact.join("delayed_0.bin")).unwrap(),
        delayed_bytes
    );
    let script = std::fs::read_to_string(artifact.join("run-prover.sh")).unwrap();
    assert!(script.contains("--delayed-inbox-position 0"));
    assert!(script.contains("--delayed-inbox delayed_0.bin"));

    validator.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_requested_blocks_are_recorded() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.blocks_to_record = vec![2];

    let factory = ScriptedMachineFactory::new(8);
    let validator =
        BlockValidator::new(&factory, StaticInbox::empty(), &NullStreamer, config.clone())
            .unwrap();
    validator.start().unwrap();

    let mut chain = ChainBuilder::new();
    for i in 0..3u64 {
        let block = chain.next_block(vec![i as u8 + 1], None);
        block.submit_block(&validator);
        block.submit_positions(&validator);
    }

    assert!(validator.wait_for_block(3, WAIT).await);
    assert!(artifact_dir(&config, 1).is_none());
    assert!(artifact_dir(&config, 3).is_none());

    let artifact = artifact_dir(&config, 2).expect("block 2 was requested for recording");
    assert!(artifact.join("run-prover.sh").exists());
    assert!(artifact.join("preimages.bin").exists());
    let script = std::fs::read_to_string(artifact.join("run-prover.sh")).unwrap();
    assert!(script.contains("--inbox-position 1"));
    assert!(script.contains("--last-block-hash"));

    validator.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatch_stalls_and_writes_artifact_in_nonfatal_mode() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.fatal_on_mismatch = false;

    let factory = ScriptedMachineFactory::new(8);
    let validator =
        BlockValidator::new(&factory, StaticInbox::empty(), &NullStreamer, config.clone())
            .unwrap();
    validator.start().unwrap();

    let mut chain = ChainBuilder::new();
    let mut block = chain.next_block(vec![0x42], None);
    // Claim a block hash the machine cannot re-derive.
    block.header.block_hash = blake3_hash(b"fraudulent claim");
    block.submit_block(&validator);
    block.submit_positions(&validator);

    assert!(!validator.wait_for_block(1, Duration::from_millis(500)).await);
    assert_eq!(validator.blocks_validated(), 0);

    // The mismatch produced fraud evidence even though the process stayed up.
    let artifact = artifact_dir(&config, 1).expect("mismatch must emit an artifact");
    let script = std::fs::read_to_string(artifact.join("run-prover.sh")).unwrap();
    assert!(script.contains(&format!("hash {}", block.header.block_hash)));

    // The slot was released; the entry stays pending as the stall marker.
    let status = validator.status();
    assert_eq!(status.validations_running, 0);
    assert_eq!(status.entries_pending, 1);

    validator.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_is_monotone_and_gap_free_under_shuffled_arrival() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let factory = ScriptedMachineFactory::new(16);
    let validator =
        BlockValidator::new(&factory, StaticInbox::empty(), &NullStreamer, config).unwrap();
    validator.start().unwrap();

    let mut chain = ChainBuilder::new();
    let mut blocks = Vec::new();
    for i in 0..6u64 {
        blocks.push(chain.next_block(vec![i as u8 + 1], None));
    }

    // Shuffled arrival: entries in reverse, position records interleaved.
    for block in blocks.iter().rev() {
        block.submit_block(&validator);
    }
    for block in blocks.iter().skip(3) {
        block.submit_positions(&validator);
    }
    for block in blocks.iter().take(3) {
        block.submit_positions(&validator);
    }

    // Sample the public counter while the pipeline drains; it must never
    // decrease.
    let sampler = {
        let validator = Arc::clone(&validator);
        tokio::spawn(async move {
            let mut last = 0u64;
            for _ in 0..200 {
                let now = validator.blocks_validated();
                assert!(now >= last, "blocks_validated went backwards");
                last = now;
                if last >= 6 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            last
        })
    };

    assert!(validator.wait_for_block(6, WAIT).await);
    assert_eq!(validator.blocks_validated(), 6);
    sampler.await.unwrap();

    validator.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_cap_bounds_live_machines() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.concurrent_runs_limit = 2;
    config.step_chunk = 2;

    // 64 steps per block over chunks of 2 keeps several validations
    // overlapping long enough to observe the cap.
    let factory = ScriptedMachineFactory::new(64);
    let clones = Arc::clone(&factory.clones);
    let validator =
        BlockValidator::new(&factory, StaticInbox::empty(), &NullStreamer, config).unwrap();
    validator.start().unwrap();

    let mut chain = ChainBuilder::new();
    for i in 0..6u64 {
        let block = chain.next_block(vec![i as u8 + 1], None);
        block.submit_block(&validator);
        block.submit_positions(&validator);
    }

    assert!(validator.wait_for_block(6, WAIT).await);
    assert!(clones.peak() >= 1);
    assert!(
        clones.peak() <= 2,
        "more than concurrent_runs_limit machines were alive at once: {}",
        clones.peak()
    );

    validator.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resources_are_released_behind_progress() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let factory = ScriptedMachineFactory::new(8);
    let validator =
        BlockValidator::new(&factory, StaticInbox::empty(), &NullStreamer, config).unwrap();
    validator.start().unwrap();

    let mut chain = ChainBuilder::new();
    for i in 0..4u64 {
        let mut block = chain.next_block(vec![i as u8 + 1], None);
        let key = format!("preimage-{}", i);
        block
            .preimages
            .insert(blake3_hash(key.as_bytes()), key.into_bytes());
        block.submit_block(&validator);
        block.submit_positions(&validator);
    }

    assert!(validator.wait_for_block(4, WAIT).await);

    let status = validator.status();
    assert_eq!(status.entries_pending, 0, "all entries reclaimed");
    assert_eq!(status.preimages_cached, 0, "all preimage refs released");
    // Eviction trails by one batch: the last validated block's own batch
    // is only reclaimed once a later block moves past it.
    assert_eq!(status.batches_held, 1);
    assert_eq!(status.batches_validated, 3);
    assert_eq!(status.queue_depth, 0);

    validator.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_releases_resources_mid_execution() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.step_chunk = 1;

    // A step budget far beyond what can complete before the stop signal.
    let factory = ScriptedMachineFactory::new(u64::MAX);
    let clones = Arc::clone(&factory.clones);
    let validator =
        BlockValidator::new(&factory, StaticInbox::empty(), &NullStreamer, config).unwrap();
    validator.start().unwrap();

    let mut chain = ChainBuilder::new();
    let mut block = chain.next_block(vec![0x77], None);
    block
        .preimages
        .insert(blake3_hash(b"held"), b"held".to_vec());
    block.submit_block(&validator);
    block.submit_positions(&validator);

    // Let the validation get going, then cancel.
    assert!(!validator.wait_for_block(1, Duration::from_millis(100)).await);
    validator.stop();

    // The task observes the signal at the next chunk boundary and tears
    // down: slot freed, preimage refs dropped, machine gone.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = validator.status();
    assert_eq!(status.blocks_validated, 0);
    assert_eq!(status.validations_running, 0);
    assert_eq!(status.preimages_cached, 0);
    assert_eq!(clones.live(), 0);
}
