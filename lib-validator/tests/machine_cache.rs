//! Base-machine snapshot cache behavior across engine starts

use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;

use lib_validator::testing::{NullStreamer, ScriptedMachineFactory, StaticInbox};
use lib_validator::{BlockValidator, BlockValidatorConfig};

fn test_config(root: &Path) -> BlockValidatorConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    BlockValidatorConfig {
        root_path: root.to_path_buf(),
        concurrent_runs_limit: 1,
        ..Default::default()
    }
}

/// The single `<hash>.bin` file in the cache directory.
fn cache_file(config: &BlockValidatorConfig) -> std::path::PathBuf {
    let mut bins: Vec<_> = std::fs::read_dir(config.cache_dir())
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "bin").unwrap_or(false))
        .collect();
    assert_eq!(bins.len(), 1, "expected exactly one snapshot, got {:?}", bins);
    bins.pop().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_start_writes_snapshot_warm_start_reuses_it() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    // Cold start: fast-forward runs once and the snapshot is persisted.
    let factory1 = ScriptedMachineFactory::new(1);
    let validator1 =
        BlockValidator::new(&factory1, StaticInbox::empty(), &NullStreamer, config.clone())
            .unwrap();
    validator1.start().unwrap();
    assert_eq!(factory1.host_io_invocations.load(Ordering::SeqCst), 1);

    let snapshot = cache_file(&config);
    let first_bytes = std::fs::read(&snapshot).unwrap();
    validator1.stop();

    // Warm start with a fresh engine: cache hit, no fast-forward, and the
    // snapshot bytes are untouched.
    let factory2 = ScriptedMachineFactory::new(1);
    let validator2 =
        BlockValidator::new(&factory2, StaticInbox::empty(), &NullStreamer, config.clone())
            .unwrap();
    validator2.start().unwrap();
    assert_eq!(factory2.host_io_invocations.load(Ordering::SeqCst), 0);

    assert_eq!(cache_file(&config), snapshot, "same content-addressed name");
    assert_eq!(std::fs::read(&snapshot).unwrap(), first_bytes);
    validator2.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_snapshot_is_recomputed() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let factory1 = ScriptedMachineFactory::new(1);
    let validator1 =
        BlockValidator::new(&factory1, StaticInbox::empty(), &NullStreamer, config.clone())
            .unwrap();
    validator1.start().unwrap();
    let snapshot = cache_file(&config);
    let good_bytes = std::fs::read(&snapshot).unwrap();
    validator1.stop();

    // Corruption is a cache miss, not a startup failure.
    std::fs::write(&snapshot, b"garbage").unwrap();

    let factory2 = ScriptedMachineFactory::new(1);
    let validator2 =
        BlockValidator::new(&factory2, StaticInbox::empty(), &NullStreamer, config.clone())
            .unwrap();
    validator2.start().unwrap();
    assert_eq!(factory2.host_io_invocations.load(Ordering::SeqCst), 1);

    // The snapshot was rewritten deterministically.
    assert_eq!(std::fs::read(&snapshot).unwrap(), good_bytes);
    validator2.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leftover_wip_file_is_never_the_canonical_name() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    // Simulate a crash between serialize and rename from a previous run.
    std::fs::create_dir_all(config.cache_dir()).unwrap();
    std::fs::write(config.cache_dir().join("0123abcd.bin.wip"), b"partial").unwrap();

    let factory = ScriptedMachineFactory::new(1);
    let validator =
        BlockValidator::new(&factory, StaticInbox::empty(), &NullStreamer, config.clone())
            .unwrap();
    validator.start().unwrap();

    // Startup recomputed and atomically published exactly one snapshot;
    // the stale .wip never shadows a canonical name.
    let snapshot = cache_file(&config);
    assert!(!snapshot.to_string_lossy().ends_with(".wip"));
    assert_eq!(factory.host_io_invocations.load(Ordering::SeqCst), 1);

    // Engine still validates normally after the unusual startup.
    let mut chain = lib_validator::testing::ChainBuilder::new();
    let block = chain.next_block(vec![7], None);
    block.submit_block(&validator);
    block.submit_positions(&validator);
    assert!(validator.wait_for_block(1, Duration::from_secs(10)).await);

    validator.stop();
}
