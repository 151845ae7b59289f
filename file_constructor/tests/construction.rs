//! End-to-end construction tests driving the full dispatch engine against
//! in-memory cloud, chunkdb archives and prior installs in temp directories.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use file_constructor::testing::{BuildFixture, CountingCloudProvider};
use file_constructor::{
    ConstructionError, ConstructorConfig, ConstructorObserver, FileConstructor,
};
use more_asserts::assert_lt;
use patch_types::ChunkId;
use tempfile::TempDir;

const PLENTY_OF_DISK: u64 = 1 << 40;

struct TestEnv {
    _root: TempDir,
    install_dir: PathBuf,
    staging_dir: PathBuf,
    spill_dir: PathBuf,
    prior_dir: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let install_dir = root.path().join("install");
        let staging_dir = root.path().join("staging");
        let spill_dir = root.path().join("spill");
        let prior_dir = root.path().join("prior");
        for dir in [&install_dir, &staging_dir, &spill_dir, &prior_dir] {
            std::fs::create_dir_all(dir).unwrap();
        }
        Self { _root: root, install_dir, staging_dir, spill_dir, prior_dir }
    }

    fn config(&self) -> ConstructorConfig {
        ConstructorConfig::new(
            self.install_dir.clone(),
            self.staging_dir.clone(),
            self.spill_dir.clone(),
        )
        .with_assumed_free_disk_space(PLENTY_OF_DISK)
    }

    fn output(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.install_dir.join(name)).unwrap()
    }
}

fn assert_outputs_match(env: &TestEnv, fixture: &BuildFixture, names: &[&str]) {
    for name in names {
        assert_eq!(
            env.output(name),
            fixture.expected_data(name),
            "constructed bytes differ for {name}"
        );
    }
}

/// A small build with shared, partial and repeated chunk usage.
fn mixed_fixture(seed: u64) -> BuildFixture {
    let mut fixture = BuildFixture::new(seed);
    let a = fixture.add_chunk(4096);
    let b = fixture.add_chunk(1500);
    let c = fixture.add_chunk(7000);
    let d = fixture.add_chunk(64);

    fixture.add_file_of_chunks("alpha.bin", &[a, b]);
    // beta reuses a in two different ranges and ends with a tiny chunk.
    fixture.add_file("beta.bin", &[(a, 0, 1024), (c, 0, 7000), (a, 1024, 3072), (d, 0, 64)]);
    // gamma shares chunks with both other files.
    fixture.add_file("gamma.bin", &[(c, 100, 500), (b, 0, 1500), (d, 0, 64)]);
    fixture
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn constructs_files_from_cloud() {
    let env = TestEnv::new();
    let fixture = mixed_fixture(1);
    let manifest = Arc::new(fixture.manifest());

    let constructor = FileConstructor::new(env.config(), manifest)
        .with_cloud_provider(fixture.cloud());
    let summary = constructor.run().await.unwrap();

    assert_eq!(summary.files_constructed, 3);
    assert_eq!(summary.store_stats.locked_entries, 0);
    assert_outputs_match(&env, &fixture, &["alpha.bin", "beta.bin", "gamma.bin"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_boundaries_do_not_change_output() {
    // Tiny batches force many slices per file; the result must be
    // byte-identical to the large-batch run.
    for batch_size in [256usize, 4096, 1 << 20] {
        let env = TestEnv::new();
        let fixture = mixed_fixture(2);
        let manifest = Arc::new(fixture.manifest());

        let config = env.config().with_batch_size(batch_size).with_io_buffer_size(batch_size * 4);
        let constructor =
            FileConstructor::new(config, manifest).with_cloud_provider(fixture.cloud());
        constructor.run().await.unwrap();

        assert_outputs_match(&env, &fixture, &["alpha.bin", "beta.bin", "gamma.bin"]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inline_writes_match_write_thread() {
    let env = TestEnv::new();
    let fixture = mixed_fixture(3);
    let manifest = Arc::new(fixture.manifest());

    let config = env.config().with_write_thread(false);
    let constructor = FileConstructor::new(config, manifest).with_cloud_provider(fixture.cloud());
    let summary = constructor.run().await.unwrap();

    assert_eq!(summary.files_constructed, 3);
    assert_outputs_match(&env, &fixture, &["alpha.bin", "beta.bin", "gamma.bin"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_chunk_under_tiny_memory_budget_fetches_once() {
    // Scenario: three files need different byte ranges of one chunk, with a
    // memory budget smaller than the chunk itself. The backing store must
    // carry it and the cloud must be hit exactly once.
    let env = TestEnv::new();
    let mut fixture = BuildFixture::new(4);
    let shared = fixture.add_chunk(8192);
    let filler = fixture.add_chunk(512);
    fixture.add_file("one.bin", &[(shared, 0, 2048), (filler, 0, 512)]);
    fixture.add_file("two.bin", &[(shared, 2048, 4096)]);
    fixture.add_file("three.bin", &[(shared, 4096, 4096)]);
    let manifest = Arc::new(fixture.manifest());

    let cloud = fixture.cloud();
    let config = env.config().with_memory_budget(1024).with_spill_budget(0);
    let constructor =
        FileConstructor::new(config, manifest).with_cloud_provider(cloud.clone());
    let summary = constructor.run().await.unwrap();

    assert_eq!(summary.files_constructed, 3);
    assert_eq!(cloud.fetches_of(&shared), 1, "shared chunk must be fetched exactly once");
    assert_outputs_match(&env, &fixture, &["one.bin", "two.bin", "three.bin"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn install_source_failure_falls_back_to_cloud_once() {
    let env = TestEnv::new();
    let fixture = mixed_fixture(5);
    let manifest = Arc::new(fixture.manifest());

    // The prior install carries the same build, but one backing file is
    // corrupted so every chunk it fully contains fails verification.
    fixture.materialize(&env.prior_dir);
    let alpha_path = env.prior_dir.join("alpha.bin");
    let mut alpha = std::fs::read(&alpha_path).unwrap();
    alpha[10] ^= 0xff;
    std::fs::write(&alpha_path, &alpha).unwrap();

    let cloud = fixture.cloud();
    let constructor = FileConstructor::new(env.config(), manifest.clone())
        .with_prior_install(manifest, env.prior_dir.clone())
        .with_cloud_provider(cloud.clone());
    let summary = constructor.run().await.unwrap();

    assert_eq!(summary.files_constructed, 3);
    assert_outputs_match(&env, &fixture, &["alpha.bin", "beta.bin", "gamma.bin"]);
    // The corrupted source forced at least one fallback, and every fallback
    // is a one-shot: no chunk may reach the cloud twice.
    assert!(cloud.total_fetches() >= 1, "corruption must force a cloud fallback");
    let manifest = fixture.manifest();
    for id in manifest.chunk_info.keys() {
        assert!(cloud.fetches_of(id) <= 1, "chunk {id} re-issued to the cloud more than once");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunkdbs_serve_chunks_and_delete_when_drained() {
    let env = TestEnv::new();
    let fixture = mixed_fixture(6);
    let manifest = Arc::new(fixture.manifest());

    let db_dir = env._root.path().join("chunkdbs");
    std::fs::create_dir_all(&db_dir).unwrap();
    let ids: Vec<ChunkId> = manifest.chunk_info.keys().copied().collect();
    let (first_half, second_half) = ids.split_at(ids.len() / 2);
    let db_a = db_dir.join("a.chunkdb");
    let db_b = db_dir.join("b.chunkdb");
    fixture.write_chunkdb(&db_a, first_half);
    fixture.write_chunkdb(&db_b, second_half);

    let cloud = fixture.cloud();
    let constructor = FileConstructor::new(env.config(), manifest)
        .with_chunkdbs(vec![db_a.clone(), db_b.clone()], true)
        .with_cloud_provider(cloud.clone());
    let summary = constructor.run().await.unwrap();

    assert_eq!(summary.files_constructed, 3);
    assert_eq!(cloud.total_fetches(), 0, "everything was available locally");
    assert!(!db_a.exists(), "drained chunkdb must be deleted");
    assert!(!db_b.exists(), "drained chunkdb must be deleted");
    assert_outputs_match(&env, &fixture, &["alpha.bin", "beta.bin", "gamma.bin"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn insufficient_disk_space_aborts_before_any_write() {
    let env = TestEnv::new();
    let fixture = mixed_fixture(7);
    let manifest = Arc::new(fixture.manifest());

    let config = env.config().with_assumed_free_disk_space(64);
    let constructor =
        FileConstructor::new(config, manifest).with_cloud_provider(fixture.cloud());
    let err = constructor.run().await.unwrap_err();

    assert!(matches!(err, ConstructionError::OutOfDiskSpace { .. }), "got {err:?}");
    let leftovers: Vec<_> = std::fs::read_dir(&env.install_dir).unwrap().collect();
    assert!(leftovers.is_empty(), "no partial output may exist: {leftovers:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_file_resumes_on_part_boundary() {
    let env = TestEnv::new();
    let fixture = mixed_fixture(8);
    let manifest = Arc::new(fixture.manifest());

    // First run completes everything (and writes the resume marker).
    let constructor = FileConstructor::new(env.config(), manifest.clone())
        .with_cloud_provider(fixture.cloud());
    constructor.run().await.unwrap();

    // Simulate an interruption: beta.bin is cut mid-way through its third
    // part. The second run must resume after the second part, never
    // mid-chunk.
    let beta = fixture.expected_data("beta.bin").to_vec();
    let whole_parts: u64 = 1024 + 7000; // first two parts of beta.bin
    std::fs::write(env.install_dir.join("beta.bin"), &beta[..whole_parts as usize + 17])
        .unwrap();

    let cloud = fixture.cloud();
    let constructor = FileConstructor::new(env.config(), manifest)
        .with_cloud_provider(cloud.clone());
    let summary = constructor.run().await.unwrap();

    assert_eq!(summary.files_resumed, 1);
    assert_eq!(summary.files_skipped, 2, "untouched files are verified and kept");
    assert_eq!(
        summary.bytes_written,
        beta.len() as u64 - whole_parts,
        "only the bytes after the resume cursor are rewritten"
    );
    assert_outputs_match(&env, &fixture, &["alpha.bin", "beta.bin", "gamma.bin"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_remnant_restarts_from_zero() {
    let env = TestEnv::new();
    let fixture = mixed_fixture(9);
    let manifest = Arc::new(fixture.manifest());

    let constructor = FileConstructor::new(env.config(), manifest.clone())
        .with_cloud_provider(fixture.cloud());
    constructor.run().await.unwrap();

    // Grow alpha.bin past its manifest size; it is incompatible and must be
    // rebuilt from scratch.
    let mut alpha = fixture.expected_data("alpha.bin").to_vec();
    alpha.extend_from_slice(b"trailing garbage");
    std::fs::write(env.install_dir.join("alpha.bin"), &alpha).unwrap();

    let constructor = FileConstructor::new(env.config(), manifest)
        .with_cloud_provider(fixture.cloud());
    let summary = constructor.run().await.unwrap();

    assert_eq!(summary.files_resumed, 0);
    assert_eq!(
        summary.bytes_written,
        fixture.expected_data("alpha.bin").len() as u64
    );
    assert_outputs_match(&env, &fixture, &["alpha.bin", "beta.bin", "gamma.bin"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_chunk_fails_run_and_preserves_partial_output() {
    let env = TestEnv::new();
    let mut fixture = BuildFixture::new(10);
    let good = fixture.add_chunk(2048);
    let bad = fixture.add_chunk(2048);
    fixture.add_file_of_chunks("first.bin", &[good]);
    fixture.add_file_of_chunks("second.bin", &[good, bad]);
    let manifest = Arc::new(fixture.manifest());

    let cloud = fixture.cloud();
    cloud.fail_chunk(bad);
    let config = env.config().with_cloud_max_attempts(1).with_max_active_files(1);
    let constructor = FileConstructor::new(config, manifest).with_cloud_provider(cloud);
    let err = constructor.run().await.unwrap_err();

    assert!(matches!(err, ConstructionError::MissingChunk(id) if id == bad), "got {err:?}");
    // Missing-chunk failures are resumable: completed output stays.
    assert_eq!(env.output("first.bin"), fixture.expected_data("first.bin"));
}

#[derive(Default)]
struct RecordingObserver {
    deleted: Mutex<Vec<String>>,
    completed: Mutex<Vec<(String, bool)>>,
}

impl ConstructorObserver for RecordingObserver {
    fn on_file_completed(&self, filename: &str, success: bool) {
        self.completed.lock().unwrap().push((filename.to_string(), success));
    }

    fn before_file_deleted(&self, filename: &str) {
        self.deleted.lock().unwrap().push(filename.to_string());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destructive_install_harvests_before_deleting_sources() {
    let env = TestEnv::new();

    // The shared chunk lives only in the prior build's "app.bin" and is
    // needed by "data.bin", which is constructed after app.bin's replacement
    // deletes the prior file. It must survive via harvesting: the cloud
    // provider does not carry it.
    let mut prior_fixture = BuildFixture::new(11);
    let shared_payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let shared = prior_fixture.register_chunk(shared_payload.clone());
    let old_only = prior_fixture.add_chunk(1024);
    prior_fixture.add_file_of_chunks("app.bin", &[shared, old_only]);
    prior_fixture.materialize(&env.prior_dir);
    let prior_manifest = Arc::new(prior_fixture.manifest());

    let mut fixture = BuildFixture::new(12);
    let shared_new = fixture.register_chunk(shared_payload);
    assert_eq!(shared, shared_new);
    let fresh_a = fixture.add_chunk(2048);
    let fresh_b = fixture.add_chunk(512);
    fixture.add_file_of_chunks("app.bin", &[fresh_a]);
    fixture.add_file_of_chunks("data.bin", &[fresh_b, shared_new]);
    let manifest = Arc::new(fixture.manifest());

    // Deliberately no `shared` in the cloud: only harvesting can satisfy it.
    let cloud = CountingCloudProvider::new(
        [
            (fresh_a, bytes::Bytes::copy_from_slice(fixture.chunk_data(&fresh_a))),
            (fresh_b, bytes::Bytes::copy_from_slice(fixture.chunk_data(&fresh_b))),
        ]
        .into_iter()
        .collect(),
    );

    let observer = Arc::new(RecordingObserver::default());
    let config = env.config().with_destructive_install(true).with_max_active_files(1);
    let constructor = FileConstructor::new(config, manifest)
        .with_prior_install(prior_manifest, env.prior_dir.clone())
        .with_cloud_provider(Arc::new(cloud))
        .with_observer(observer.clone());
    let summary = constructor.run().await.unwrap();

    assert_eq!(summary.files_constructed, 2);
    assert_outputs_match(&env, &fixture, &["app.bin", "data.bin"]);
    assert!(!env.prior_dir.join("app.bin").exists(), "replaced prior file must be deleted");
    assert_eq!(observer.deleted.lock().unwrap().as_slice(), ["app.bin".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_drains_to_zero_locked_store_entries() {
    let env = TestEnv::new();
    let mut fixture = BuildFixture::new(13);
    // Plenty of reused chunks so the backing store is busy when the abort
    // lands.
    let chunks: Vec<ChunkId> = (0..12).map(|_| fixture.add_chunk(4096)).collect();
    for i in 0..6 {
        let mut parts = Vec::new();
        for (j, &id) in chunks.iter().enumerate() {
            let offset = ((i + j) % 4) as u32 * 512;
            parts.push((id, offset, 1024));
        }
        fixture.add_file(&format!("file-{i}.bin"), &parts);
    }
    let manifest = Arc::new(fixture.manifest());

    let cloud = Arc::new(
        CountingCloudProvider::new(
            manifest
                .chunk_info
                .keys()
                .map(|&id| (id, bytes::Bytes::copy_from_slice(fixture.chunk_data(&id))))
                .collect(),
        )
        .with_delay(Duration::from_millis(25)),
    );

    let constructor = FileConstructor::new(
        env.config().with_memory_budget(4096).with_spill_budget(1 << 20),
        manifest,
    )
    .with_cloud_provider(cloud);
    let control = constructor.control();
    let counters = constructor.counters();

    let run = tokio::spawn(constructor.run());
    tokio::time::sleep(Duration::from_millis(40)).await;
    control.abort();
    let result = run.await.unwrap();

    assert!(matches!(result, Err(ConstructionError::Aborted)), "got {result:?}");
    assert_lt!(
        counters.processed_bytes(),
        counters.total_required_bytes(),
        "abort landed after the run already finished"
    );
    assert_eq!(
        counters.backing_store_locked_entries(),
        0,
        "abort drain must leave no locked backing-store entries"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_stalls_progress_until_unpaused() {
    let env = TestEnv::new();
    let fixture = mixed_fixture(14);
    let manifest = Arc::new(fixture.manifest());

    let constructor = FileConstructor::new(env.config(), manifest)
        .with_cloud_provider(fixture.cloud());
    let control = constructor.control();
    let counters = constructor.counters();

    control.pause();
    let run = tokio::spawn(constructor.run());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counters.processed_bytes(), 0, "paused run must not write");

    control.unpause();
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.files_constructed, 3);
    assert_outputs_match(&env, &fixture, &["alpha.bin", "beta.bin", "gamma.bin"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn symlinks_are_created_without_chunk_io() {
    let env = TestEnv::new();
    let mut fixture = BuildFixture::new(15);
    let data = fixture.add_chunk(256);
    fixture.add_file_of_chunks("real.bin", &[data]);
    fixture.add_symlink("link.bin", "real.bin");
    let manifest = Arc::new(fixture.manifest());

    let constructor = FileConstructor::new(env.config(), manifest)
        .with_cloud_provider(fixture.cloud());
    let summary = constructor.run().await.unwrap();

    assert_eq!(summary.files_constructed, 2);
    #[cfg(unix)]
    {
        let link = env.install_dir.join("link.bin");
        let target = std::fs::read_link(&link).unwrap();
        assert_eq!(target, PathBuf::from("real.bin"));
    }
}

/// Gauges move as the run proceeds: required-to-finish drains toward zero.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn counters_track_progress() {
    let env = TestEnv::new();
    let fixture = mixed_fixture(16);
    let manifest = Arc::new(fixture.manifest());
    let total: u64 = manifest.total_build_size();

    let constructor = FileConstructor::new(env.config(), manifest)
        .with_cloud_provider(fixture.cloud());
    let counters = constructor.counters();
    constructor.run().await.unwrap();

    assert_eq!(counters.total_required_bytes(), total);
    assert_eq!(counters.processed_bytes(), total);
    assert_eq!(counters.required_to_finish_bytes(), 0);
    assert_eq!(counters.disk_free_bytes(), PLENTY_OF_DISK);
}
