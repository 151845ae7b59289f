use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chunk_sources::{
    ChunkDbSource, ChunkSource, CloudProvider, CloudSource, InstallSource, SourceError, SourceKind,
};
use chunk_store::{
    BackingStoreStats, ChunkBackingStore, ChunkLocation, ChunkLocationTable,
    ChunkReferenceTracker, ManifestReferenceTracker,
};
use patch_types::{BuildManifest, ChunkId, FileHash, FileManifestEntry};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::{Batch, BatchState, ChunkRequest, Routing, Splat};
use crate::buffer::{BufferLease, BufferPool};
use crate::config::ConstructorConfig;
use crate::disk_space::{available_disk_space, required_disk_space, RemainingFile};
use crate::error::{ConstructionError, Result};
use crate::progress::{ConstructorObserver, ControlHandle, NullObserver, ProgressCounters};
use crate::resume::{file_resume_action, FileResumeAction, ResumeData};
use crate::workers::{
    spawn_source_worker, spawn_write_worker, Event, ReadJob, WriteBackend, WriteJob,
    WriteWorkerState,
};

/// How long the dispatch loop sleeps when no completion arrives, so pause
/// and abort are observed promptly.
const DISPATCH_WAIT: Duration = Duration::from_millis(100);

/// Result of a completed (or failed-and-drained) construction run.
#[derive(Debug, Default, Clone)]
pub struct ConstructionSummary {
    /// Files fully constructed this run (including resumed ones).
    pub files_constructed: usize,
    /// Files that picked up from a partial remnant of a prior run.
    pub files_resumed: usize,
    /// Files found already complete on disk and left untouched.
    pub files_skipped: usize,
    pub bytes_written: u64,
    pub store_stats: BackingStoreStats,
}

/// The file-reconstruction orchestrator.
///
/// Walks the manifest's ordered file list, slices each file's chunk parts
/// into I/O-buffer-sized batches, dispatches per-chunk reads to whichever
/// source currently holds each chunk, retires batches strictly in order,
/// queues writes, and verifies every constructed file's hash, all under
/// bounded memory and bounded extra disk, with crash-resume support.
pub struct FileConstructor {
    config: ConstructorConfig,
    manifest: Arc<BuildManifest>,
    prior: Option<(Arc<BuildManifest>, PathBuf)>,
    chunkdb_paths: Vec<PathBuf>,
    chunkdb_delete: bool,
    cloud_provider: Option<Arc<dyn CloudProvider>>,
    observer: Arc<dyn ConstructorObserver>,
    counters: Arc<ProgressCounters>,
    control: ControlHandle,
}

impl FileConstructor {
    pub fn new(config: ConstructorConfig, manifest: Arc<BuildManifest>) -> Self {
        Self {
            config,
            manifest,
            prior: None,
            chunkdb_paths: Vec::new(),
            chunkdb_delete: false,
            cloud_provider: None,
            observer: Arc::new(NullObserver),
            counters: Arc::new(ProgressCounters::default()),
            control: ControlHandle::new(),
        }
    }

    /// A prior local installation to source chunks from (and, in destructive
    /// mode, to delete file by file as replacements complete).
    pub fn with_prior_install(mut self, manifest: Arc<BuildManifest>, dir: PathBuf) -> Self {
        self.prior = Some((manifest, dir));
        self
    }

    pub fn with_chunkdbs(mut self, paths: Vec<PathBuf>, delete_after_use: bool) -> Self {
        self.chunkdb_paths = paths;
        self.chunkdb_delete = delete_after_use;
        self
    }

    pub fn with_cloud_provider(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.cloud_provider = Some(provider);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConstructorObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn counters(&self) -> Arc<ProgressCounters> {
        self.counters.clone()
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Runs the whole construction job to completion, failure, or abort.
    #[instrument(skip_all, name = "FileConstructor::run", fields(files = self.manifest.files.len()))]
    pub async fn run(self) -> Result<ConstructionSummary> {
        Runner::build(self)?.run().await
    }
}

struct FileState {
    entry: FileManifestEntry,
    action: FileResumeAction,
    /// Verified complete (or symlink): takes no part in batching.
    skip: bool,
    started: bool,
    closed: bool,
    finalize_sent: bool,
    failed: Option<ConstructionError>,
    hasher: Option<Sha256>,
    /// Resume cursor: first part this run constructs.
    start_part: usize,
    resumed_bytes: u64,
    /// Next part to slice into a batch.
    next_part: usize,
    /// Output offset of the next batch.
    write_offset: u64,
    bytes_written: u64,
    /// Global consumption position of `parts[start_part]`.
    global_base: u64,
    outstanding_batches: usize,
    harvests_pending: usize,
}

impl FileState {
    fn fully_batched(&self) -> bool {
        self.next_part >= self.entry.parts.len()
    }
}

struct Runner {
    config: ConstructorConfig,
    effective_batch_size: usize,
    manifest: Arc<BuildManifest>,
    prior: Option<(Arc<BuildManifest>, PathBuf)>,

    files: Vec<FileState>,
    active: Vec<usize>,
    batching_file: usize,
    batches: VecDeque<Batch>,
    next_batch_seq: u64,
    pool: BufferPool,
    in_flight_writes: HashMap<u64, (BufferLease, usize)>,
    harvest_requested: HashSet<ChunkId>,

    store: ChunkBackingStore,
    locations: Arc<ChunkLocationTable>,
    tracker: Arc<ManifestReferenceTracker>,
    install: Option<Arc<InstallSource>>,
    chunkdb: Option<Arc<ChunkDbSource>>,
    cloud: Option<Arc<CloudSource>>,

    observer: Arc<dyn ConstructorObserver>,
    counters: Arc<ProgressCounters>,
    control: ControlHandle,

    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    pending_events: VecDeque<Event>,
    install_tx: Option<UnboundedSender<ReadJob>>,
    chunkdb_tx: Option<UnboundedSender<ReadJob>>,
    write_backend: WriteBackend,
    worker_handles: Vec<JoinHandle<()>>,

    first_error: Option<ConstructionError>,
    summary: ConstructionSummary,
}

impl Runner {
    fn build(fc: FileConstructor) -> Result<Runner> {
        let FileConstructor {
            config,
            manifest,
            prior,
            chunkdb_paths,
            chunkdb_delete,
            cloud_provider,
            observer,
            counters,
            control,
        } = fc;

        validate_manifest(&manifest)?;

        let resume = ResumeData::init(
            &config.staging_dir,
            &manifest.resume_ids,
            config.resume_enabled,
        )
        .map_err(|err| ConstructionError::CannotCreateFile {
            path: config.staging_dir.display().to_string(),
            source: Arc::new(err),
        })?;

        // Per-file resume decisions; fully-sized remnants are re-hashed
        // before being trusted.
        let mut files = Vec::with_capacity(manifest.files.len());
        for entry in &manifest.files {
            let state = plan_file(entry, &config, resume.resumable())?;
            files.push(state);
        }

        // Disk-space check happens before anything is created on disk; the
        // spill file and output files come later.
        let remaining: Vec<RemainingFile<'_>> = files
            .iter()
            .filter(|f| !f.skip)
            .map(|f| RemainingFile {
                filename: &f.entry.filename,
                bytes_to_write: f.entry.file_size - f.resumed_bytes,
            })
            .collect();
        let required = required_disk_space(
            &remaining,
            prior.as_ref().map(|(m, _)| m.as_ref()),
            config.destructive_install,
        ) + config.disk_headroom;
        let available =
            available_disk_space(&config.install_dir, config.assumed_free_disk_space)
                .unwrap_or(u64::MAX);
        if available < required {
            return Err(ConstructionError::OutOfDiskSpace { required, available });
        }
        counters.set_disk_free(available);

        // Global consumption order over the remaining job.
        let mut position = 0u64;
        let mut order: Vec<ChunkId> = Vec::new();
        for file in &mut files {
            if file.skip {
                continue;
            }
            file.global_base = position;
            for part in &file.entry.parts[file.start_part..] {
                order.push(part.id);
                position += 1;
            }
        }
        let tracker = Arc::new(ManifestReferenceTracker::from_consumption_order(order));

        // Deletion schedule: in destructive mode a prior file disappears at
        // the position its replacement completes.
        let mut deletion_schedule: HashMap<String, u64> = HashMap::new();
        if config.destructive_install {
            if let Some((prior_manifest, _)) = &prior {
                for file in &files {
                    if prior_manifest.file_entry(&file.entry.filename).is_none() {
                        continue;
                    }
                    let remaining_parts = file.entry.parts.len().saturating_sub(file.start_part);
                    let deleted_at = if file.skip || remaining_parts == 0 {
                        file.global_base
                    } else {
                        file.global_base + remaining_parts as u64 - 1
                    };
                    deletion_schedule.insert(file.entry.filename.clone(), deleted_at);
                }
            }
        }

        let install = prior.as_ref().map(|(prior_manifest, dir)| {
            Arc::new(InstallSource::new(dir.clone(), prior_manifest.clone(), deletion_schedule))
        });
        let chunkdb = if chunkdb_paths.is_empty() {
            None
        } else {
            let source = ChunkDbSource::open(&chunkdb_paths, chunkdb_delete)
                .map_err(|err| ConstructionError::InternalConsistency(err.to_string()))?;
            Some(Arc::new(source))
        };
        let cloud = cloud_provider.map(|provider| {
            Arc::new(CloudSource::new(
                provider,
                Arc::new(manifest.chunk_info.clone()),
                config.cloud_concurrency,
                config.cloud_max_attempts,
            ))
        });

        // Seed the location table. Local archives win over reassembly from
        // a prior install; everything else starts at the cloud.
        let locations = Arc::new(ChunkLocationTable::new());
        for file in &files {
            if file.skip {
                continue;
            }
            for part in &file.entry.parts[file.start_part..] {
                if locations.get(&part.id).is_some() {
                    continue;
                }
                let location = if chunkdb.as_ref().is_some_and(|db| db.has_chunk(&part.id)) {
                    ChunkLocation::ChunkDb
                } else if install.as_ref().is_some_and(|src| src.has_chunk(&part.id)) {
                    ChunkLocation::Install
                } else {
                    ChunkLocation::Cloud
                };
                locations.set(part.id, location);
            }
        }

        // Batch sizing must accommodate the largest chunk in the job.
        let largest_window = manifest.largest_chunk_window() as usize;
        let effective_batch_size = config.batch_size.max(largest_window).max(1);
        let pool_capacity = config.io_buffer_size.max(effective_batch_size);
        let pool = BufferPool::new(pool_capacity);

        let store = ChunkBackingStore::new(
            &config.spill_dir,
            config.memory_budget,
            config.spill_budget,
            locations.clone(),
            tracker.clone(),
        )
        .map_err(|err| ConstructionError::CannotCreateFile {
            path: config.spill_dir.display().to_string(),
            source: Arc::new(err),
        })?;

        let total_required: u64 =
            files.iter().filter(|f| !f.skip).map(|f| f.entry.file_size - f.resumed_bytes).sum();
        counters.set_total_required(total_required);
        counters.set_required_to_finish(total_required);

        let (events_tx, events_rx) = unbounded_channel();

        // One worker permanently bound to each blocking source, plus the
        // write worker; the cloud source schedules itself.
        let mut worker_handles = Vec::new();
        let install_tx = install.as_ref().map(|source| {
            let (tx, handle) =
                spawn_source_worker(source.clone(), events_tx.clone(), control.clone());
            worker_handles.push(handle);
            tx
        });
        let chunkdb_tx = chunkdb.as_ref().map(|source| {
            let (tx, handle) =
                spawn_source_worker(source.clone(), events_tx.clone(), control.clone());
            worker_handles.push(handle);
            tx
        });
        let write_backend = if config.use_write_thread {
            let (tx, handle) = spawn_write_worker(events_tx.clone(), control.clone());
            worker_handles.push(handle);
            WriteBackend::Thread(tx)
        } else {
            WriteBackend::Inline(WriteWorkerState::new())
        };

        info!(
            files = files.len(),
            remaining_refs = tracker.remaining(),
            batch_size = effective_batch_size,
            pool = pool_capacity,
            required,
            available,
            "construction initialized"
        );

        let mut runner = Runner {
            config,
            effective_batch_size,
            manifest,
            prior,
            files,
            active: Vec::new(),
            batching_file: 0,
            batches: VecDeque::new(),
            next_batch_seq: 0,
            pool,
            in_flight_writes: HashMap::new(),
            harvest_requested: HashSet::new(),
            store,
            locations,
            tracker,
            install,
            chunkdb,
            cloud,
            observer,
            counters,
            control,
            events_tx,
            events_rx,
            pending_events: VecDeque::new(),
            install_tx,
            chunkdb_tx,
            write_backend,
            worker_handles,
            first_error: None,
            summary: ConstructionSummary::default(),
        };
        runner.post_cloud_requirement();
        Ok(runner)
    }

    async fn run(mut self) -> Result<ConstructionSummary> {
        loop {
            while let Some(event) = self.pending_events.pop_front() {
                self.handle_event(event);
            }
            self.pump();
            self.try_retire();
            self.maybe_finalize();
            if !self.pending_events.is_empty() {
                continue;
            }
            if self.is_done() {
                break;
            }
            match tokio::time::timeout(DISPATCH_WAIT, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => break,
                Err(_) => {}, // timeout: re-observe pause/abort
            }
        }
        self.shutdown().await
    }

    // ---- batching ------------------------------------------------------

    /// Starts files and slices batches up to the pool and active-file
    /// limits. Batches are created in global consumption order: a file's
    /// parts are fully sliced before the next file begins.
    fn pump(&mut self) {
        if self.control.is_aborted() || self.first_error.is_some() || self.control.is_paused() {
            return;
        }
        loop {
            while self.batching_file < self.files.len() {
                let idx = self.batching_file;
                if !self.files[idx].started {
                    if self.active.len() >= self.config.max_active_files {
                        return;
                    }
                    if let Err(err) = self.start_file(idx) {
                        self.files[idx].closed = true;
                        self.fail_file(idx, err);
                        return;
                    }
                }
                let file = &self.files[idx];
                if file.skip || file.fully_batched() || file.failed.is_some() {
                    self.batching_file += 1;
                    continue;
                }
                break;
            }
            if self.batching_file >= self.files.len() {
                return;
            }
            if !self.build_one_batch(self.batching_file) {
                return;
            }
        }
    }

    fn start_file(&mut self, idx: usize) -> Result<()> {
        let entry = self.files[idx].entry.clone();
        self.files[idx].started = true;

        if entry.is_symlink() {
            self.files[idx].skip = true;
            self.files[idx].closed = true;
            self.observer.on_file_started(&entry.filename);
            let result = self.create_symlink(&entry);
            match result {
                Ok(()) => {
                    self.summary.files_constructed += 1;
                    self.observer.on_file_completed(&entry.filename, true);
                    self.active.push(idx);
                    self.start_prior_harvest(idx);
                    Ok(())
                },
                Err(err) => Err(err),
            }
        } else if self.files[idx].skip {
            // Verified complete from a prior run.
            debug!(file = %entry.filename, "skipping verified-complete file");
            self.files[idx].closed = true;
            self.summary.files_skipped += 1;
            self.observer.on_file_started(&entry.filename);
            self.observer.on_file_completed(&entry.filename, true);
            self.active.push(idx);
            self.start_prior_harvest(idx);
            Ok(())
        } else {
            self.check_disk_space()?;
            self.prepare_output(idx)?;
            self.observer.on_file_started(&entry.filename);
            self.active.push(idx);
            Ok(())
        }
    }

    #[cfg(unix)]
    fn create_symlink(&self, entry: &FileManifestEntry) -> Result<()> {
        let path = self.output_path(&entry.filename);
        let target = entry.symlink_target.as_deref().unwrap_or_default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| ConstructionError::CannotCreateFile {
                path: path.display().to_string(),
                source: Arc::new(err),
            })?;
        }
        let _ = std::fs::remove_file(&path);
        std::os::unix::fs::symlink(target, &path).map_err(|err| {
            ConstructionError::CannotCreateFile {
                path: path.display().to_string(),
                source: Arc::new(err),
            }
        })
    }

    #[cfg(not(unix))]
    fn create_symlink(&self, entry: &FileManifestEntry) -> Result<()> {
        warn!(file = %entry.filename, "symlinks unsupported on this platform; skipping");
        Ok(())
    }

    /// Creates or truncates the output file and, when resuming, feeds the
    /// kept prefix through the streaming hash.
    fn prepare_output(&mut self, idx: usize) -> Result<()> {
        let entry = self.files[idx].entry.clone();
        let action = self.files[idx].action.clone();
        let path = self.output_path(&entry.filename);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| ConstructionError::CannotCreateFile {
                path: path.display().to_string(),
                source: Arc::new(err),
            })?;
        }

        let mut hasher = Sha256::new();
        match action {
            FileResumeAction::Fresh | FileResumeAction::DeleteThenFresh => {
                if matches!(action, FileResumeAction::DeleteThenFresh) {
                    let _ = std::fs::remove_file(&path);
                }
                // Creating up front surfaces permission problems before any
                // read is issued.
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|err| ConstructionError::CannotCreateFile {
                        path: path.display().to_string(),
                        source: Arc::new(err),
                    })?;
            },
            FileResumeAction::Resume { byte_offset, .. } => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|err| ConstructionError::CannotCreateFile {
                        path: path.display().to_string(),
                        source: Arc::new(err),
                    })?;
                // Drop any partial tail beyond the last whole part.
                file.set_len(byte_offset)
                    .map_err(|err| ConstructionError::Serialize(Arc::new(err)))?;
                let actual = file
                    .metadata()
                    .map_err(|err| ConstructionError::Serialize(Arc::new(err)))?
                    .len();
                if actual != byte_offset {
                    return Err(ConstructionError::FailedInitialSizeCheck(
                        entry.filename.clone(),
                    ));
                }
                hash_file_prefix(&path, byte_offset, &mut hasher)?;
                info!(file = %entry.filename, byte_offset, "resuming from prior run");
                self.summary.files_resumed += 1;
            },
            FileResumeAction::VerifyComplete => {
                // Plans never leave this action in place for constructed
                // files.
                return Err(ConstructionError::InternalConsistency(format!(
                    "file {} reached construction with a verify-complete plan",
                    entry.filename
                )));
            },
        }

        self.files[idx].hasher = Some(hasher);
        Ok(())
    }

    fn build_one_batch(&mut self, idx: usize) -> bool {
        let largest = self.pool.largest_free();
        if largest == 0 {
            return false;
        }
        let cap = largest.min(self.effective_batch_size);

        let (first_part, write_offset, global_first) = {
            let file = &self.files[idx];
            (
                file.next_part,
                file.write_offset,
                file.global_base + (file.next_part - file.start_part) as u64,
            )
        };

        // Slice parts into the available region.
        let parts = &self.files[idx].entry.parts;
        let mut total = 0usize;
        let mut count = 0usize;
        for part in &parts[first_part..] {
            let len = part.length as usize;
            if total + len > cap {
                break;
            }
            total += len;
            count += 1;
        }
        if count == 0 {
            // The pool is too fragmented right now; in-flight writes will
            // free and coalesce space.
            return false;
        }

        // Group the slice's parts by chunk id, preserving first-use order; a
        // chunk reused within the batch becomes one read with many splats.
        let batch_parts = parts[first_part..first_part + count].to_vec();
        let mut order: Vec<ChunkId> = Vec::new();
        let mut splats: HashMap<ChunkId, Vec<Splat>> = HashMap::new();
        let mut last_position: HashMap<ChunkId, u64> = HashMap::new();
        let mut dest = 0usize;
        for (i, part) in batch_parts.iter().enumerate() {
            let entry = splats.entry(part.id).or_insert_with(|| {
                order.push(part.id);
                Vec::new()
            });
            entry.push(Splat {
                chunk_offset: part.chunk_offset,
                length: part.length,
                dest_offset: dest,
            });
            last_position.insert(part.id, global_first + i as u64);
            dest += part.length as usize;
        }

        let seq = self.next_batch_seq;
        self.next_batch_seq += 1;

        let mut requests = Vec::with_capacity(order.len());
        let mut pending_reads = 0usize;
        for id in order {
            let chunk_splats = splats.remove(&id).expect("grouped above");
            let last_in_batch = last_position[&id];
            match self.plan_request(idx, id, chunk_splats, last_in_batch) {
                Ok(request) => {
                    if request.needs_read {
                        pending_reads += 1;
                    }
                    requests.push(request);
                },
                Err(err) => {
                    // Roll back store locks taken for earlier requests of
                    // this batch, then fail the file.
                    for request in &requests {
                        self.release_request_lock(request);
                    }
                    self.fail_file(idx, err);
                    return false;
                },
            }
        }

        let lease = match self.pool.allocate(total) {
            Some(lease) => lease,
            None => {
                for request in &requests {
                    self.release_request_lock(request);
                }
                self.fail_file(
                    idx,
                    ConstructionError::InternalConsistency(
                        "buffer pool refused a batch it quoted space for".into(),
                    ),
                );
                return false;
            },
        };

        debug!(
            seq,
            file = %self.files[idx].entry.filename,
            parts = count,
            bytes = total,
            reads = pending_reads,
            "batch dispatched"
        );

        let batch = Batch {
            seq,
            file_index: idx,
            first_part,
            part_count: count,
            write_offset,
            lease,
            buffer: BytesMut::zeroed(total),
            requests,
            pending_reads,
            state: BatchState::ReadsPending,
        };

        // Issue the reads after the batch bookkeeping is in place.
        let reads: Vec<ChunkId> =
            batch.requests.iter().filter(|r| r.needs_read).map(|r| r.id).collect();
        self.batches.push_back(batch);
        for id in reads {
            self.dispatch_read(seq, id);
        }

        let file = &mut self.files[idx];
        file.next_part += count;
        file.write_offset += total as u64;
        file.outstanding_batches += 1;
        true
    }

    /// Decides how one chunk's data reaches this batch: straight into the
    /// destination, or via the backing store (partial use, reuse later in
    /// the job, or a source that expires before the chunk's final use).
    fn plan_request(
        &mut self,
        file_idx: usize,
        id: ChunkId,
        splats: Vec<Splat>,
        last_in_batch: u64,
    ) -> Result<ChunkRequest> {
        if self.store.contains(&id) {
            self.store.lock(&id)?;
            return Ok(ChunkRequest {
                id,
                routing: Routing::Store { splats },
                needs_read: false,
                store_locked: true,
                reserved: false,
                cloud_fallback_used: false,
                result: None,
            });
        }

        let window = self.manifest.chunk_window(&id).map_err(|_| {
            ConstructionError::MissingFileInfo(self.files[file_idx].entry.filename.clone())
        })?;

        let needed_later = self.tracker.next_usage_after(&id, last_in_batch + 1).is_some();
        let single_full_use = splats.len() == 1
            && splats[0].chunk_offset == 0
            && splats[0].length == window;
        let source_expires = match (&self.install, self.locations.get(&id)) {
            (Some(install), Some(ChunkLocation::Install)) => {
                match install.chunk_unavailable_at(&id) {
                    Some(expiry) => {
                        self.tracker.last_usage(&id).is_some_and(|last| expiry <= last)
                    },
                    None => false,
                }
            },
            _ => false,
        };

        if single_full_use && !needed_later && !source_expires {
            return Ok(ChunkRequest {
                id,
                routing: Routing::Direct { dest_offset: splats[0].dest_offset, length: window },
                needs_read: true,
                store_locked: false,
                reserved: false,
                cloud_fallback_used: false,
                result: None,
            });
        }

        let last_needed = self.tracker.last_usage(&id).unwrap_or(last_in_batch);
        self.store.reserve_and_lock(id, window, last_needed)?;
        Ok(ChunkRequest {
            id,
            routing: Routing::Store { splats },
            needs_read: true,
            store_locked: true,
            reserved: true,
            cloud_fallback_used: false,
            result: None,
        })
    }

    fn release_request_lock(&mut self, request: &ChunkRequest) {
        if !request.store_locked {
            return;
        }
        if self.store.is_committed(&request.id) {
            let _ = self.store.release(&request.id);
        } else {
            let _ = self.store.dereserve(&request.id);
        }
    }

    fn dispatch_read(&mut self, batch_seq: u64, id: ChunkId) {
        match self.locations.get(&id) {
            Some(ChunkLocation::Install) if self.install_tx.is_some() => {
                let tx = self.install_tx.as_ref().expect("checked above");
                let _ = tx.send(ReadJob::Read { batch_seq, id });
            },
            Some(ChunkLocation::ChunkDb) if self.chunkdb_tx.is_some() => {
                let tx = self.chunkdb_tx.as_ref().expect("checked above");
                let _ = tx.send(ReadJob::Read { batch_seq, id });
            },
            _ => self.spawn_cloud_fetch(batch_seq, id),
        }
    }

    fn spawn_cloud_fetch(&mut self, batch_seq: u64, id: ChunkId) {
        match &self.cloud {
            Some(cloud) => {
                let cloud = cloud.clone();
                let events = self.events_tx.clone();
                let control = self.control.clone();
                tokio::spawn(async move {
                    let result = if control.is_aborted() {
                        Err(SourceError::Aborted)
                    } else {
                        cloud.fetch(id).await
                    };
                    let _ = events.send(Event::ReadDone {
                        batch_seq,
                        id,
                        kind: SourceKind::Cloud,
                        result,
                    });
                });
            },
            None => {
                self.pending_events.push_back(Event::ReadDone {
                    batch_seq,
                    id,
                    kind: SourceKind::Cloud,
                    result: Err(SourceError::UnknownChunk(id)),
                });
            },
        }
    }

    // ---- event handling ------------------------------------------------

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ReadDone { batch_seq, id, kind, result } => {
                self.on_read_done(batch_seq, id, kind, result);
            },
            Event::HarvestDone { file_index, id, last_needed, result } => {
                self.on_harvest_done(file_index, id, last_needed, result);
            },
            Event::WriteDone { file_index, batch_seq, bytes, result } => {
                self.on_write_done(file_index, batch_seq, bytes, result);
            },
            Event::FileClosed { file_index, result } => {
                self.on_file_closed(file_index, result);
            },
        }
    }

    fn on_read_done(
        &mut self,
        batch_seq: u64,
        id: ChunkId,
        kind: SourceKind,
        result: std::result::Result<bytes::Bytes, SourceError>,
    ) {
        let Some(batch_index) = self.batches.iter().position(|b| b.seq == batch_seq) else {
            debug_assert!(false, "read completion for unknown batch {batch_seq}");
            return;
        };

        let needs_fallback = {
            let batch = &mut self.batches[batch_index];
            let Some(request) = batch.request_mut(&id) else {
                debug_assert!(false, "read completion for unknown chunk {id}");
                return;
            };
            if request.result.is_some() {
                // Duplicate completion; the first one won.
                debug_assert!(false, "duplicate completion for chunk {id}");
                return;
            }

            let failed_locally = result.is_err()
                && kind != SourceKind::Cloud
                && !matches!(result, Err(SourceError::Aborted));
            if failed_locally && !request.cloud_fallback_used {
                request.cloud_fallback_used = true;
                true
            } else {
                request.result = Some(result);
                batch.pending_reads -= 1;
                false
            }
        };

        if needs_fallback {
            // One retry against the cloud; the location table flip makes the
            // reroute visible to future batches too.
            warn!(%id, ?kind, "source read failed; rerouting to cloud");
            self.locations.set(id, ChunkLocation::Cloud);
            self.spawn_cloud_fetch(batch_seq, id);
        }
    }

    fn try_retire(&mut self) {
        loop {
            let ready = matches!(self.batches.front(), Some(batch) if batch.reads_finished());
            if !ready {
                break;
            }
            let batch = self.batches.pop_front().expect("checked above");
            self.retire_batch(batch);
        }
    }

    /// Retires the batch at the head of the FIFO: splats backing-store
    /// contents into destinations, updates the streaming hash, pops consumed
    /// references in exact global order, and queues the write.
    fn retire_batch(&mut self, mut batch: Batch) {
        let idx = batch.file_index;
        let run_stopped = self.first_error.is_some() || self.control.is_aborted();
        let file_failed = self.files[idx].failed.is_some();

        if run_stopped || file_failed || batch.any_failed() {
            self.drain_batch(batch);
            return;
        }

        if let Err(err) = self.retire_batch_success(&mut batch) {
            self.fail_file(idx, err);
            self.drain_batch(batch);
            return;
        }

        batch.state = BatchState::WritePending;
        let path = self.output_path(&self.files[idx].entry.filename);
        let data = std::mem::take(&mut batch.buffer).freeze();
        self.in_flight_writes.insert(batch.seq, (batch.lease, idx));
        self.write_backend.submit(
            WriteJob::Write {
                file_index: idx,
                path,
                offset: batch.write_offset,
                data,
                batch_seq: batch.seq,
            },
            &self.control,
            &mut self.pending_events,
        );
    }

    fn retire_batch_success(&mut self, batch: &mut Batch) -> Result<()> {
        // Fill every destination, committing freshly read store chunks and
        // releasing the locks this batch holds.
        for request in &mut batch.requests {
            match &request.routing {
                Routing::Direct { dest_offset, length } => {
                    let data = take_read_result(request.result.take())?;
                    if data.len() != *length as usize {
                        return Err(ConstructionError::InternalConsistency(format!(
                            "direct read for chunk {} returned {} bytes, expected {length}",
                            request.id,
                            data.len()
                        )));
                    }
                    batch.buffer[*dest_offset..*dest_offset + data.len()]
                        .copy_from_slice(&data);
                },
                Routing::Store { splats } => {
                    let data = if request.needs_read {
                        let data = take_read_result(request.result.take())?;
                        self.store.commit_and_release(&request.id, data.clone())?;
                        request.store_locked = false;
                        data
                    } else {
                        let data = self.store.read_chunk(&request.id)?;
                        self.store.release(&request.id)?;
                        request.store_locked = false;
                        data
                    };
                    for splat in splats {
                        let src_start = splat.chunk_offset as usize;
                        let src_end = src_start + splat.length as usize;
                        if src_end > data.len() {
                            return Err(ConstructionError::InternalConsistency(format!(
                                "splat of chunk {} reads past its window",
                                request.id
                            )));
                        }
                        batch.buffer[splat.dest_offset..splat.dest_offset + splat.length as usize]
                            .copy_from_slice(&data[src_start..src_end]);
                    }
                },
            }
        }

        // The streaming hash runs on the dispatch thread from the same
        // buffer; retirement order makes that safe.
        if let Some(hasher) = self.files[batch.file_index].hasher.as_mut() {
            hasher.update(&batch.buffer);
        }

        // Pop consumed references in exact global order. A desync here is
        // fatal to the run.
        let parts = self.files[batch.file_index].entry.parts
            [batch.first_part..batch.first_part + batch.part_count]
            .to_vec();
        for part in &parts {
            let position = self.tracker.pop_next(&part.id)?;
            if self.tracker.next_usage_after(&part.id, position + 1).is_none() {
                if let Some(db) = &self.chunkdb {
                    db.on_chunk_consumed(&part.id);
                }
            }
        }

        self.store.check_retirements(self.tracker.current_position());
        self.counters
            .set_backing_store_locked(self.store.stats().locked_entries as u64);
        Ok(())
    }

    /// Releases everything a batch holds without producing output. Reference
    /// pops still happen in order so position bookkeeping stays coherent for
    /// the rest of the drain.
    fn drain_batch(&mut self, batch: Batch) {
        for request in &batch.requests {
            self.release_request_lock(request);
        }

        let mut escalation: Option<ConstructionError> = None;
        for request in &batch.requests {
            if let Some(Err(err)) = &request.result {
                escalation = Some(match err {
                    SourceError::Aborted => ConstructionError::Aborted,
                    _ => ConstructionError::MissingChunk(request.id),
                });
                break;
            }
        }

        let parts = self.files[batch.file_index].entry.parts
            [batch.first_part..batch.first_part + batch.part_count]
            .to_vec();
        for part in &parts {
            if self.tracker.pop_next(&part.id).is_err() {
                break;
            }
        }
        self.store.check_retirements(self.tracker.current_position());
        self.counters
            .set_backing_store_locked(self.store.stats().locked_entries as u64);

        self.pool.release(batch.lease);
        self.files[batch.file_index].outstanding_batches -= 1;

        if let Some(err) = escalation {
            if self.files[batch.file_index].failed.is_none() {
                self.fail_file(batch.file_index, err);
            }
        }
    }

    fn on_write_done(
        &mut self,
        file_index: usize,
        batch_seq: u64,
        bytes: u64,
        result: Result<()>,
    ) {
        if let Some((lease, _)) = self.in_flight_writes.remove(&batch_seq) {
            self.pool.release(lease);
        }
        let file = &mut self.files[file_index];
        file.outstanding_batches -= 1;
        match result {
            Ok(()) => {
                file.bytes_written += bytes;
                let written = file.resumed_bytes + file.bytes_written;
                let total = file.entry.file_size;
                let filename = file.entry.filename.clone();
                self.summary.bytes_written += bytes;
                self.counters.add_processed(bytes);
                self.observer.on_file_progress(&filename, written, total);
            },
            Err(err) => self.fail_file(file_index, err),
        }
    }

    /// Sends the finalize job for files whose batches have fully drained:
    /// either all parts written, or the run stopped.
    fn maybe_finalize(&mut self) {
        if self.control.is_aborted() {
            self.mark_active_files_aborted();
        }
        let candidates: Vec<usize> = self.active.clone();
        for idx in candidates {
            let file = &self.files[idx];
            if file.closed || file.finalize_sent || file.skip {
                continue;
            }
            let stopped = file.failed.is_some()
                || self.first_error.is_some()
                || self.control.is_aborted();
            if file.outstanding_batches != 0 || !(file.fully_batched() || stopped) {
                continue;
            }
            self.send_finalize(idx);
        }
    }

    fn mark_active_files_aborted(&mut self) {
        let candidates: Vec<usize> = self.active.clone();
        for idx in candidates {
            let file = &self.files[idx];
            if !file.closed && file.failed.is_none() {
                self.fail_file(idx, ConstructionError::Aborted);
            }
        }
    }

    fn send_finalize(&mut self, idx: usize) {
        // A finished, healthy file gets its hash verified before close; a
        // mismatch reclassifies it as failed and discards the output.
        if self.files[idx].failed.is_none() && self.files[idx].fully_batched() {
            let hasher = self.files[idx].hasher.take().unwrap_or_default();
            let actual = FileHash::from_hasher(hasher);
            if actual != self.files[idx].entry.file_hash {
                let name = self.files[idx].entry.filename.clone();
                error!(file = %name, "constructed file failed final hash verification");
                self.fail_file(idx, ConstructionError::OutboundData(name));
            }
        }

        let file = &mut self.files[idx];
        file.finalize_sent = true;
        let discard = file
            .failed
            .as_ref()
            .map(|err| err.deletes_partial_output())
            .unwrap_or(false);
        let path = self.output_path(&self.files[idx].entry.filename);
        self.write_backend.submit(
            WriteJob::Finalize { file_index: idx, path, discard },
            &self.control,
            &mut self.pending_events,
        );
    }

    fn on_file_closed(&mut self, file_index: usize, result: Result<()>) {
        self.files[file_index].closed = true;
        let filename = self.files[file_index].entry.filename.clone();

        if self.files[file_index].failed.is_none() {
            if let Err(err) = result {
                // Close failures make the on-disk bytes untrustworthy.
                let _ = std::fs::remove_file(self.output_path(&filename));
                self.fail_file(file_index, err);
            }
        }

        if self.files[file_index].failed.is_some() {
            self.observer.on_file_completed(&filename, false);
            self.release_active(file_index);
            return;
        }

        info!(file = %filename, "file constructed and verified");
        self.summary.files_constructed += 1;
        self.observer.on_file_completed(&filename, true);
        self.refresh_disk_gauges();
        self.start_prior_harvest(file_index);
    }

    // ---- destructive-install harvesting --------------------------------

    /// In destructive mode, once a file completes, chunks still needed from
    /// the prior version of that file are pulled into the backing store and
    /// the prior file is deleted.
    fn start_prior_harvest(&mut self, idx: usize) {
        let filename = self.files[idx].entry.filename.clone();
        let eligible = self.config.destructive_install
            && !self.control.is_aborted()
            && self
                .prior
                .as_ref()
                .map(|(manifest, dir)| {
                    manifest.file_entry(&filename).is_some() && dir.join(&filename).exists()
                })
                .unwrap_or(false);
        if !eligible {
            self.release_active(idx);
            return;
        }

        let (Some(install), Some(install_tx)) = (&self.install, &self.install_tx) else {
            self.delete_prior_file(idx);
            return;
        };

        let current = self.tracker.current_position();
        let mut to_harvest: Vec<(ChunkId, u64)> = Vec::new();
        let mut seen: HashSet<ChunkId> = HashSet::new();
        for (id, _piece) in install.pieces_in_file(&filename) {
            if !seen.insert(*id) {
                continue;
            }
            if self.store.contains(id) || self.harvest_requested.contains(id) {
                continue;
            }
            if !install.has_chunk(id) {
                continue;
            }
            let Some(last_needed) = self.tracker.next_usage_after(id, current).map(|_| {
                self.tracker.last_usage(id).expect("future usage implies last usage")
            }) else {
                continue;
            };
            to_harvest.push((*id, last_needed));
        }

        if to_harvest.is_empty() {
            self.delete_prior_file(idx);
            return;
        }

        debug!(file = %filename, chunks = to_harvest.len(), "harvesting before deletion");
        for (id, last_needed) in to_harvest {
            self.harvest_requested.insert(id);
            let _ = install_tx.send(ReadJob::Harvest { file_index: idx, id, last_needed });
            self.files[idx].harvests_pending += 1;
        }
    }

    fn on_harvest_done(
        &mut self,
        file_index: usize,
        id: ChunkId,
        last_needed: u64,
        result: std::result::Result<bytes::Bytes, SourceError>,
    ) {
        match result {
            Ok(data) => {
                if let Err(err) = self.store.harvest(id, data, last_needed) {
                    self.fail_file(file_index, err.into());
                }
            },
            Err(err) => {
                // Harvest failure is not fatal; the chunk is refetched from
                // the network when needed.
                warn!(%id, %err, "harvest read failed; chunk flips to cloud");
                self.locations.set(id, ChunkLocation::Cloud);
            },
        }
        self.files[file_index].harvests_pending -= 1;
        if self.files[file_index].harvests_pending == 0 {
            self.delete_prior_file(file_index);
        }
    }

    fn delete_prior_file(&mut self, idx: usize) {
        let filename = self.files[idx].entry.filename.clone();
        let prior_path = self.prior.as_ref().map(|(_, dir)| dir.join(&filename));
        if let Some(path) = prior_path {
            // An aborted run keeps its sources; the next run harvests again.
            if !self.control.is_aborted() {
                self.observer.before_file_deleted(&filename);
                match std::fs::remove_file(&path) {
                    Ok(()) => info!(file = %filename, "deleted replaced prior file"),
                    Err(err) => warn!(file = %filename, %err, "failed to delete prior file"),
                }
                self.refresh_disk_gauges();
            }
        }
        self.release_active(idx);
    }

    // ---- bookkeeping ---------------------------------------------------

    fn fail_file(&mut self, idx: usize, err: ConstructionError) {
        if self.files[idx].failed.is_some() {
            return;
        }
        let benign = matches!(err, ConstructionError::Aborted);
        if !benign {
            error!(file = %self.files[idx].entry.filename, %err, "file construction failed");
            if self.first_error.is_none() {
                self.first_error = Some(err.clone());
            }
        }
        self.files[idx].failed = Some(err);
        // The first failure aborts every other in-flight file; later
        // failures find the flag already set.
        self.control.abort();
    }

    fn release_active(&mut self, idx: usize) {
        self.active.retain(|&i| i != idx);
    }

    fn output_path(&self, filename: &str) -> PathBuf {
        self.config.install_dir.join(filename)
    }

    fn check_disk_space(&mut self) -> Result<()> {
        let remaining = self.remaining_files();
        let required = required_disk_space(
            &remaining,
            self.prior.as_ref().map(|(m, _)| m.as_ref()),
            self.config.destructive_install,
        ) + self.config.disk_headroom;
        let available = available_disk_space(
            &self.config.install_dir,
            self.config.assumed_free_disk_space,
        )
        .unwrap_or(u64::MAX);
        self.counters.set_disk_free(available);
        self.counters.set_required_to_finish(required);
        if available < required {
            return Err(ConstructionError::OutOfDiskSpace { required, available });
        }
        Ok(())
    }

    fn remaining_files(&self) -> Vec<RemainingFile<'_>> {
        self.files
            .iter()
            .filter(|f| !f.skip && !f.closed)
            .map(|f| RemainingFile {
                filename: &f.entry.filename,
                bytes_to_write: f
                    .entry
                    .file_size
                    .saturating_sub(f.resumed_bytes + f.bytes_written),
            })
            .collect()
    }

    /// Refreshes the disk gauges, shrinks the spill budget to protect the
    /// remaining installation's headroom, and reposts the cloud's expected
    /// byte count.
    fn refresh_disk_gauges(&mut self) {
        let required = {
            let remaining = self.remaining_files();
            required_disk_space(
                &remaining,
                self.prior.as_ref().map(|(m, _)| m.as_ref()),
                self.config.destructive_install,
            )
        };
        let available = available_disk_space(
            &self.config.install_dir,
            self.config.assumed_free_disk_space,
        )
        .unwrap_or(u64::MAX);
        self.counters.set_required_to_finish(required);
        self.counters.set_disk_free(available);

        let spill_cap = self
            .config
            .spill_budget
            .min(available.saturating_sub(required + self.config.disk_headroom));
        self.store.set_spill_budget(spill_cap);

        self.post_cloud_requirement();
    }

    fn post_cloud_requirement(&self) {
        let Some(cloud) = &self.cloud else {
            return;
        };
        let mut bytes = 0u64;
        for file in &self.files {
            if file.skip || file.closed {
                continue;
            }
            for part in &file.entry.parts[file.next_part..] {
                match self.locations.get(&part.id) {
                    Some(ChunkLocation::Cloud) | None => bytes += part.length as u64,
                    _ => {},
                }
            }
        }
        cloud.post_required_bytes(bytes);
    }

    fn is_done(&self) -> bool {
        let batching_finished = self.batching_file >= self.files.len()
            || self.first_error.is_some()
            || self.control.is_aborted();
        batching_finished
            && self.pending_events.is_empty()
            && self.batches.is_empty()
            && self.in_flight_writes.is_empty()
            && self.active.is_empty()
    }

    async fn shutdown(mut self) -> Result<ConstructionSummary> {
        if let Some(tx) = &self.install_tx {
            let _ = tx.send(ReadJob::Shutdown);
        }
        if let Some(tx) = &self.chunkdb_tx {
            let _ = tx.send(ReadJob::Shutdown);
        }
        if let WriteBackend::Thread(tx) = &self.write_backend {
            let _ = tx.send(WriteJob::Shutdown);
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }

        let stats = self.store.stats();
        debug_assert_eq!(stats.locked_entries, 0, "drain left locked backing-store entries");
        self.counters.set_backing_store_locked(stats.locked_entries as u64);
        self.summary.store_stats = stats;

        if let Err(err) = self.store.shutdown() {
            warn!(%err, "failed to remove spill file");
        }

        match self.first_error {
            Some(err) => {
                error!(%err, "construction failed");
                Err(err)
            },
            None if self.control.is_aborted() => {
                info!("construction aborted by request");
                Err(ConstructionError::Aborted)
            },
            None => {
                info!(
                    constructed = self.summary.files_constructed,
                    resumed = self.summary.files_resumed,
                    skipped = self.summary.files_skipped,
                    bytes = self.summary.bytes_written,
                    "construction complete"
                );
                Ok(self.summary)
            },
        }
    }
}

// ---- init helpers ------------------------------------------------------

fn validate_manifest(manifest: &BuildManifest) -> Result<()> {
    for entry in &manifest.files {
        if entry.is_symlink() {
            continue;
        }
        let parts_total: u64 = entry.parts.iter().map(|p| p.length as u64).sum();
        if parts_total != entry.file_size {
            return Err(ConstructionError::MissingFileInfo(entry.filename.clone()));
        }
        for part in &entry.parts {
            let window = manifest
                .chunk_window(&part.id)
                .map_err(|_| ConstructionError::MissingFileInfo(entry.filename.clone()))?;
            if part.chunk_offset + part.length > window {
                return Err(ConstructionError::MissingFileInfo(entry.filename.clone()));
            }
        }
    }
    Ok(())
}

/// Builds one file's initial state, resolving its resume action against the
/// bytes already on disk.
fn plan_file(
    entry: &FileManifestEntry,
    config: &ConstructorConfig,
    resumable: bool,
) -> Result<FileState> {
    let path = config.install_dir.join(&entry.filename);
    let mut state = FileState {
        entry: entry.clone(),
        action: FileResumeAction::Fresh,
        skip: false,
        started: false,
        closed: false,
        finalize_sent: false,
        failed: None,
        hasher: None,
        start_part: 0,
        resumed_bytes: 0,
        next_part: 0,
        write_offset: 0,
        bytes_written: 0,
        global_base: 0,
        outstanding_batches: 0,
        harvests_pending: 0,
    };

    if entry.is_symlink() {
        // Symlinks are created at start and take no part in batching or
        // disk accounting.
        state.skip = true;
        return Ok(state);
    }

    let on_disk_size = std::fs::metadata(&path).ok().map(|m| m.len());
    let mut action =
        file_resume_action(entry, on_disk_size, resumable, config.min_resume_size);

    if action == FileResumeAction::VerifyComplete {
        // Re-hash the full-size remnant; only a match lets it stand.
        action = match hash_whole_file(&path) {
            Ok(hash) if hash == entry.file_hash => {
                state.skip = true;
                FileResumeAction::VerifyComplete
            },
            Ok(_) => {
                info!(file = %entry.filename, "complete-size remnant failed re-hash; rebuilding");
                FileResumeAction::DeleteThenFresh
            },
            Err(_) => FileResumeAction::DeleteThenFresh,
        };
    }

    if let FileResumeAction::Resume { next_part, byte_offset } = action {
        state.start_part = next_part;
        state.next_part = next_part;
        state.resumed_bytes = byte_offset;
        state.write_offset = byte_offset;
    }
    state.action = action;
    Ok(state)
}

fn take_read_result(
    result: Option<std::result::Result<bytes::Bytes, SourceError>>,
) -> Result<bytes::Bytes> {
    match result {
        Some(Ok(data)) => Ok(data),
        Some(Err(err)) => Err(ConstructionError::InternalConsistency(format!(
            "retired a failed read: {err}"
        ))),
        None => Err(ConstructionError::InternalConsistency(
            "retired a batch with an unfinished read".into(),
        )),
    }
}

fn hash_file_prefix(path: &PathBuf, prefix_len: u64, hasher: &mut Sha256) -> Result<()> {
    let mut file =
        std::fs::File::open(path).map_err(|err| ConstructionError::Serialize(Arc::new(err)))?;
    let mut remaining = prefix_len;
    let mut buffer = vec![0u8; 1024 * 1024];
    while remaining > 0 {
        let want = buffer.len().min(remaining as usize);
        let got = file
            .read(&mut buffer[..want])
            .map_err(|err| ConstructionError::Serialize(Arc::new(err)))?;
        if got == 0 {
            return Err(ConstructionError::FailedInitialSizeCheck(
                path.display().to_string(),
            ));
        }
        hasher.update(&buffer[..got]);
        remaining -= got as u64;
    }
    Ok(())
}

fn hash_whole_file(path: &PathBuf) -> std::io::Result<FileHash> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let got = file.read(&mut buffer)?;
        if got == 0 {
            break;
        }
        hasher.update(&buffer[..got]);
    }
    Ok(FileHash::from_hasher(hasher))
}
