use std::path::PathBuf;

const DEFAULT_BATCH_SIZE: usize = 4 * 1024 * 1024;
const DEFAULT_IO_BUFFER_SIZE: usize = 32 * 1024 * 1024;
const DEFAULT_MEMORY_BUDGET: u64 = 256 * 1024 * 1024;
const DEFAULT_SPILL_BUDGET: u64 = 1024 * 1024 * 1024;
const DEFAULT_MAX_ACTIVE_FILES: usize = 4;
const DEFAULT_CLOUD_CONCURRENCY: usize = 8;
const DEFAULT_CLOUD_MAX_ATTEMPTS: usize = 4;

/// Tunables for one construction run, passed at construction.
#[derive(Clone, Debug)]
pub struct ConstructorConfig {
    /// Directory the new build's files are written into.
    pub install_dir: PathBuf,
    /// Metadata directory holding the resume marker.
    pub staging_dir: PathBuf,
    /// Directory for the ephemeral chunk spill file.
    pub spill_dir: PathBuf,

    /// Upper bound on one batch's bytes. Raised at run start to the largest
    /// chunk in the job so a batch can always hold at least one whole chunk.
    pub batch_size: usize,
    /// Capacity of the shared I/O buffer arena. Raised at run start to the
    /// effective batch size.
    pub io_buffer_size: usize,

    /// Memory budget for the chunk backing store. A soft ceiling: see
    /// `ChunkBackingStore::reserve_and_lock`.
    pub memory_budget: u64,
    /// Byte budget for the disk spill file, before headroom shrinks it.
    pub spill_budget: u64,

    /// How many files may be in flight (reading/writing/verifying) at once.
    pub max_active_files: usize,
    /// Run writes on a dedicated worker thread; when false they run inline
    /// on the dispatch thread.
    pub use_write_thread: bool,

    /// Delete each prior-install file once the file replacing it completes,
    /// harvesting still-needed chunks first.
    pub destructive_install: bool,

    pub resume_enabled: bool,
    /// Files smaller than this are never resumed, only restarted.
    pub min_resume_size: u64,

    /// Extra free space to keep untouched on top of computed requirements.
    pub disk_headroom: u64,
    /// Overrides the free-space query; used by tests and dry runs.
    pub assumed_free_disk_space: Option<u64>,

    pub cloud_concurrency: usize,
    pub cloud_max_attempts: usize,
}

impl ConstructorConfig {
    pub fn new(install_dir: PathBuf, staging_dir: PathBuf, spill_dir: PathBuf) -> Self {
        Self {
            install_dir,
            staging_dir,
            spill_dir,
            batch_size: DEFAULT_BATCH_SIZE,
            io_buffer_size: DEFAULT_IO_BUFFER_SIZE,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            spill_budget: DEFAULT_SPILL_BUDGET,
            max_active_files: DEFAULT_MAX_ACTIVE_FILES,
            use_write_thread: true,
            destructive_install: false,
            resume_enabled: true,
            min_resume_size: 0,
            disk_headroom: 0,
            assumed_free_disk_space: None,
            cloud_concurrency: DEFAULT_CLOUD_CONCURRENCY,
            cloud_max_attempts: DEFAULT_CLOUD_MAX_ATTEMPTS,
        }
    }

    pub fn with_batch_size(mut self, bytes: usize) -> Self {
        self.batch_size = bytes.max(1);
        self
    }

    pub fn with_io_buffer_size(mut self, bytes: usize) -> Self {
        self.io_buffer_size = bytes.max(1);
        self
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_spill_budget(mut self, bytes: u64) -> Self {
        self.spill_budget = bytes;
        self
    }

    pub fn with_max_active_files(mut self, count: usize) -> Self {
        self.max_active_files = count.max(1);
        self
    }

    pub fn with_write_thread(mut self, enabled: bool) -> Self {
        self.use_write_thread = enabled;
        self
    }

    pub fn with_destructive_install(mut self, enabled: bool) -> Self {
        self.destructive_install = enabled;
        self
    }

    pub fn with_resume(mut self, enabled: bool) -> Self {
        self.resume_enabled = enabled;
        self
    }

    pub fn with_min_resume_size(mut self, bytes: u64) -> Self {
        self.min_resume_size = bytes;
        self
    }

    pub fn with_disk_headroom(mut self, bytes: u64) -> Self {
        self.disk_headroom = bytes;
        self
    }

    pub fn with_assumed_free_disk_space(mut self, bytes: u64) -> Self {
        self.assumed_free_disk_space = Some(bytes);
        self
    }

    pub fn with_cloud_concurrency(mut self, permits: usize) -> Self {
        self.cloud_concurrency = permits.max(1);
        self
    }

    pub fn with_cloud_max_attempts(mut self, attempts: usize) -> Self {
        self.cloud_max_attempts = attempts.max(1);
        self
    }
}
