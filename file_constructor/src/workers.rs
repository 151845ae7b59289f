use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chunk_sources::{ChunkSource, SourceError, SourceKind};
use patch_types::ChunkId;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ConstructionError;
use crate::progress::ControlHandle;

/// Work posted to a source-bound read worker.
pub(crate) enum ReadJob {
    Read { batch_seq: u64, id: ChunkId },
    /// Preserve a still-needed chunk out of a file about to be deleted.
    Harvest { file_index: usize, id: ChunkId, last_needed: u64 },
    Shutdown,
}

/// Work posted to the write worker (or executed inline).
pub(crate) enum WriteJob {
    Write {
        file_index: usize,
        path: PathBuf,
        offset: u64,
        data: Bytes,
        batch_seq: u64,
    },
    /// Flush, sync and close the output handle; optionally remove the file.
    Finalize {
        file_index: usize,
        path: PathBuf,
        discard: bool,
    },
    Shutdown,
}

/// Completion messages feeding the single-consumer dispatch loop.
pub(crate) enum Event {
    ReadDone {
        batch_seq: u64,
        id: ChunkId,
        kind: SourceKind,
        result: Result<Bytes, SourceError>,
    },
    HarvestDone {
        file_index: usize,
        id: ChunkId,
        last_needed: u64,
        result: Result<Bytes, SourceError>,
    },
    WriteDone {
        file_index: usize,
        batch_seq: u64,
        bytes: u64,
        result: Result<(), ConstructionError>,
    },
    FileClosed {
        file_index: usize,
        result: Result<(), ConstructionError>,
    },
}

/// Spawns the blocking read loop bound to one chunk source. The worker parks
/// on its job channel while idle and posts every outcome back as an event,
/// even in aborted no-I/O mode.
pub(crate) fn spawn_source_worker(
    source: Arc<dyn ChunkSource>,
    events: UnboundedSender<Event>,
    control: ControlHandle,
) -> (UnboundedSender<ReadJob>, JoinHandle<()>) {
    let (tx, mut rx): (UnboundedSender<ReadJob>, UnboundedReceiver<ReadJob>) = unbounded_channel();
    let kind = source.kind();
    let handle = tokio::task::spawn_blocking(move || {
        debug!(?kind, "source worker started");
        while let Some(job) = rx.blocking_recv() {
            match job {
                ReadJob::Shutdown => break,
                ReadJob::Read { batch_seq, id } => {
                    let result = if control.is_aborted() {
                        Err(SourceError::Aborted)
                    } else {
                        source.read_chunk(&id)
                    };
                    if events.send(Event::ReadDone { batch_seq, id, kind, result }).is_err() {
                        break;
                    }
                },
                ReadJob::Harvest { file_index, id, last_needed } => {
                    let result = if control.is_aborted() {
                        Err(SourceError::Aborted)
                    } else {
                        source.read_chunk(&id)
                    };
                    let event = Event::HarvestDone { file_index, id, last_needed, result };
                    if events.send(event).is_err() {
                        break;
                    }
                },
            }
        }
        debug!(?kind, "source worker stopped");
    });
    (tx, handle)
}

/// Output-file handles and the write execution shared by the write worker
/// thread and the inline backend.
#[derive(Default)]
pub(crate) struct WriteWorkerState {
    handles: HashMap<usize, File>,
}

impl WriteWorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes one job, returning the completion event (None for Shutdown).
    pub fn execute(&mut self, job: WriteJob, control: &ControlHandle) -> Option<Event> {
        match job {
            WriteJob::Shutdown => None,
            WriteJob::Write { file_index, path, offset, data, batch_seq } => {
                let result = if control.is_aborted() {
                    Err(ConstructionError::Aborted)
                } else {
                    self.write(file_index, &path, offset, &data)
                };
                Some(Event::WriteDone { file_index, batch_seq, bytes: data.len() as u64, result })
            },
            WriteJob::Finalize { file_index, path, discard } => {
                let result = self.finalize(file_index, &path, discard, !control.is_aborted());
                Some(Event::FileClosed { file_index, result })
            },
        }
    }

    fn write(
        &mut self,
        file_index: usize,
        path: &PathBuf,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ConstructionError> {
        use std::collections::hash_map::Entry;
        let file = match self.handles.entry(file_index) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .map_err(|err| ConstructionError::CannotCreateFile {
                        path: path.display().to_string(),
                        source: Arc::new(err),
                    })?;
                slot.insert(file)
            },
        };
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| ConstructionError::Serialize(Arc::new(err)))?;
        file.write_all(data)
            .map_err(|err| ConstructionError::Serialize(Arc::new(err)))?;
        Ok(())
    }

    fn finalize(
        &mut self,
        file_index: usize,
        path: &PathBuf,
        discard: bool,
        durable: bool,
    ) -> Result<(), ConstructionError> {
        if let Some(file) = self.handles.remove(&file_index) {
            if durable {
                file.sync_all().map_err(|err| ConstructionError::Close {
                    path: path.display().to_string(),
                    source: Arc::new(err),
                })?;
            }
        }
        if discard {
            // Missing output is fine here; it may never have been created.
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

/// Spawns the blocking write loop.
pub(crate) fn spawn_write_worker(
    events: UnboundedSender<Event>,
    control: ControlHandle,
) -> (UnboundedSender<WriteJob>, JoinHandle<()>) {
    let (tx, mut rx): (UnboundedSender<WriteJob>, UnboundedReceiver<WriteJob>) =
        unbounded_channel();
    let handle = tokio::task::spawn_blocking(move || {
        debug!("write worker started");
        let mut state = WriteWorkerState::new();
        while let Some(job) = rx.blocking_recv() {
            match state.execute(job, &control) {
                Some(event) => {
                    if events.send(event).is_err() {
                        break;
                    }
                },
                None => break,
            }
        }
        debug!("write worker stopped");
    });
    (tx, handle)
}

/// Writes either go to the dedicated worker thread or run inline on the
/// dispatch thread when no write thread is configured.
pub(crate) enum WriteBackend {
    Thread(UnboundedSender<WriteJob>),
    Inline(WriteWorkerState),
}

impl WriteBackend {
    pub fn submit(
        &mut self,
        job: WriteJob,
        control: &ControlHandle,
        pending: &mut VecDeque<Event>,
    ) {
        match self {
            WriteBackend::Thread(tx) => {
                // A closed channel means shutdown is already under way.
                let _ = tx.send(job);
            },
            WriteBackend::Inline(state) => {
                if let Some(event) = state.execute(job, control) {
                    pending.push_back(event);
                }
            },
        }
    }
}
