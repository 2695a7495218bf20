//! Append-only file.
//!
//! Every mutating request is appended in its wire encoding, so the file is
//! just a concatenation of RESP arrays and needs no framing of its own. A
//! background task fsyncs the file on a fixed period; writes are handed to
//! the OS before `append` returns, so a crash loses at most one period of
//! un-synced data.
//!
//! All operations, the periodic fsync included, take the same async mutex for
//! their full duration. Concurrent appends therefore land in the file in the
//! order they acquired the lock.

use std::{
    fmt,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt, BufReader},
    select,
    sync::{Mutex, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::resp::{self, DecodeError, Value};

pub const DEFAULT_FSYNC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AofError {
    #[error("append-only file is closed")]
    Closed,
    #[error("append-only file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record {record} of the append-only file is corrupt: {source}")]
    Corrupt {
        record: usize,
        #[source]
        source: DecodeError,
    },
    #[error("record {record} of the append-only file could not be applied: {reason}")]
    Apply { record: usize, reason: String },
}

// `None` once the file has been closed.
type SharedFile = Arc<Mutex<Option<File>>>;

pub struct Aof {
    path: PathBuf,
    file: SharedFile,
    flusher: parking_lot::Mutex<Option<Flusher>>,
}

struct Flusher {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Aof {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AofError> {
        Self::open_with_interval(path, DEFAULT_FSYNC_INTERVAL).await
    }

    /// Opens (creating if needed) the file at `path` and starts the fsync
    /// task. Must be called from within a tokio runtime.
    pub async fn open_with_interval(
        path: impl AsRef<Path>,
        fsync_interval: Duration,
    ) -> Result<Self, AofError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;
        let file: SharedFile = Arc::new(Mutex::new(Some(file)));

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_flusher(Arc::clone(&file), fsync_interval, shutdown_rx));
        debug!(path = %path.display(), ?fsync_interval, "opened append-only file");

        Ok(Self {
            path,
            file,
            flusher: parking_lot::Mutex::new(Some(Flusher { shutdown, task })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one request in its wire encoding.
    pub async fn append(&self, request: &Value) -> Result<(), AofError> {
        let encoded = request.encode();
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(AofError::Closed)?;
        file.write_all(&encoded).await?;
        // Waits for tokio's background write to reach the OS.
        file.flush().await?;
        Ok(())
    }

    /// Feeds every record, oldest first, to `apply`.
    ///
    /// Stops at the first record that fails to decode or apply. Returns the
    /// number of records applied.
    pub async fn replay<F, E>(&self, mut apply: F) -> Result<usize, AofError>
    where
        F: FnMut(Value) -> Result<(), E>,
        E: fmt::Display,
    {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(AofError::Closed)?;
        file.seek(SeekFrom::Start(0)).await?;

        let mut reader = BufReader::new(file);
        let mut applied = 0;
        loop {
            match resp::read_value(&mut reader).await {
                Ok(Some(record)) => {
                    apply(record).map_err(|err| AofError::Apply {
                        record: applied,
                        reason: format!("{err:#}"),
                    })?;
                    applied += 1;
                }
                Ok(None) => {
                    warn!(record = applied, "skipping unrecognised byte in append-only file");
                }
                Err(err) if err.is_end_of_stream() => break,
                Err(source) => {
                    return Err(AofError::Corrupt {
                        record: applied,
                        source,
                    })
                }
            }
        }

        debug!(path = %self.path.display(), records = applied, "replayed append-only file");
        Ok(applied)
    }

    /// Stops the fsync task, then flushes, syncs and releases the file.
    pub async fn close(&self) -> Result<(), AofError> {
        self.stop_flusher().await;

        let mut guard = self.file.lock().await;
        let mut file = guard.take().ok_or(AofError::Closed)?;
        file.flush().await?;
        file.sync_all().await?;
        debug!(path = %self.path.display(), "closed append-only file");
        Ok(())
    }

    async fn stop_flusher(&self) {
        let flusher = self.flusher.lock().take();
        if let Some(Flusher { shutdown, task }) = flusher {
            let _ = shutdown.send(());
            if let Err(err) = task.await {
                warn!(error = %err, "fsync task ended abnormally");
            }
        }
    }
}

impl fmt::Debug for Aof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aof").field("path", &self.path).finish()
    }
}

// Exits on the shutdown signal, when the sender is dropped along with its
// `Aof`, or once the file has been closed.
async fn run_flusher(file: SharedFile, period: Duration, mut shutdown: oneshot::Receiver<()>) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;

    loop {
        select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let mut guard = file.lock().await;
                let Some(handle) = guard.as_mut() else {
                    break;
                };
                if let Err(err) = handle.sync_data().await {
                    warn!(error = %err, "periodic fsync of append-only file failed");
                }
            }
        }
    }

    debug!("fsync task stopped");
}
