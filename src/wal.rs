use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::limits::WAL_CHANNEL_CAPACITY;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL writer shut down")]
    Closed,
    #[error("WAL I/O: {0}")]
    Io(#[from] io::Error),
}

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record<E: Serialize>(writer: &mut impl Write, record: &E) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one little-endian u32, `None` on a clean or truncated end of file.
fn read_u32(reader: &mut impl Read) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(u32::from_le_bytes(buf))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Append-only Write-Ahead Log of `E` records.
///
/// Format per entry: `[u32: len][bincode: E][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal<E> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _records: PhantomData<fn(E)>,
}

impl<E: Serialize + DeserializeOwned> Wal<E> {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _records: PhantomData,
        })
    }

    /// Append and fsync a single record. Production code batches through `WalWriter`.
    #[cfg(test)]
    pub fn append(&mut self, record: &E) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Append a record to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, record: &E) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as exactly `records`: temp file, fsync, atomic rename, reopen.
    pub fn compact(&mut self, records: &[E]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                encode_record(&mut writer, record)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay the WAL from disk, returning all valid records.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<E>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        while let Some(len) = read_u32(&mut reader)? {
            let mut payload = vec![0u8; len as usize];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let Some(stored_crc) = read_u32(&mut reader)? else {
                break;
            };
            if stored_crc != crc32fast::hash(&payload) {
                break;
            }
            match bincode::deserialize::<E>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }

        Ok(records)
    }
}

// ── Group-commit writer ──────────────────────────────────

enum WalCommand<E> {
    Append {
        record: E,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<E>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    /// Stop the writer task; later appends fail with `WalError::Closed`.
    #[cfg(test)]
    Close,
}

/// Handle to a background task that owns a `Wal` and batches appends.
///
/// Appends that arrive while a flush is pending share a single fsync. `append`
/// returns only after the record is durable.
pub struct WalWriter<E> {
    tx: mpsc::Sender<WalCommand<E>>,
}

impl<E> Clone for WalWriter<E> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<E> WalWriter<E>
where
    E: Serialize + DeserializeOwned + Send + 'static,
{
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(wal: Wal<E>) -> Self {
        let (tx, rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    pub async fn append(&self, record: E) -> Result<(), WalError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append { record, response: tx })
            .await
            .map_err(|_| WalError::Closed)?;
        rx.await.map_err(|_| WalError::Closed)?.map_err(WalError::from)
    }

    pub async fn compact(&self, records: Vec<E>) -> Result<(), WalError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| WalError::Closed)?;
        rx.await.map_err(|_| WalError::Closed)?.map_err(WalError::from)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) async fn close(&self) {
        let _ = self.tx.send(WalCommand::Close).await;
    }
}

/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch, then answer every sender.
async fn writer_loop<E>(mut wal: Wal<E>, mut rx: mpsc::Receiver<WalCommand<E>>)
where
    E: Serialize + DeserializeOwned,
{
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { record, response } => vec![(record, response)],
            #[cfg(test)]
            WalCommand::Close => break,
            other => {
                handle_other(&mut wal, other);
                continue;
            }
        };

        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(other) = deferred {
            #[cfg(test)]
            if matches!(other, WalCommand::Close) {
                break;
            }
            handle_other(&mut wal, other);
        }
    }
}

fn flush_batch<E>(wal: &mut Wal<E>, batch: &[(E, oneshot::Sender<io::Result<()>>)]) -> io::Result<()>
where
    E: Serialize + DeserializeOwned,
{
    let mut append_err = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_other<E>(wal: &mut Wal<E>, cmd: WalCommand<E>)
where
    E: Serialize + DeserializeOwned,
{
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = wal.compact(&records);
            if let Err(e) = &result {
                tracing::error!("compaction of {} failed: {e}", wal.path().display());
            }
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
        #[cfg(test)]
        WalCommand::Close => {}
    }
}
