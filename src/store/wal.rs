use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::model::Record;

use super::StoreError;

/// Frames longer than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn encode_frame(writer: &mut impl Write, record: &Record) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// `Ok(false)` on a clean or torn end of file.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next valid frame, or `None` at end of log / first damaged frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Record>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Record>(&payload).ok())
}

/// Append-only log of accepted record writes.
///
/// Frame layout: `[u32 len][bincode Record][u32 crc32]`. Replay keeps the
/// last frame per key; a torn or corrupt tail ends replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, record: &Record) -> io::Result<()> {
        encode_frame(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

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

    /// Rewrite the log as exactly `records`: temp file, fsync, rename, reopen.
    pub fn compact(&mut self, records: &[Record]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                encode_frame(&mut writer, record)?;
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

    /// All intact frames in write order. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        while let Some(record) = read_frame(&mut reader)? {
            records.push(record);
        }
        Ok(records)
    }
}

// ── Group-commit writer ──────────────────────────────────────────

enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = Vec<(Record, oneshot::Sender<io::Result<()>>)>;

/// Owns the WAL; batches every append that is already queued into one fsync.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (record, response) = match cmd {
            WalCommand::Append { record, response } => (record, response),
            other => {
                handle_other(&mut wal, other);
                continue;
            }
        };
        let mut batch: Pending = vec![(record, response)];
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
        let started = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        for (_, tx) in batch.drain(..) {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_other(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &Pending) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record));
    // Flush even after a failed append so stray bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_other(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let _ = response.send(wal.compact(&records));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let _ = response.send(wal.append_buffered(&record).and_then(|()| wal.flush_sync()));
        }
    }
}

/// Cloneable sender side of the writer task.
#[derive(Clone)]
pub(super) struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
}

impl WalHandle {
    pub(super) fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tracing::info!("WAL writer started for {}", wal.path().display());
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    pub(super) async fn append(&self, record: &Record) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub(super) async fn compact(&self, records: Vec<Record>) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub(super) async fn appends_since_compact(&self) -> u64 {
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
}
