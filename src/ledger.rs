//! 固件元数据台账：每次上传追加一行，下载时更新最新一行的计数。
//!
//! 台账以带表头的 CSV 文件持久化。所有修改都在同一把互斥锁内完成，
//! 并通过临时文件 + rename 整体替换，读取方不会看到写到一半的文件。

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::atomic::{remove_temp_files, write_atomic};

pub const LEDGER_HEADER: [&str; 6] = [
    "timestamp",
    "version",
    "filename",
    "size_bytes",
    "md5_hash",
    "download_count",
];

/// One upload event. Field order matches [`LEDGER_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: String,
    pub version: String,
    pub filename: String,
    pub size_bytes: u64,
    pub md5_hash: String,
    pub download_count: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    /// filename -> row of its most recent entry
    latest: HashMap<String, usize>,
}

impl LedgerState {
    fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        let latest = entries
            .iter()
            .enumerate()
            .map(|(row, entry)| (entry.filename.clone(), row))
            .collect();
        Self { entries, latest }
    }

    /// 追加一行，返回该文件名此前的最新行号以便回滚。
    fn push(&mut self, entry: LedgerEntry) -> Option<usize> {
        let row = self.entries.len();
        let previous = self.latest.insert(entry.filename.clone(), row);
        self.entries.push(entry);
        previous
    }

    fn undo_push(&mut self, previous: Option<usize>) {
        let Some(entry) = self.entries.pop() else {
            return;
        };
        match previous {
            Some(row) => {
                self.latest.insert(entry.filename, row);
            }
            None => {
                self.latest.remove(&entry.filename);
            }
        }
    }
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// 打开台账文件，不存在（或为空）时写入表头。可在每次启动时重复调用。
    pub async fn initialize(path: PathBuf) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        sweep_stale_temp_files(&path).await;

        let entries = match fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => decode_entries(&bytes)?,
            Ok(_) => {
                write_atomic(&path, &encode_entries(&[])?).await?;
                Vec::new()
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                write_atomic(&path, &encode_entries(&[])?).await?;
                info!(path = ?path, "created firmware ledger");
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };

        info!(path = ?path, entries = entries.len(), "firmware ledger loaded");
        Ok(Self {
            path,
            state: Mutex::new(LedgerState::from_entries(entries)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a new upload with `download_count = 0`. Never deduplicates.
    pub async fn append(
        &self,
        filename: &str,
        size_bytes: u64,
        md5_hash: &str,
        version: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            timestamp: now_timestamp(),
            version: version.to_string(),
            filename: filename.to_string(),
            size_bytes,
            md5_hash: md5_hash.to_string(),
            download_count: 0,
        };

        let mut state = self.state.lock().await;
        let previous = state.push(entry.clone());
        if let Err(err) = self.persist(&state.entries).await {
            state.undo_push(previous);
            return Err(err);
        }
        debug!(filename, rows = state.entries.len(), "ledger entry appended");
        Ok(entry)
    }

    /// Bumps the counter of the most recent entry for `filename`.
    ///
    /// Returns the new count, or `None` when the filename has no entry.
    pub async fn increment_download_count(&self, filename: &str) -> Result<Option<u64>, LedgerError> {
        let mut state = self.state.lock().await;
        let Some(&row) = state.latest.get(filename) else {
            warn!(filename, "download of firmware without ledger entry");
            return Ok(None);
        };

        state.entries[row].download_count += 1;
        let count = state.entries[row].download_count;
        if let Err(err) = self.persist(&state.entries).await {
            state.entries[row].download_count -= 1;
            return Err(err);
        }
        Ok(Some(count))
    }

    /// 按文件顺序返回全部记录的快照。
    pub async fn list_all(&self) -> Vec<LedgerEntry> {
        self.state.lock().await.entries.clone()
    }

    async fn persist(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let contents = encode_entries(entries)?;
        write_atomic(&self.path, &contents).await?;
        Ok(())
    }
}

/// 清理台账上次改写中断时遗留的临时文件，失败只记录日志。
async fn sweep_stale_temp_files(path: &Path) {
    let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned()) else {
        return;
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if let Err(err) = remove_temp_files(dir, Some(&name)).await {
        warn!(dir = ?dir, error = %err, "failed to sweep ledger temp files");
    }
}

fn now_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn decode_entries(bytes: &[u8]) -> Result<Vec<LedgerEntry>, LedgerError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    reader
        .deserialize::<LedgerEntry>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(LedgerError::from)
}

fn encode_entries(entries: &[LedgerEntry]) -> Result<Vec<u8>, LedgerError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(LEDGER_HEADER)?;
    for entry in entries {
        writer.serialize(entry)?;
    }
    writer
        .into_inner()
        .map_err(|err| LedgerError::Io(err.into_error()))
}

#[derive(Debug)]
pub enum LedgerError {
    Csv(csv::Error),
    Io(io::Error),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Csv(err) => write!(f, "ledger format error: {err}"),
            LedgerError::Io(err) => write!(f, "ledger io error: {err}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<csv::Error> for LedgerError {
    fn from(err: csv::Error) -> Self {
        LedgerError::Csv(err)
    }
}

impl From<io::Error> for LedgerError {
    fn from(err: io::Error) -> Self {
        LedgerError::Io(err)
    }
}
