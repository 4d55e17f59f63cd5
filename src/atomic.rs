//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// Marker embedded in temp file names, used to recognise leftovers.
pub const TEMP_MARKER: &str = ".tmp.";

/// 可用于原子替换的临时文件封装。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_name = format!(".{base}{TEMP_MARKER}{}", Uuid::new_v4());
        let temp_path = parent.join(temp_name);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并原子替换目标文件。
    pub async fn finalize(self) -> io::Result<()> {
        self.file.sync_all().await?;
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok() {
                    fs::rename(&self.temp_path, &self.target).await?;
                } else {
                    let _ = fs::remove_file(&self.temp_path).await;
                    return Err(err);
                }
            }
            #[cfg(not(windows))]
            {
                let _ = fs::remove_file(&self.temp_path).await;
                return Err(err);
            }
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

/// 将完整内容写入临时文件后替换目标，读者只会看到旧内容或新内容。
pub async fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut atomic = AtomicFile::new(target).await?;
    if let Err(err) = atomic.file_mut().write_all(contents).await {
        atomic.cleanup().await;
        return Err(err);
    }
    atomic.finalize().await
}

/// 判断文件名是否为未完成的原子写入遗留的临时文件。
pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

/// 清理目录中未完成的原子写入遗留的临时文件。
///
/// 指定 `target` 时只删除该文件名对应的临时文件，目录中其他文件不受影响。
pub async fn remove_temp_files(dir: &Path, target: Option<&str>) -> io::Result<usize> {
    let prefix = target.map(|name| format!(".{name}{TEMP_MARKER}"));
    let mut entries = fs::read_dir(dir).await?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !is_temp_file_name(&name)
            || !prefix.as_deref().is_none_or(|prefix| name.starts_with(prefix))
        {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path).await {
            Ok(()) => {
                removed += 1;
                info!(path = ?path, "removed stale temp file");
            }
            Err(err) => warn!(path = ?path, error = %err, "failed to remove stale temp file"),
        }
    }
    Ok(removed)
}

#[cfg(unix)]
async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_atomic_replaces_existing_file() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("fw.bin");
        std::fs::write(&target, b"old contents").expect("seed file");

        write_atomic(&target, b"new").await.expect("write atomic");

        assert_eq!(std::fs::read(&target).expect("read"), b"new");
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| is_temp_file_name(&entry.file_name().to_string_lossy()))
            .collect();
        assert!(leftovers.is_empty(), "temp file should be renamed away");
    }

    #[tokio::test]
    async fn cleanup_removes_temp_file() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("fw.bin");
        let atomic = AtomicFile::new(&target).await.expect("create temp");
        atomic.cleanup().await;

        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn remove_temp_files_honours_target_name() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path();
        std::fs::write(dir.join(".ledger.csv.tmp.1"), b"partial").expect("write temp");
        std::fs::write(dir.join(".other.csv.tmp.2"), b"partial").expect("write temp");
        std::fs::write(dir.join("ledger.csv"), b"keep").expect("write target");

        let removed = remove_temp_files(dir, Some("ledger.csv"))
            .await
            .expect("sweep");

        assert_eq!(removed, 1);
        assert!(!dir.join(".ledger.csv.tmp.1").exists());
        assert!(dir.join(".other.csv.tmp.2").exists());
        assert!(dir.join("ledger.csv").exists());
    }

    #[test]
    fn recognises_temp_names() {
        assert!(is_temp_file_name(".fw.bin.tmp.6f1c"));
        assert!(!is_temp_file_name("fw.bin"));
        assert!(!is_temp_file_name(".hidden.bin"));
    }
}
