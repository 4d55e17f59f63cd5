//! 固件存储：按文件名保存与读取二进制固件。

use md5::{Digest, Md5};
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::ErrorKind;

use crate::atomic::{is_temp_file_name, remove_temp_files, write_atomic};

#[derive(Clone, Debug)]
pub struct FirmwareStore {
    root: PathBuf,
}

impl FirmwareStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Writes or overwrites the artifact; bytes are synced before returning.
    pub async fn put(&self, filename: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let target = self.resolve(filename)?;
        self.ensure_not_symlink(&target, true).await?;
        write_atomic(&target, bytes).await?;
        Ok(())
    }

    pub async fn get(&self, filename: &str) -> Result<Vec<u8>, StoreError> {
        let target = self.existing(filename).await?;
        Ok(fs::read(target).await?)
    }

    pub async fn exists(&self, filename: &str) -> Result<bool, StoreError> {
        match self.existing(filename).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn size(&self, filename: &str) -> Result<u64, StoreError> {
        let target = self.existing(filename).await?;
        Ok(fs::metadata(target).await?.len())
    }

    /// Hex MD5 of the stored artifact. Reads the whole file into memory.
    pub async fn checksum(&self, filename: &str) -> Result<String, StoreError> {
        let bytes = self.get(filename).await?;
        Ok(md5_hex(&bytes))
    }

    /// 打开固件用于流式下载，返回文件句柄与长度。
    pub async fn open(&self, filename: &str) -> Result<(File, u64), StoreError> {
        let target = self.existing(filename).await?;
        let file = File::open(&target).await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// 清理上次异常退出时残留的临时文件。
    pub async fn remove_stale_temp_files(&self) -> io::Result<usize> {
        remove_temp_files(&self.root, None).await
    }

    async fn existing(&self, filename: &str) -> Result<PathBuf, StoreError> {
        let target = self.resolve(filename)?;
        self.ensure_not_symlink(&target, false).await?;
        match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_file() => Ok(target),
            Ok(_) => Err(StoreError::NotFound(filename.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(filename.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf, StoreError> {
        validate_filename(filename)?;
        Ok(self.root.join(filename))
    }

    async fn ensure_not_symlink(&self, target: &Path, allow_missing: bool) -> Result<(), StoreError> {
        match fs::symlink_metadata(target).await {
            Ok(metadata) if metadata.file_type().is_symlink() => Err(StoreError::InvalidName),
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if allow_missing {
                    Ok(())
                } else {
                    Err(StoreError::NotFound(
                        target
                            .file_name()
                            .map(|name| name.to_string_lossy().to_string())
                            .unwrap_or_default(),
                    ))
                }
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

/// 文件名必须是单个普通路径段，不允许目录穿越或控制字符。
pub fn validate_filename(filename: &str) -> Result<(), StoreError> {
    if filename.is_empty()
        || filename.contains(['/', '\\'])
        || filename.chars().any(char::is_control)
        || is_temp_file_name(filename)
    {
        return Err(StoreError::InvalidName);
    }
    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StoreError::InvalidName),
    }
}

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

#[derive(Debug)]
pub enum StoreError {
    InvalidName,
    NotFound(String),
    Io(io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidName => write!(f, "invalid firmware filename"),
            StoreError::NotFound(name) => write!(f, "firmware not found: {name}"),
            StoreError::Io(err) => write!(f, "firmware store io error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}
