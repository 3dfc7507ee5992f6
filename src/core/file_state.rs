//! 本地文件状态 - 用于增量判断

use crate::error::{MirrorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// 内容哈希算法
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha256,
    Blake3,
}

/// 本地文件状态
#[derive(Debug, Clone)]
pub struct LocalFileState {
    pub path: PathBuf,
    pub exists: bool,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    /// 惰性计算，只有比较 ETag 时才读取文件内容
    content_hash: Option<(HashAlgorithm, String)>,
}

impl LocalFileState {
    /// 不存在的文件
    pub fn absent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            exists: false,
            size: 0,
            modified_time: DateTime::<Utc>::from(UNIX_EPOCH),
            content_hash: None,
        }
    }

    /// 已知大小和修改时间的文件（不访问磁盘）
    pub fn present(path: impl Into<PathBuf>, size: u64, modified_time: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            exists: true,
            size,
            modified_time,
            content_hash: None,
        }
    }

    /// 预先填入内容哈希
    pub fn with_hash(mut self, algorithm: HashAlgorithm, hash: impl Into<String>) -> Self {
        self.content_hash = Some((algorithm, hash.into()));
        self
    }

    /// 从文件系统读取当前状态
    pub async fn read(path: &Path) -> Result<Self> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => {
                if metadata.is_dir() {
                    return Err(MirrorError::io(
                        path,
                        io::Error::new(io::ErrorKind::Other, "目标位置是一个目录"),
                    ));
                }
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| DateTime::<Utc>::from(UNIX_EPOCH));
                Ok(Self::present(path, metadata.len(), modified))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::absent(path)),
            Err(e) => Err(MirrorError::io(path, e)),
        }
    }

    /// 获取内容哈希，首次调用时读取整个文件
    pub async fn content_hash(&mut self, algorithm: HashAlgorithm) -> Result<&str> {
        let cached = matches!(&self.content_hash, Some((algo, _)) if *algo == algorithm);
        if !cached {
            let path = self.path.clone();
            let hash = tokio::task::spawn_blocking(move || hash_file(&path, algorithm))
                .await
                .map_err(|e| MirrorError::io(&self.path, io::Error::new(io::ErrorKind::Other, e)))?
                .map_err(|e| MirrorError::io(&self.path, e))?;
            self.content_hash = Some((algorithm, hash));
        }
        Ok(self
            .content_hash
            .as_ref()
            .map(|(_, hash)| hash.as_str())
            .unwrap_or_default())
    }
}

/// 流式计算文件哈希，返回小写十六进制
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; 64 * 1024];

    match algorithm {
        HashAlgorithm::Md5 => {
            let mut ctx = md5::Context::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                ctx.consume(&buffer[..n]);
            }
            Ok(format!("{:x}", ctx.compute()))
        }
        HashAlgorithm::Sha256 => {
            let mut hasher = sha2::Sha256::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(to_hex(&hasher.finalize()))
        }
        HashAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hasher.finalize().to_hex().to_string())
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
