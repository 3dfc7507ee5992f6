//! 文件传输 - 暂存文件 + 原子替换

use crate::core::comparator::TransferReason;
use crate::core::retry::RetryPolicy;
use crate::error::{ErrorInfo, MirrorError, Result};
use crate::remote::{ContentSource, RemoteMetadata};
use futures::StreamExt;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 暂存文件后缀，下载中的内容只写到 `<目标>.mirror-part`
pub const STAGING_SUFFIX: &str = ".mirror-part";

/// 传输状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Downloaded,
    Skipped,
    Failed,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Downloaded => write!(f, "downloaded"),
            TransferStatus::Skipped => write!(f, "skipped"),
            TransferStatus::Failed => write!(f, "failed"),
        }
    }
}

/// 扫描阶段对单个文件的结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPlan {
    Transfer(TransferReason),
    Skip,
    /// 元数据获取失败（已重试）
    Failed(ErrorInfo),
}

/// 传输任务，每个任务对应唯一的目标路径
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub source_url: Url,
    /// 相对于远程根目录的路径（已解码，`/` 分隔）
    pub relative_path: String,
    pub destination: PathBuf,
    pub remote: RemoteMetadata,
    pub plan: TaskPlan,
}

/// 单个任务的最终结果
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub task: TransferTask,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    pub attempts: u32,
    pub error: Option<ErrorInfo>,
}

impl TransferOutcome {
    pub fn skipped(task: TransferTask) -> Self {
        Self {
            task,
            status: TransferStatus::Skipped,
            bytes_transferred: 0,
            elapsed: Duration::ZERO,
            attempts: 0,
            error: None,
        }
    }

    pub fn failed(task: TransferTask, error: ErrorInfo, attempts: u32, elapsed: Duration) -> Self {
        Self {
            task,
            status: TransferStatus::Failed,
            bytes_transferred: 0,
            elapsed,
            attempts,
            error: Some(error),
        }
    }
}

/// 暂存路径：目标文件名加上 [`STAGING_SUFFIX`]
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(STAGING_SUFFIX);
    destination.with_file_name(name)
}

/// 下载器
pub struct Downloader {
    source: Arc<dyn ContentSource>,
    retry: RetryPolicy,
}

impl Downloader {
    pub fn new(source: Arc<dyn ContentSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    /// 执行一个传输任务（含重试），总是返回一个结果
    pub async fn transfer(&self, task: TransferTask, cancel: &CancellationToken) -> TransferOutcome {
        let start = Instant::now();
        let what = format!("下载 {}", task.source_url);

        let task_ref = &task;
        let attempted = self
            .retry
            .run(&what, cancel, move || self.transfer_once(task_ref, cancel))
            .await;

        let elapsed = start.elapsed();
        match attempted.result {
            Ok(bytes) => {
                info!(
                    "下载完成: {} -> {} ({} 字节, {:.2}s)",
                    task.source_url,
                    task.destination.display(),
                    bytes,
                    elapsed.as_secs_f64()
                );
                TransferOutcome {
                    task,
                    status: TransferStatus::Downloaded,
                    bytes_transferred: bytes,
                    elapsed,
                    attempts: attempted.attempts,
                    error: None,
                }
            }
            Err(e) => {
                warn!("下载失败: {} - {}", task.source_url, e);
                TransferOutcome::failed(task, ErrorInfo::from(&e), attempted.attempts, elapsed)
            }
        }
    }

    /// 单次尝试：写暂存文件，校验大小，重命名覆盖目标，设置修改时间
    async fn transfer_once(&self, task: &TransferTask, cancel: &CancellationToken) -> Result<u64> {
        let destination = &task.destination;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MirrorError::io(parent, e))?;
        }

        let staging = staging_path(destination);
        // 任何提前返回（包括 future 被丢弃）都会删除暂存文件
        let guard = scopeguard::guard(staging, |p| {
            let _ = std::fs::remove_file(&p);
        });

        let mut stream = self.source.open(&task.source_url).await?;
        let mut file = tokio::fs::File::create(&*guard)
            .await
            .map_err(|e| MirrorError::io(&*guard, e))?;

        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
                next = stream.next() => next,
            };
            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| MirrorError::io(&*guard, e))?;
            written += chunk.len() as u64;

            if let Some(expected) = task.remote.size {
                if written > expected {
                    return Err(MirrorError::SizeMismatch {
                        expected,
                        actual: written,
                    });
                }
            }
        }

        file.flush().await.map_err(|e| MirrorError::io(&*guard, e))?;
        file.sync_all().await.map_err(|e| MirrorError::io(&*guard, e))?;
        drop(file);

        if let Some(expected) = task.remote.size {
            if written != expected {
                return Err(MirrorError::SizeMismatch {
                    expected,
                    actual: written,
                });
            }
        }

        // 同一文件系统内 rename 会原子地替换旧文件
        tokio::fs::rename(&*guard, destination)
            .await
            .map_err(|e| MirrorError::io(destination, e))?;
        scopeguard::ScopeGuard::into_inner(guard);

        if let Some(modified) = task.remote.last_modified {
            let mtime = filetime::FileTime::from_system_time(modified.into());
            if let Err(e) = filetime::set_file_mtime(destination, mtime) {
                // 内容已经就位，只影响下次的时间比较
                warn!("设置修改时间失败: {} - {}", destination.display(), e);
            }
        }

        debug!("写入完成: {} ({} 字节)", destination.display(), written);
        Ok(written)
    }
}

/// 删除上次异常退出遗留的暂存文件，返回删除数量
pub async fn sweep_staging_files(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let root_path = root.to_path_buf();
    let removed = tokio::task::spawn_blocking(move || {
        WalkDir::new(&root_path)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry
                        .file_name()
                        .to_str()
                        .map_or(false, |name| name.ends_with(STAGING_SUFFIX))
            })
            .filter(|entry| match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("删除遗留暂存文件: {}", entry.path().display());
                    true
                }
                Err(e) => {
                    warn!("无法删除暂存文件 {}: {}", entry.path().display(), e);
                    false
                }
            })
            .count()
    })
    .await
    .map_err(|e| MirrorError::io(root, std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    if removed > 0 {
        info!("清理了 {} 个遗留暂存文件", removed);
    }
    Ok(removed)
}
