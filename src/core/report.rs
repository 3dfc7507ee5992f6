//! 同步报告

use crate::core::scanner::WalkError;
use crate::core::transfer::{TransferOutcome, TransferStatus};
use crate::error::ErrorInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 失败任务记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedTransfer {
    pub url: String,
    pub destination: PathBuf,
    pub error: ErrorInfo,
}

/// 一次运行的汇总，由所有任务结果折叠而来
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 实际写入的本地根目录（启用日期子目录时包含日期）
    pub local_root: PathBuf,
    pub total_discovered: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub cancelled: bool,
    pub failures: Vec<FailedTransfer>,
    pub walk_errors: Vec<WalkError>,
}

impl SyncReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            finished_at: started_at,
            local_root: PathBuf::new(),
            total_discovered: 0,
            downloaded: 0,
            skipped: 0,
            failed: 0,
            bytes_transferred: 0,
            duration: Duration::ZERO,
            cancelled: false,
            failures: Vec::new(),
            walk_errors: Vec::new(),
        }
    }

    /// 累加一个任务结果
    pub fn record(&mut self, outcome: TransferOutcome) {
        self.total_discovered += 1;
        match outcome.status {
            TransferStatus::Downloaded => {
                self.downloaded += 1;
                self.bytes_transferred += outcome.bytes_transferred;
            }
            TransferStatus::Skipped => self.skipped += 1,
            TransferStatus::Failed => {
                self.failed += 1;
                let error = outcome.error.unwrap_or_else(|| ErrorInfo {
                    kind: crate::error::ErrorKind::Io,
                    message: "未知错误".to_string(),
                });
                self.failures.push(FailedTransfer {
                    url: outcome.task.source_url.to_string(),
                    destination: outcome.task.destination,
                    error,
                });
            }
        }
    }

    /// 记录结束时间
    pub fn finish(&mut self, cancelled: bool) {
        self.finished_at = Utc::now();
        self.duration = (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default();
        self.cancelled = cancelled;
        self.failures.sort_by(|a, b| a.destination.cmp(&b.destination));
    }

    /// 有失败的文件或子树
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || !self.walk_errors.is_empty()
    }

    /// 人类可读的摘要
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "共 {} 个文件: 下载 {}, 跳过 {}, 失败 {}, 传输 {}, 耗时 {:.1}s",
            self.total_discovered,
            self.downloaded,
            self.skipped,
            self.failed,
            format_bytes(self.bytes_transferred),
            self.duration.as_secs_f64()
        )];

        if self.cancelled {
            lines.push("运行已取消".to_string());
        }
        for failure in &self.failures {
            lines.push(format!("  失败: {} -> {}", failure.url, failure.error));
        }
        for walk_error in &self.walk_errors {
            lines.push(format!("  目录错误: {} -> {}", walk_error.url, walk_error.error));
        }
        lines
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
