//! 镜像错误类型
//!
//! 单文件错误在任务边界被捕获并记录为失败结果，不会中断整个运行。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// 访问目录页、元数据或文件内容时的网络/HTTP 错误
    #[error("请求失败 {url}: {message}")]
    Fetch {
        url: String,
        message: String,
        transient: bool,
    },

    #[error("大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
    SizeMismatch { expected: u64, actual: u64 },

    /// 循环引用或不合法的远程目录结构
    #[error("远程目录结构错误 {url}: {message}")]
    Structural { url: String, message: String },

    #[error("本地 IO 错误 {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("操作已取消")]
    Cancelled,

    #[error("配置错误: {0}")]
    Config(String),

    /// 完成事件中执行的命令失败
    #[error("完成命令失败: {0}")]
    Hook(String),
}

pub type Result<T, E = MirrorError> = std::result::Result<T, E>;

impl MirrorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MirrorError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn structural(url: impl Into<String>, message: impl Into<String>) -> Self {
        MirrorError::Structural {
            url: url.into(),
            message: message.into(),
        }
    }

    /// 把 reqwest 错误归类为可重试或不可重试
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        let transient = err.is_timeout()
            || err.is_connect()
            || err.is_body()
            || err.status().map_or(false, is_transient_status);
        MirrorError::Fetch {
            url: url.to_string(),
            message: err.to_string(),
            transient,
        }
    }

    pub fn from_status(url: &str, status: reqwest::StatusCode) -> Self {
        MirrorError::Fetch {
            url: url.to_string(),
            message: format!("HTTP {}", status),
            transient: is_transient_status(status),
        }
    }

    /// 是否值得重试：瞬时网络错误、本地 IO 错误和传输被截断
    pub fn is_transient(&self) -> bool {
        match self {
            MirrorError::Fetch { transient, .. } => *transient,
            MirrorError::Io { .. } => true,
            MirrorError::SizeMismatch { .. } => true,
            MirrorError::Structural { .. }
            | MirrorError::Cancelled
            | MirrorError::Config(_)
            | MirrorError::Hook(_) => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MirrorError::Fetch { .. } => ErrorKind::Fetch,
            MirrorError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            MirrorError::Structural { .. } => ErrorKind::Structural,
            MirrorError::Io { .. } => ErrorKind::Io,
            MirrorError::Cancelled => ErrorKind::Cancelled,
            MirrorError::Config(_) => ErrorKind::Config,
            MirrorError::Hook(_) => ErrorKind::Hook,
        }
    }
}

fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// 错误分类
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    SizeMismatch,
    Structural,
    Io,
    Cancelled,
    Config,
    Hook,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Fetch => write!(f, "fetch"),
            ErrorKind::SizeMismatch => write!(f, "size_mismatch"),
            ErrorKind::Structural => write!(f, "structural"),
            ErrorKind::Io => write!(f, "io"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Hook => write!(f, "hook"),
        }
    }
}

/// 可克隆、可序列化的错误记录，挂在结果和报告上
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&MirrorError> for ErrorInfo {
    fn from(err: &MirrorError) -> Self {
        ErrorInfo {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<MirrorError> for ErrorInfo {
    fn from(err: MirrorError) -> Self {
        ErrorInfo::from(&err)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
