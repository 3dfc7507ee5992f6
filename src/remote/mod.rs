pub mod http;
pub mod listing;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub use http::{HttpRemote, HttpRemoteConfig};
pub use listing::parse_listing;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- 目录页、HEAD 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- 文件内容下载
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 目录页中的一个子条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// 最后一段路径（仍为 URL 编码形式，不含结尾的 `/`）
    pub name: String,
    pub is_dir: bool,
    pub url: Url,
}

/// 远程文件元数据，字段缺失表示"未知"而不是零
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

impl RemoteMetadata {
    /// 三个字段都未知
    pub fn is_unknown(&self) -> bool {
        self.size.is_none() && self.last_modified.is_none() && self.etag.is_none()
    }
}

/// 文件内容的字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// 列出目录页
#[async_trait]
pub trait ListingClient: Send + Sync {
    async fn list(&self, dir_url: &Url) -> Result<Vec<RemoteEntry>>;
}

/// 只取元数据，不传输内容
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn probe(&self, file_url: &Url) -> Result<RemoteMetadata>;
}

/// 打开文件内容流
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn open(&self, file_url: &Url) -> Result<ByteStream>;
}

/// 判断 `child` 是否位于目录 `dir` 之下（同源且路径前缀匹配）
pub fn is_beneath(dir: &Url, child: &Url) -> bool {
    dir.scheme() == child.scheme()
        && dir.host_str() == child.host_str()
        && dir.port_or_known_default() == child.port_or_known_default()
        && child.path().len() > dir.path().len()
        && child.path().starts_with(dir.path())
}

/// 目录 URL 的规范形式：去掉查询和片段，路径以 `/` 结尾
pub fn canonical_dir_url(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
