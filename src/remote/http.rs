use super::{
    parse_listing, ByteStream, ContentSource, ListingClient, MetadataProbe, RemoteEntry,
    RemoteMetadata, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use crate::error::{MirrorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, ETAG, LAST_MODIFIED, RANGE,
};
use reqwest::{Client, Method, StatusCode, Url};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// HTTP 客户端配置
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    pub user_agent: String,
    /// 每个请求都携带的静态请求头
    pub headers: BTreeMap<String, String>,
    pub connect_timeout: Duration,
    /// 目录页和 HEAD 请求的超时
    pub op_timeout: Duration,
    /// 单个文件下载的超时
    pub io_timeout: Duration,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("mirrortools/{}", env!("CARGO_PKG_VERSION")),
            headers: BTreeMap::new(),
            connect_timeout: Duration::from_secs(30),
            op_timeout: Duration::from_secs(OP_TIMEOUT_SECS),
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
        }
    }
}

/// 基于 reqwest 的远程端实现，三个能力共用一个连接池
pub struct HttpRemote {
    client: Client,
    config: HttpRemoteConfig,
}

impl HttpRemote {
    pub fn new(config: HttpRemoteConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| MirrorError::Config(format!("无效的请求头名称 {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| MirrorError::Config(format!("无效的请求头值 {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| MirrorError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self { client, config })
    }

    async fn send(&self, method: Method, url: &Url, timeout: Duration) -> Result<reqwest::Response> {
        let response = self
            .client
            .request(method, url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| MirrorError::from_reqwest(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::from_status(url.as_str(), status));
        }
        Ok(response)
    }
}

#[async_trait]
impl ListingClient for HttpRemote {
    async fn list(&self, dir_url: &Url) -> Result<Vec<RemoteEntry>> {
        let response = self.send(Method::GET, dir_url, self.config.op_timeout).await?;
        // 服务器可能把 /dir 重定向到 /dir/，以最终地址为基准解析相对链接
        let base = response.url().clone();
        let html = response
            .text()
            .await
            .map_err(|e| MirrorError::from_reqwest(dir_url.as_str(), e))?;

        let entries = parse_listing(&html, &base);
        debug!("目录 {} 包含 {} 个条目", dir_url, entries.len());
        Ok(entries)
    }
}

#[async_trait]
impl MetadataProbe for HttpRemote {
    async fn probe(&self, file_url: &Url) -> Result<RemoteMetadata> {
        let response = self
            .client
            .head(file_url.clone())
            .timeout(self.config.op_timeout)
            .send()
            .await
            .map_err(|e| MirrorError::from_reqwest(file_url.as_str(), e))?;

        let status = response.status();
        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            // 不支持 HEAD 的服务器：只请求第一个字节，总大小取自 Content-Range
            debug!("服务器不支持 HEAD，改用 Range GET: {}", file_url);
            let response = self
                .client
                .get(file_url.clone())
                .header(RANGE, "bytes=0-0")
                .timeout(self.config.op_timeout)
                .send()
                .await
                .map_err(|e| MirrorError::from_reqwest(file_url.as_str(), e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(MirrorError::from_status(file_url.as_str(), status));
            }
            return Ok(metadata_from_range_response(status, response.headers()));
        }
        if !status.is_success() {
            return Err(MirrorError::from_status(file_url.as_str(), status));
        }

        Ok(metadata_from_headers(response.headers()))
    }
}

#[async_trait]
impl ContentSource for HttpRemote {
    async fn open(&self, file_url: &Url) -> Result<ByteStream> {
        let response = self.send(Method::GET, file_url, self.config.io_timeout).await?;
        let url = file_url.to_string();
        let stream = response
            .bytes_stream()
            .map_err(move |e| MirrorError::from_reqwest(&url, e));
        Ok(Box::pin(stream))
    }
}

/// 从响应头提取元数据；缺失或无法解析的头一律视为未知
pub fn metadata_from_headers(headers: &HeaderMap) -> RemoteMetadata {
    let header_str = |name: HeaderName| headers.get(&name).and_then(|v| v.to_str().ok());

    let size = header_str(CONTENT_LENGTH).and_then(|v| v.trim().parse::<u64>().ok());
    let last_modified = header_str(LAST_MODIFIED).and_then(parse_http_date);
    let etag = header_str(ETAG)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    RemoteMetadata {
        size,
        last_modified,
        etag,
    }
}

/// Range GET 的元数据：206 时大小取 `Content-Range` 中的总长度
/// （`*` 表示未知），服务器忽略 Range 返回 200 时按普通响应头处理
pub fn metadata_from_range_response(status: StatusCode, headers: &HeaderMap) -> RemoteMetadata {
    let mut metadata = metadata_from_headers(headers);
    if status == StatusCode::PARTIAL_CONTENT {
        metadata.size = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit_once('/'))
            .and_then(|(_, total)| total.trim().parse::<u64>().ok());
    }
    metadata
}

/// 解析 HTTP 日期（IMF-fixdate，例如 `Mon, 01 Jan 2024 10:00:00 GMT`）
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
