//! 内存中的远程端，用于测试
//!
//! 目录页由已添加的文件推导出来，渲染成 HTML 后交给真实的解析器处理。
//! 支持按 URL 注入失败：前 N 次列出/获取元数据/下载返回可重试错误。

use crate::error::{MirrorError, Result};
use crate::remote::{
    canonical_dir_url, parse_listing, ByteStream, ContentSource, ListingClient, MetadataProbe,
    RemoteEntry, RemoteMetadata,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use reqwest::Url;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// 一个远程文件
#[derive(Debug, Clone)]
pub struct RemoteFile {
    content: Bytes,
    size: Option<u64>,
    modified: Option<DateTime<Utc>>,
    etag: Option<String>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    fail_body_after: Option<usize>,
}

impl RemoteFile {
    pub fn new(content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            size: Some(content.len() as u64),
            content,
            modified: None,
            etag: None,
            chunk_size: 64 * 1024,
            chunk_delay: None,
            fail_body_after: None,
        }
    }

    pub fn modified(mut self, at: DateTime<Utc>) -> Self {
        self.modified = Some(at);
        self
    }

    pub fn etag(mut self, tag: impl Into<String>) -> Self {
        self.etag = Some(tag.into());
        self
    }

    /// 声明的 Content-Length 与实际内容不同
    pub fn declared_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// 不返回任何元数据头
    pub fn unknown_metadata(mut self) -> Self {
        self.size = None;
        self.modified = None;
        self.etag = None;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// 发送 `bytes` 字节后连接中断
    pub fn fail_body_after(mut self, bytes: usize) -> Self {
        self.fail_body_after = Some(bytes);
        self
    }

    fn metadata(&self) -> RemoteMetadata {
        RemoteMetadata {
            size: self.size,
            last_modified: self.modified,
            etag: self.etag.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<String, RemoteFile>,
    /// 目录 URL -> 页面中的 href（保持添加顺序）
    listings: BTreeMap<String, Vec<String>>,
    /// 别名目录 -> 实际目录，模拟服务器端的符号链接
    aliases: HashMap<String, String>,
    listing_failures: HashMap<String, u32>,
    probe_failures: HashMap<String, u32>,
    open_failures: HashMap<String, u32>,
    list_calls: HashMap<String, u32>,
    probe_calls: HashMap<String, u32>,
    open_calls: HashMap<String, u32>,
    active_opens: usize,
    max_active_opens: usize,
}

/// 内存远程端，同时实现三种远程能力
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // 测试中的 panic 不应让后续断言也失败
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 添加或替换文件，并把路径上的各级目录加入目录页
    pub fn add_file(&self, url: &str, file: RemoteFile) {
        let url = parse(url);
        let mut state = self.lock();

        let segments: Vec<String> = url
            .path()
            .trim_start_matches('/')
            .split('/')
            .map(str::to_string)
            .collect();
        let mut dir = url.join("/").unwrap_or_else(|_| url.clone());
        for (i, segment) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();
            let href = if is_last {
                segment.clone()
            } else {
                format!("{}/", segment)
            };
            let hrefs = state.listings.entry(dir.to_string()).or_default();
            if !hrefs.contains(&href) {
                hrefs.push(href.clone());
            }
            if !is_last {
                dir = dir.join(&href).unwrap_or(dir);
            }
        }

        state.files.insert(url.to_string(), file);
    }

    /// 在目录页中加入一个原样的链接
    pub fn add_link(&self, dir_url: &str, href: &str) {
        let dir = canonical_dir_url(&parse(dir_url));
        self.lock()
            .listings
            .entry(dir.to_string())
            .or_default()
            .push(href.to_string());
    }

    /// 让 `alias` 目录及其下的所有路径映射到 `target`，模拟服务器端的符号链接
    ///
    /// 指向上级目录的别名会形成无限的 URL 链：`loop/`、`loop/loop/`……
    pub fn alias_dir(&self, alias: &str, target: &str) {
        let alias = canonical_dir_url(&parse(alias)).to_string();
        let target = canonical_dir_url(&parse(target)).to_string();
        self.lock().aliases.insert(alias, target);
    }

    /// 前 `times` 次列出该目录失败
    pub fn fail_listing(&self, dir_url: &str, times: u32) {
        let dir = canonical_dir_url(&parse(dir_url)).to_string();
        self.lock().listing_failures.insert(dir, times);
    }

    /// 前 `times` 次获取元数据失败
    pub fn fail_probe(&self, url: &str, times: u32) {
        self.lock().probe_failures.insert(parse(url).to_string(), times);
    }

    /// 前 `times` 次打开内容失败
    pub fn fail_open(&self, url: &str, times: u32) {
        self.lock().open_failures.insert(parse(url).to_string(), times);
    }

    pub fn metadata_of(&self, url: &Url) -> Option<RemoteMetadata> {
        self.lock().files.get(url.as_str()).map(RemoteFile::metadata)
    }

    pub fn list_calls(&self, dir_url: &str) -> u32 {
        let dir = canonical_dir_url(&parse(dir_url)).to_string();
        self.lock().list_calls.get(&dir).copied().unwrap_or(0)
    }

    pub fn probe_calls(&self, url: &str) -> u32 {
        let key = parse(url).to_string();
        self.lock().probe_calls.get(&key).copied().unwrap_or(0)
    }

    pub fn open_calls(&self, url: &str) -> u32 {
        let key = parse(url).to_string();
        self.lock().open_calls.get(&key).copied().unwrap_or(0)
    }

    /// 同时打开的内容流的最大数量
    pub fn max_concurrent_opens(&self) -> usize {
        self.lock().max_active_opens
    }

    /// 所有文件内容的下载次数之和
    pub fn total_opens(&self) -> u32 {
        self.lock().open_calls.values().sum()
    }
}

fn parse(url: &str) -> Url {
    Url::parse(url).unwrap_or_else(|e| panic!("invalid test url {}: {}", url, e))
}

fn unavailable(url: &str) -> MirrorError {
    MirrorError::Fetch {
        url: url.to_string(),
        message: "HTTP 503 Service Unavailable".to_string(),
        transient: true,
    }
}

fn not_found(url: &str) -> MirrorError {
    MirrorError::Fetch {
        url: url.to_string(),
        message: "HTTP 404 Not Found".to_string(),
        transient: false,
    }
}

/// 计数并判断是否需要注入失败
fn record_call(calls: &mut HashMap<String, u32>, failures: &mut HashMap<String, u32>, key: &str) -> bool {
    *calls.entry(key.to_string()).or_default() += 1;
    match failures.get_mut(key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// 反复替换别名前缀，直到没有别名匹配
fn resolve_alias(aliases: &HashMap<String, String>, key: &str) -> String {
    let mut current = key.to_string();
    for _ in 0..1024 {
        let replaced = aliases.iter().find_map(|(alias, target)| {
            current
                .strip_prefix(alias.as_str())
                .map(|rest| format!("{}{}", target, rest))
        });
        match replaced {
            Some(next) if next != current => current = next,
            _ => break,
        }
    }
    current
}

fn render_index(dir: &Url, hrefs: &[String]) -> String {
    let mut html = format!(
        "<html><head><title>Index of {0}</title></head><body><h1>Index of {0}</h1><pre>\n\
         <a href=\"?C=N;O=D\">Name</a>\n<a href=\"../\">Parent Directory</a>\n",
        dir.path()
    );
    for href in hrefs {
        html.push_str(&format!("<a href=\"{0}\">{0}</a>\n", href));
    }
    html.push_str("</pre></body></html>");
    html
}

struct OpenGuard {
    state: Arc<Mutex<State>>,
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active_opens = state.active_opens.saturating_sub(1);
    }
}

#[async_trait]
impl ListingClient for MemoryRemote {
    async fn list(&self, dir_url: &Url) -> Result<Vec<RemoteEntry>> {
        let dir = canonical_dir_url(dir_url);
        let key = dir.to_string();
        let html = {
            let mut state = self.lock();
            let state = &mut *state;
            if record_call(&mut state.list_calls, &mut state.listing_failures, &key) {
                return Err(unavailable(&key));
            }
            let source = resolve_alias(&state.aliases, &key);
            let hrefs = state.listings.get(&source).ok_or_else(|| not_found(&key))?;
            render_index(&dir, hrefs)
        };
        Ok(parse_listing(&html, &dir))
    }
}

#[async_trait]
impl MetadataProbe for MemoryRemote {
    async fn probe(&self, file_url: &Url) -> Result<RemoteMetadata> {
        let key = file_url.to_string();
        let mut state = self.lock();
        let state = &mut *state;
        if record_call(&mut state.probe_calls, &mut state.probe_failures, &key) {
            return Err(unavailable(&key));
        }
        state
            .files
            .get(&resolve_alias(&state.aliases, &key))
            .map(RemoteFile::metadata)
            .ok_or_else(|| not_found(&key))
    }
}

#[async_trait]
impl ContentSource for MemoryRemote {
    async fn open(&self, file_url: &Url) -> Result<ByteStream> {
        let key = file_url.to_string();
        let file = {
            let mut state = self.lock();
            let state = &mut *state;
            if record_call(&mut state.open_calls, &mut state.open_failures, &key) {
                return Err(unavailable(&key));
            }
            let file = state
                .files
                .get(&resolve_alias(&state.aliases, &key))
                .cloned()
                .ok_or_else(|| not_found(&key))?;
            state.active_opens += 1;
            state.max_active_opens = state.max_active_opens.max(state.active_opens);
            file
        };

        let guard = OpenGuard {
            state: self.state.clone(),
        };
        let body = stream::unfold((0usize, false, guard), move |(offset, done, guard)| {
            let file = file.clone();
            let key = key.clone();
            async move {
                if done || offset >= file.content.len() {
                    return None;
                }
                if let Some(delay) = file.chunk_delay {
                    tokio::time::sleep(delay).await;
                }

                let mut end = (offset + file.chunk_size).min(file.content.len());
                if let Some(limit) = file.fail_body_after {
                    if offset >= limit {
                        let err = MirrorError::Fetch {
                            url: key,
                            message: "connection reset".to_string(),
                            transient: true,
                        };
                        return Some((Err(err), (offset, true, guard)));
                    }
                    end = end.min(limit);
                }
                Some((Ok(file.content.slice(offset..end)), (end, false, guard)))
            }
        });
        Ok(Box::pin(body))
    }
}
