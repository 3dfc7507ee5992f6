use crate::core::comparator::{ChangeDetector, Decision, TransferReason};
use crate::core::file_state::LocalFileState;
use crate::core::retry::RetryPolicy;
use crate::core::transfer::{TaskPlan, TransferTask, STAGING_SUFFIX};
use crate::error::{ErrorInfo, MirrorError, Result};
use crate::remote::{canonical_dir_url, is_beneath, ListingClient, MetadataProbe, RemoteEntry};
use futures::stream::{self, StreamExt};
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 默认的目录嵌套深度上限
pub const DEFAULT_MAX_WALK_DEPTH: usize = 256;

/// 扫描配置
#[derive(Debug, Clone)]
pub struct WalkConfig {
    /// 排除规则（glob patterns，匹配相对路径）
    pub exclude_patterns: Vec<String>,
    /// 并发获取元数据的数量
    pub probe_concurrency: usize,
    /// 忽略变更判断，全部下载
    pub force: bool,
    /// 超过该深度的目录记为结构错误，不再深入
    pub max_depth: usize,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: vec![],
            probe_concurrency: 8,
            force: false,
            max_depth: DEFAULT_MAX_WALK_DEPTH,
        }
    }
}

/// 子树级别的错误：目录列出失败、循环引用、非法路径、目标路径重复
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalkError {
    pub url: String,
    pub error: ErrorInfo,
}

impl WalkError {
    fn new(url: impl Into<String>, error: &MirrorError) -> Self {
        Self {
            url: url.into(),
            error: ErrorInfo::from(error),
        }
    }

    fn structural(url: &Url, message: impl Into<String>) -> Self {
        Self::new(url.as_str(), &MirrorError::structural(url.as_str(), message))
    }
}

/// 扫描结果
#[derive(Debug, Default)]
pub struct WalkResult {
    /// 按目标路径排序，目标路径互不相同
    pub tasks: Vec<TransferTask>,
    pub errors: Vec<WalkError>,
    pub directories: usize,
    pub excluded: usize,
}

/// 排除规则
///
/// `**` 匹配任意层级，`*` 和 `?` 不跨越 `/`。不含 `/` 的规则只匹配文件名。
/// 匹配不区分大小写。
#[derive(Debug, Clone, Default)]
pub struct ExcludeRules {
    rules: Vec<(Regex, bool)>,
}

impl ExcludeRules {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let rules = patterns
            .iter()
            .map(|pattern| {
                let anchored = pattern.contains('/');
                let re = Regex::new(&glob_to_regex(pattern.trim_start_matches('/')))
                    .map_err(|e| MirrorError::Config(format!("无效的排除规则 {}: {}", pattern, e)))?;
                Ok((re, anchored))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_excluded(&self, relative_path: &str) -> bool {
        let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        self.rules.iter().any(|(re, anchored)| {
            if *anchored {
                re.is_match(relative_path)
            } else {
                re.is_match(file_name)
            }
        })
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?i)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                // `dir/**` 同时匹配 dir 下的所有层级
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// 把远程相对路径（URL 编码，`/` 分隔）映射为本地目标路径
///
/// 返回解码后的相对路径和目标路径。任何一段为空、为 `.`/`..`、
/// 含路径分隔符或 NUL 都会被拒绝。
pub fn map_destination(
    local_root: &Path,
    encoded_relative: &str,
) -> std::result::Result<(String, PathBuf), String> {
    let mut segments = Vec::new();
    for raw in encoded_relative.split('/') {
        let segment = urlencoding::decode(raw)
            .map_err(|e| format!("无法解码路径段 {}: {}", raw, e))?
            .into_owned();
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(format!("非法路径段: {:?}", segment));
        }
        if segment.contains(|c: char| matches!(c, '/' | '\\' | '\0')) {
            return Err(format!("路径段包含非法字符: {:?}", segment));
        }
        segments.push(segment);
    }

    if segments
        .last()
        .map_or(false, |name| name.ends_with(STAGING_SUFFIX))
    {
        return Err(format!("文件名与暂存文件后缀 {} 冲突", STAGING_SUFFIX));
    }

    let destination = segments
        .iter()
        .fold(local_root.to_path_buf(), |path, segment| path.join(segment));
    Ok((segments.join("/"), destination))
}

/// 等待列出的目录，附带路径上各级目录页的指纹
struct PendingDir {
    url: Url,
    depth: usize,
    ancestors: Vec<blake3::Hash>,
}

/// 目录页指纹：位于 `dir` 之下的条目名及其类型，与顺序无关
///
/// 指向自身或上级的链接不参与计算。只含一个子目录、没有文件的页面
/// 不计算指纹，`a/a/a/file.bin` 这样的单链目录会产生相同的页面；
/// 这类链条由深度上限兜底。
fn listing_fingerprint(dir: &Url, entries: &[RemoteEntry]) -> Option<blake3::Hash> {
    let mut names: Vec<(&str, bool)> = entries
        .iter()
        .filter(|e| {
            if e.is_dir {
                is_beneath(dir, &canonical_dir_url(&e.url))
            } else {
                is_beneath(dir, &e.url)
            }
        })
        .map(|e| (e.name.as_str(), e.is_dir))
        .collect();
    if names.is_empty() || (names.len() == 1 && names[0].1) {
        return None;
    }
    names.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for (name, is_dir) in names {
        hasher.update(name.as_bytes());
        if is_dir {
            hasher.update(b"/");
        }
        hasher.update(b"\n");
    }
    Some(hasher.finalize())
}

/// 远程目录树扫描器
pub struct TreeWalker {
    lister: Arc<dyn ListingClient>,
    prober: Arc<dyn MetadataProbe>,
    detector: ChangeDetector,
    retry: RetryPolicy,
    excludes: ExcludeRules,
    config: WalkConfig,
}

impl TreeWalker {
    pub fn new(
        lister: Arc<dyn ListingClient>,
        prober: Arc<dyn MetadataProbe>,
        detector: ChangeDetector,
        retry: RetryPolicy,
        config: WalkConfig,
    ) -> Result<Self> {
        Ok(Self {
            lister,
            prober,
            detector,
            retry,
            excludes: ExcludeRules::new(&config.exclude_patterns)?,
            config,
        })
    }

    /// 展开整棵远程目录树，为每个文件生成一个传输任务
    pub async fn walk(&self, root_url: &Url, local_root: &Path, cancel: &CancellationToken) -> WalkResult {
        let root = canonical_dir_url(root_url);
        info!("开始扫描远程目录: {}", root);

        let (files, directories, mut errors) = self.discover(&root, cancel).await;

        // 以目标路径为键去重，后出现的 URL 记为结构错误
        let mut planned: BTreeMap<PathBuf, (Url, String)> = BTreeMap::new();
        let mut excluded = 0;
        for url in files {
            let encoded = &url.path()[root.path().len()..];
            let (relative_path, destination) = match map_destination(local_root, encoded) {
                Ok(mapped) => mapped,
                Err(message) => {
                    warn!("跳过非法路径 {}: {}", url, message);
                    errors.push(WalkError::structural(&url, message));
                    continue;
                }
            };

            if self.excludes.is_excluded(&relative_path) {
                debug!("排除文件: {}", relative_path);
                excluded += 1;
                continue;
            }

            if let Some((first, _)) = planned.get(&destination) {
                warn!("目标路径重复: {} 与 {}", url, first);
                let message = format!("目标路径 {} 已被 {} 占用", destination.display(), first);
                errors.push(WalkError::structural(&url, message));
                continue;
            }
            planned.insert(destination, (url, relative_path));
        }

        let concurrency = self.config.probe_concurrency.max(1);
        let mut tasks: Vec<TransferTask> = stream::iter(planned)
            .map(|(destination, (url, relative_path))| {
                self.plan_file(url, relative_path, destination, cancel)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        tasks.sort_by(|a, b| a.destination.cmp(&b.destination));

        info!(
            "扫描完成: {} 个文件, {} 个目录, {} 个被排除, {} 个错误",
            tasks.len(),
            directories,
            excluded,
            errors.len()
        );

        WalkResult {
            tasks,
            errors,
            directories,
            excluded,
        }
    }

    /// 迭代式深度优先遍历，返回所有文件 URL
    ///
    /// 除了按 URL 去重，还记录当前路径上每一级目录页的指纹：服务器端的
    /// 别名或符号链接（`loop/` -> `./`）每一层都是新 URL，但目录页内容与
    /// 某个上级目录相同，此时记为结构错误，不再深入。
    async fn discover(&self, root: &Url, cancel: &CancellationToken) -> (Vec<Url>, usize, Vec<WalkError>) {
        let lister = self.lister.as_ref();
        let max_depth = self.config.max_depth.max(1);
        let mut visited: HashSet<Url> = HashSet::new();
        visited.insert(root.clone());
        let mut stack = vec![PendingDir {
            url: root.clone(),
            depth: 0,
            ancestors: Vec::new(),
        }];
        let mut files = Vec::new();
        let mut errors = Vec::new();
        let mut directories = 0;

        while let Some(PendingDir { url: dir, depth, ancestors }) = stack.pop() {
            if cancel.is_cancelled() {
                info!("扫描已取消");
                break;
            }

            let dir_ref = &dir;
            let attempted = self
                .retry
                .run(&format!("列出目录 {}", dir), cancel, move || lister.list(dir_ref))
                .await;
            let entries = match attempted.result {
                Ok(entries) => entries,
                Err(MirrorError::Cancelled) => break,
                Err(e) => {
                    warn!("列出目录失败，跳过该子树: {} - {}", dir, e);
                    errors.push(WalkError::new(dir.as_str(), &e));
                    continue;
                }
            };

            let fingerprint = listing_fingerprint(&dir, &entries);
            if let Some(fingerprint) = fingerprint {
                if ancestors.contains(&fingerprint) {
                    warn!("检测到循环引用（目录内容与上级目录相同）: {}", dir);
                    errors.push(WalkError::structural(&dir, "目录内容与上级目录相同（循环引用）"));
                    continue;
                }
            }
            directories += 1;
            debug!("目录 {} 包含 {} 个条目", dir, entries.len());

            let mut child_ancestors = ancestors;
            child_ancestors.extend(fingerprint);

            let mut subdirs = Vec::new();
            for entry in entries {
                if entry.is_dir {
                    let child = canonical_dir_url(&entry.url);
                    if !is_beneath(&dir, &child) {
                        warn!("目录 {} 不在 {} 之下，不再深入", child, dir);
                        errors.push(WalkError::structural(&child, format!("目录不在 {} 之下", dir)));
                    } else if depth + 1 > max_depth {
                        warn!("目录层级超过 {}: {}", max_depth, child);
                        errors.push(WalkError::structural(&child, format!("目录层级超过 {}", max_depth)));
                    } else if !visited.insert(child.clone()) {
                        warn!("检测到循环引用: {}", child);
                        errors.push(WalkError::structural(&child, "目录已访问过（循环引用）"));
                    } else {
                        subdirs.push(PendingDir {
                            url: child,
                            depth: depth + 1,
                            ancestors: child_ancestors.clone(),
                        });
                    }
                } else if is_beneath(&dir, &entry.url) {
                    files.push(entry.url);
                } else {
                    errors.push(WalkError::structural(&entry.url, format!("文件不在 {} 之下", dir)));
                }
            }

            // 逆序入栈，保持目录页中的顺序
            stack.extend(subdirs.into_iter().rev());
        }

        (files, directories, errors)
    }

    /// 获取元数据并决定是否需要下载
    async fn plan_file(
        &self,
        url: Url,
        relative_path: String,
        destination: PathBuf,
        cancel: &CancellationToken,
    ) -> TransferTask {
        let prober = self.prober.as_ref();
        let url_ref = &url;
        let attempted = self
            .retry
            .run(&format!("获取元数据 {}", url), cancel, move || prober.probe(url_ref))
            .await;

        let (remote, plan) = match attempted.result {
            Ok(remote) => {
                let plan = self.decide(&destination, &remote).await;
                (remote, plan)
            }
            Err(e) => {
                warn!("获取元数据失败: {} - {}", url, e);
                (Default::default(), TaskPlan::Failed(ErrorInfo::from(&e)))
            }
        };

        debug!("{} -> {:?}", relative_path, plan);
        TransferTask {
            source_url: url,
            relative_path,
            destination,
            remote,
            plan,
        }
    }

    async fn decide(&self, destination: &Path, remote: &crate::remote::RemoteMetadata) -> TaskPlan {
        if self.config.force {
            return TaskPlan::Transfer(TransferReason::Forced);
        }

        let decision = match LocalFileState::read(destination).await {
            Ok(mut local) => self.detector.decide(&mut local, remote).await,
            Err(e) => Err(e),
        };
        match decision {
            Ok(Decision::Transfer(reason)) => TaskPlan::Transfer(reason),
            Ok(Decision::Skip) => TaskPlan::Skip,
            Err(e) => {
                warn!("无法判断本地文件状态: {} - {}", destination.display(), e);
                TaskPlan::Failed(ErrorInfo::from(&e))
            }
        }
    }
}
