//! 应用配置模块

use crate::core::scanner::{ExcludeRules, DEFAULT_MAX_WALK_DEPTH};
use crate::core::{CompareConfig, EngineConfig, EtagAlgorithm, RetryPolicy, SchedulerConfig, WalkConfig};
use crate::core::MAX_CONCURRENT_TRANSFERS;
use crate::error::{MirrorError, Result};
use crate::logging::LogConfig;
use crate::remote::{HttpRemoteConfig, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use anyhow::Context;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// 配置文件名
pub const CONFIG_FILE_NAME: &str = "config.json";

/// 镜像配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirrorConfig {
    /// 远程根目录（目录索引页）
    #[serde(default)]
    pub remote_url: String,
    /// 本地根目录
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    /// 最大并发下载数，0 表示 2 × CPU 核数
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒），第 n 次重试前等待 base × 2^n
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 忽略变更判断，全部重新下载
    #[serde(default)]
    pub force: bool,

    /// 每个请求都携带的请求头
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// 为空时使用 `mirrortools/<版本>`
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 目录页和元数据请求的超时
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 单个文件下载的超时
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    /// 远程目录的最大嵌套深度，更深的目录记为结构错误
    #[serde(default = "default_max_walk_depth")]
    pub max_walk_depth: usize,

    /// 远程元数据全部未知时是否下载
    #[serde(default = "default_true")]
    pub transfer_unverifiable: bool,
    #[serde(default = "default_true")]
    pub compare_etag: bool,
    #[serde(default)]
    pub etag_algorithm: EtagAlgorithm,
    #[serde(default)]
    pub time_tolerance_seconds: i64,
    /// 排除规则（glob，匹配相对路径）
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// 镜像到 `<local_root>/YYYY-MM-DD`
    #[serde(default)]
    pub dated_subdirectory: bool,
    /// 取消后等待进行中下载的秒数
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// 同步完成后执行的命令
    #[serde(default)]
    pub post_sync_command: Option<String>,
    /// 没有下载任何文件时是否也执行命令
    #[serde(default)]
    pub hook_on_no_change: bool,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_local_root() -> PathBuf {
    PathBuf::from("mirror")
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    OP_TIMEOUT_SECS
}

fn default_download_timeout_secs() -> u64 {
    IO_TIMEOUT_SECS
}

fn default_probe_concurrency() -> usize {
    8
}

fn default_max_walk_depth() -> usize {
    DEFAULT_MAX_WALK_DEPTH
}

fn default_true() -> bool {
    true
}

fn default_cancel_grace_secs() -> u64 {
    10
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            local_root: default_local_root(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            force: false,
            headers: BTreeMap::new(),
            user_agent: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            probe_concurrency: default_probe_concurrency(),
            max_walk_depth: default_max_walk_depth(),
            transfer_unverifiable: true,
            compare_etag: true,
            etag_algorithm: EtagAlgorithm::default(),
            time_tolerance_seconds: 0,
            exclude_patterns: Vec::new(),
            dated_subdirectory: false,
            cancel_grace_secs: default_cancel_grace_secs(),
            post_sync_command: None,
            hook_on_no_change: false,
            log: LogConfig::default(),
        }
    }
}

impl MirrorConfig {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        crate::dirs::app_config_dir().join(CONFIG_FILE_NAME)
    }

    /// 从文件加载配置
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("配置文件格式错误 {}", path.display()))?;
        Ok(config)
    }

    /// 文件不存在时返回默认配置
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// 保存配置
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("无法创建配置目录 {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("无法写入配置文件 {}", path.display()))?;
        Ok(())
    }

    /// 校验配置并返回规范化的远程根目录 URL（以 `/` 结尾）
    pub fn validate(&self) -> Result<Url> {
        if self.remote_url.trim().is_empty() {
            return Err(MirrorError::Config("未设置 remote_url".to_string()));
        }
        let mut url = Url::parse(self.remote_url.trim())
            .map_err(|e| MirrorError::Config(format!("remote_url 无效 {}: {}", self.remote_url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(MirrorError::Config(format!(
                "remote_url 只支持 http/https: {}",
                self.remote_url
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        if self.local_root.as_os_str().is_empty() {
            return Err(MirrorError::Config("未设置 local_root".to_string()));
        }
        if self.concurrency > MAX_CONCURRENT_TRANSFERS {
            warn!(
                "concurrency={} 超过上限，将使用 {}",
                self.concurrency, MAX_CONCURRENT_TRANSFERS
            );
        }
        if self.time_tolerance_seconds < 0 {
            return Err(MirrorError::Config("time_tolerance_seconds 不能为负数".to_string()));
        }
        if self.max_walk_depth == 0 {
            return Err(MirrorError::Config("max_walk_depth 必须大于 0".to_string()));
        }
        ExcludeRules::new(&self.exclude_patterns)?;

        Ok(url)
    }

    /// HTTP 客户端配置
    pub fn http_config(&self) -> HttpRemoteConfig {
        let mut config = HttpRemoteConfig {
            headers: self.headers.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            op_timeout: Duration::from_secs(self.request_timeout_secs),
            io_timeout: Duration::from_secs(self.download_timeout_secs),
            ..Default::default()
        };
        if let Some(agent) = self.user_agent.as_ref().filter(|a| !a.trim().is_empty()) {
            config.user_agent = agent.clone();
        }
        config
    }

    /// 引擎配置（会先校验）
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let remote_url = self.validate()?;
        Ok(EngineConfig {
            remote_url,
            local_root: self.local_root.clone(),
            dated_subdirectory: self.dated_subdirectory,
            walk: WalkConfig {
                exclude_patterns: self.exclude_patterns.clone(),
                probe_concurrency: self.probe_concurrency.max(1),
                force: self.force,
                max_depth: self.max_walk_depth,
            },
            compare: CompareConfig {
                transfer_unverifiable: self.transfer_unverifiable,
                compare_etag: self.compare_etag,
                etag_algorithm: self.etag_algorithm,
                time_tolerance_seconds: self.time_tolerance_seconds,
            },
            retry: RetryPolicy::new(
                self.max_retries,
                Duration::from_millis(self.retry_base_delay_ms),
            ),
            scheduler: SchedulerConfig {
                concurrency: self.concurrency,
                cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            },
        })
    }
}
