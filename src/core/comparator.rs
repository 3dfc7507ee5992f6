use crate::core::file_state::{HashAlgorithm, LocalFileState};
use crate::error::Result;
use crate::remote::RemoteMetadata;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 需要下载的原因
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferReason {
    /// 本地不存在
    Missing,
    SizeChanged,
    EntityTagChanged,
    RemoteNewer,
    /// 远程元数据全部未知，无法验证
    Unverifiable,
    /// 强制全量同步
    Forced,
}

impl std::fmt::Display for TransferReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferReason::Missing => write!(f, "new"),
            TransferReason::SizeChanged => write!(f, "size changed"),
            TransferReason::EntityTagChanged => write!(f, "etag changed"),
            TransferReason::RemoteNewer => write!(f, "remote newer"),
            TransferReason::Unverifiable => write!(f, "unverifiable"),
            TransferReason::Forced => write!(f, "forced"),
        }
    }
}

/// 比较结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Transfer(TransferReason),
    Skip,
}

impl Decision {
    pub fn is_transfer(&self) -> bool {
        matches!(self, Decision::Transfer(_))
    }
}

/// ETag 的哈希算法选择
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EtagAlgorithm {
    /// 按长度识别：32 位十六进制为 MD5，64 位为 SHA-256
    #[default]
    Auto,
    Md5,
    Sha256,
    Blake3,
}

/// 比较配置
#[derive(Debug, Clone)]
pub struct CompareConfig {
    /// 远程元数据全部未知时是否下载
    pub transfer_unverifiable: bool,
    /// 是否用 ETag 和本地内容哈希比较
    pub compare_etag: bool,
    pub etag_algorithm: EtagAlgorithm,
    /// 时间容差（秒）
    pub time_tolerance_seconds: i64,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            transfer_unverifiable: true,
            compare_etag: true,
            etag_algorithm: EtagAlgorithm::Auto,
            time_tolerance_seconds: 0,
        }
    }
}

/// 变更判断
///
/// 依次检查存在性、大小、ETag（需要读文件）和修改时间。
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    config: CompareConfig,
}

impl ChangeDetector {
    pub fn new(config: CompareConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompareConfig {
        &self.config
    }

    pub async fn decide(
        &self,
        local: &mut LocalFileState,
        remote: &RemoteMetadata,
    ) -> Result<Decision> {
        if !local.exists {
            return Ok(Decision::Transfer(TransferReason::Missing));
        }

        if remote.is_unknown() {
            return Ok(if self.config.transfer_unverifiable {
                Decision::Transfer(TransferReason::Unverifiable)
            } else {
                Decision::Skip
            });
        }

        if let Some(size) = remote.size {
            if size != local.size {
                debug!(
                    "文件大小不同: {} (remote={}, local={})",
                    local.path.display(),
                    size,
                    local.size
                );
                return Ok(Decision::Transfer(TransferReason::SizeChanged));
            }
        }

        if self.config.compare_etag {
            if let Some((algorithm, digest)) = remote
                .etag
                .as_deref()
                .and_then(|tag| comparable_etag(tag, self.config.etag_algorithm))
            {
                let local_hash = local.content_hash(algorithm).await?.to_string();
                if local_hash != digest {
                    debug!(
                        "ETag 不同: {} (remote={}, local={})",
                        local.path.display(),
                        digest,
                        local_hash
                    );
                    return Ok(Decision::Transfer(TransferReason::EntityTagChanged));
                }
            }
        }

        if let Some(remote_time) = remote.last_modified {
            let diff = remote_time.timestamp() - local.modified_time.timestamp();
            if diff > self.config.time_tolerance_seconds {
                debug!(
                    "远程文件较新: {} (remote={}, local={}, diff={}s)",
                    local.path.display(),
                    remote_time,
                    local.modified_time,
                    diff
                );
                return Ok(Decision::Transfer(TransferReason::RemoteNewer));
            }
        }

        Ok(Decision::Skip)
    }

    pub async fn should_transfer(
        &self,
        local: &mut LocalFileState,
        remote: &RemoteMetadata,
    ) -> Result<bool> {
        Ok(self.decide(local, remote).await?.is_transfer())
    }
}

/// 把 ETag 规范化为可比较的内容摘要
///
/// ETag 是服务器定义的不透明字符串，只有看起来像内容摘要时才比较；
/// 像 `"5f3a1c-1a2b"` 这样的 inode/大小/时间组合直接忽略。
pub fn comparable_etag(tag: &str, algorithm: EtagAlgorithm) -> Option<(HashAlgorithm, String)> {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    let digest = tag.trim_matches('"').to_ascii_lowercase();

    if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let algorithm = match (algorithm, digest.len()) {
        (EtagAlgorithm::Auto, 32) | (EtagAlgorithm::Md5, 32) => HashAlgorithm::Md5,
        (EtagAlgorithm::Auto, 64) | (EtagAlgorithm::Sha256, 64) => HashAlgorithm::Sha256,
        (EtagAlgorithm::Blake3, 64) => HashAlgorithm::Blake3,
        _ => return None,
    };
    Some((algorithm, digest))
}
