use crate::remote::ListingClient;
use reqwest::Url;
use serde::Serialize;
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct TestConnectionResult {
    pub success: bool,
    pub message: String,
    pub details: Option<String>,
}

/// 列出一次远程根目录，检查是否可达
pub async fn test_connection(lister: &dyn ListingClient, root_url: &Url) -> TestConnectionResult {
    let start = Instant::now();
    match lister.list(root_url).await {
        Ok(entries) => {
            let dirs = entries.iter().filter(|e| e.is_dir).count();
            TestConnectionResult {
                success: true,
                message: "连接成功".to_string(),
                details: Some(format!(
                    "{} 个文件, {} 个目录, 耗时 {}ms",
                    entries.len() - dirs,
                    dirs,
                    start.elapsed().as_millis()
                )),
            }
        }
        Err(e) => TestConnectionResult {
            success: false,
            message: "连接失败".to_string(),
            details: Some(e.to_string()),
        },
    }
}

/// 检查本地根目录是否可写；不存在时视为可以创建
pub fn test_local_root(path: &Path) -> TestConnectionResult {
    if !path.exists() {
        return TestConnectionResult {
            success: true,
            message: "本地目录不存在".to_string(),
            details: Some(format!("'{}' 将在同步时创建", path.display())),
        };
    }

    if !path.is_dir() {
        return TestConnectionResult {
            success: false,
            message: "路径不是文件夹".to_string(),
            details: Some(format!("'{}' 不是一个文件夹", path.display())),
        };
    }

    match std::fs::metadata(path) {
        Ok(metadata) if metadata.permissions().readonly() => TestConnectionResult {
            success: false,
            message: "本地目录只读".to_string(),
            details: Some(format!("'{}' 不可写", path.display())),
        },
        Ok(_) => TestConnectionResult {
            success: true,
            message: "本地目录可用".to_string(),
            details: Some("读写访问".to_string()),
        },
        Err(e) => TestConnectionResult {
            success: false,
            message: "无法访问本地目录".to_string(),
            details: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryRemote, RemoteFile};

    #[tokio::test]
    async fn test_reachable_remote() {
        let remote = MemoryRemote::new();
        remote.add_file("http://mirror.test/tools/a.iso", RemoteFile::new(vec![0; 4]));
        remote.add_file("http://mirror.test/tools/patches/b.zip", RemoteFile::new(vec![0; 4]));

        let result = test_connection(&remote, &Url::parse("http://mirror.test/tools/").unwrap()).await;
        assert!(result.success);
        assert!(result.details.unwrap().starts_with("1 个文件, 1 个目录"));
    }

    #[tokio::test]
    async fn test_unreachable_remote() {
        let remote = MemoryRemote::new();
        let result = test_connection(&remote, &Url::parse("http://mirror.test/none/").unwrap()).await;
        assert!(!result.success);
        assert!(result.details.unwrap().contains("404"));
    }

    #[test]
    fn test_local_root_states() {
        let dir = tempfile::tempdir().unwrap();
        assert!(test_local_root(dir.path()).success);
        assert!(test_local_root(&dir.path().join("new")).success);

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(!test_local_root(&file).success);
    }
}
