pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod remote;
pub mod testing;

pub use config::MirrorConfig;
pub use crate::core::{MirrorEngine, SyncReport};
pub use error::{MirrorError, Result};

/// 配置和日志目录的名称
pub const APP_NAME: &str = "mirrortools";

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux 优先 XDG_CONFIG_HOME
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }

    /// `<配置目录>/mirrortools`，取不到时使用当前目录下的 `.mirrortools`
    pub fn app_config_dir() -> PathBuf {
        config_dir()
            .map(|p| p.join(super::APP_NAME))
            .unwrap_or_else(|| PathBuf::from(format!(".{}", super::APP_NAME)))
    }
}
