use crate::core::{CompletionHook, SyncReport};
use crate::error::{MirrorError, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 同步完成后执行一条 shell 命令
///
/// 命令通过环境变量获得本次运行的结果：
/// `MIRROR_DOWNLOADED`、`MIRROR_FAILED`、`MIRROR_LOCAL_ROOT`、`MIRROR_RUN_ID`。
pub struct ShellHook {
    command: String,
    run_on_no_change: bool,
}

impl ShellHook {
    pub fn new(command: impl Into<String>, run_on_no_change: bool) -> Self {
        Self {
            command: command.into(),
            run_on_no_change,
        }
    }

    /// 只有没有任何失败、且确实下载了文件时才执行
    pub fn should_run(&self, report: &SyncReport) -> bool {
        !report.cancelled
            && !report.has_failures()
            && (report.downloaded > 0 || self.run_on_no_change)
    }

    fn build_command(&self, report: &SyncReport) -> Command {
        #[cfg(target_os = "windows")]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", &self.command]);
            cmd
        };

        #[cfg(not(target_os = "windows"))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", &self.command]);
            cmd
        };

        cmd.env("MIRROR_DOWNLOADED", report.downloaded.to_string())
            .env("MIRROR_FAILED", report.failed.to_string())
            .env("MIRROR_LOCAL_ROOT", &report.local_root)
            .env("MIRROR_RUN_ID", &report.run_id)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CompletionHook for ShellHook {
    async fn on_complete(&self, report: &SyncReport) -> Result<()> {
        if !self.should_run(report) {
            info!(
                "跳过完成命令 (下载 {}, 失败 {}, 目录错误 {})",
                report.downloaded,
                report.failed,
                report.walk_errors.len()
            );
            return Ok(());
        }

        info!("执行完成命令: {}", self.command);
        let output = self
            .build_command(report)
            .output()
            .await
            .map_err(|e| MirrorError::Hook(format!("无法启动命令 {}: {}", self.command, e)))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("[hook] {}", line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!("[hook] {}", line);
        }

        if !output.status.success() {
            return Err(MirrorError::Hook(format!(
                "{} 退出状态 {}",
                self.command, output.status
            )));
        }
        Ok(())
    }
}
