use crate::commands::shell::ShellHook;
use crate::config::MirrorConfig;
use crate::core::report::format_bytes;
use crate::core::{MirrorEngine, SyncPhase, SyncProgress, SyncReport, TaskPlan, WalkResult};
use crate::remote::HttpRemote;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 根据配置创建引擎
pub fn build_engine(config: &MirrorConfig) -> anyhow::Result<MirrorEngine> {
    let engine_config = config.engine_config()?;
    let remote = Arc::new(HttpRemote::new(config.http_config())?);
    let mut engine = MirrorEngine::new(remote, engine_config)?;

    if let Some(command) = config
        .post_sync_command
        .as_ref()
        .filter(|c| !c.trim().is_empty())
    {
        engine.add_hook(Arc::new(ShellHook::new(command.clone(), config.hook_on_no_change)));
    }
    Ok(engine)
}

/// 执行一次同步，可选地把报告写成 JSON
pub async fn start_sync(
    config: &MirrorConfig,
    cancel: &CancellationToken,
    report_json: Option<&Path>,
) -> anyhow::Result<SyncReport> {
    let (progress_tx, progress_rx) = mpsc::channel(32);
    let engine = build_engine(config)?.with_progress(progress_tx);
    let progress_handle = tokio::spawn(log_progress(progress_rx));

    let result = engine.run(cancel).await;
    drop(engine);
    let _ = progress_handle.await;
    let report = result?;

    if let Some(path) = report_json {
        write_report(&report, path)?;
        info!("报告已写入: {}", path.display());
    }
    Ok(report)
}

/// 只扫描不下载
pub async fn analyze_job(config: &MirrorConfig, cancel: &CancellationToken) -> anyhow::Result<WalkResult> {
    let engine = build_engine(config)?;
    Ok(engine.plan(cancel).await)
}

/// 扫描结果的文本形式
pub fn plan_lines(result: &WalkResult, show_skipped: bool) -> Vec<String> {
    let mut lines = Vec::new();
    let mut transfer_count = 0;
    let mut transfer_bytes = 0u64;
    let mut skip_count = 0;
    let mut failed_count = 0;

    for task in &result.tasks {
        match &task.plan {
            TaskPlan::Transfer(reason) => {
                transfer_count += 1;
                transfer_bytes += task.remote.size.unwrap_or(0);
                lines.push(format!("  下载 [{}] {}", reason, task.relative_path));
            }
            TaskPlan::Skip => {
                skip_count += 1;
                if show_skipped {
                    lines.push(format!("  跳过 {}", task.relative_path));
                }
            }
            TaskPlan::Failed(error) => {
                failed_count += 1;
                lines.push(format!("  失败 {}: {}", task.relative_path, error));
            }
        }
    }
    for walk_error in &result.errors {
        lines.push(format!("  目录错误 {}: {}", walk_error.url, walk_error.error));
    }

    lines.push(format!(
        "共 {} 个文件: 需要下载 {} ({}), 跳过 {}, 失败 {}, 排除 {}",
        result.tasks.len(),
        transfer_count,
        format_bytes(transfer_bytes),
        skip_count,
        failed_count,
        result.excluded
    ));
    lines
}

/// 写 JSON 报告
pub fn write_report(report: &SyncReport, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("无法创建目录 {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(report)?;
    std::fs::write(path, content).with_context(|| format!("无法写入报告 {}", path.display()))?;
    Ok(())
}

async fn log_progress(mut rx: mpsc::Receiver<SyncProgress>) {
    let mut last_phase = None;
    while let Some(progress) = rx.recv().await {
        if last_phase != Some(progress.phase) {
            match progress.phase {
                SyncPhase::Scanning => info!("正在扫描远程目录..."),
                SyncPhase::Transferring => info!("开始处理 {} 个文件", progress.files_total),
                SyncPhase::Completed => info!("同步完成"),
                SyncPhase::Cancelled => info!("同步已取消"),
            }
            last_phase = Some(progress.phase);
        }
        if progress.phase == SyncPhase::Transferring && progress.files_completed + progress.files_failed > 0 {
            debug!(
                "进度 {}/{} (失败 {}), 已传输 {}, 速度 {}/s",
                progress.files_completed + progress.files_failed,
                progress.files_total,
                progress.files_failed,
                format_bytes(progress.bytes_transferred),
                format_bytes(progress.speed)
            );
        }
    }
}
