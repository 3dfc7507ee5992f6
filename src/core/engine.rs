use crate::core::comparator::{ChangeDetector, CompareConfig};
use crate::core::report::SyncReport;
use crate::core::retry::RetryPolicy;
use crate::core::scanner::{TreeWalker, WalkConfig, WalkResult};
use crate::core::transfer::{sweep_staging_files, Downloader, TaskPlan, TransferOutcome, TransferStatus, TransferTask};
use crate::error::{ErrorInfo, ErrorKind, MirrorError, Result};
use crate::remote::{ContentSource, ListingClient, MetadataProbe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 并发传输数上限
pub const MAX_CONCURRENT_TRANSFERS: usize = 16;

/// 实际并发数：0 表示 2 × CPU 核数，结果限制在 1..=16
pub fn effective_concurrency(configured: usize) -> usize {
    let wanted = if configured == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            * 2
    } else {
        configured
    };
    wanted.clamp(1, MAX_CONCURRENT_TRANSFERS)
}

/// 同步阶段
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Scanning,
    Transferring,
    Completed,
    Cancelled,
}

/// 进度事件
#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub files_total: u64,
    pub files_completed: u64,
    pub files_failed: u64,
    pub bytes_transferred: u64,
    /// 字节/秒
    pub speed: u64,
}

/// 传输统计
#[derive(Debug, Default)]
struct TransferStats {
    files_completed: AtomicU64,
    files_failed: AtomicU64,
    bytes_transferred: AtomicU64,
}

impl TransferStats {
    fn record(&self, outcome: &TransferOutcome) {
        match outcome.status {
            TransferStatus::Failed => {
                self.files_failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.files_completed.fetch_add(1, Ordering::Relaxed);
                self.bytes_transferred
                    .fetch_add(outcome.bytes_transferred, Ordering::Relaxed);
            }
        }
    }
}

/// 调度配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 最大并发传输数（0 = 自动）
    pub concurrency: usize,
    /// 取消后等待进行中传输的时间，超时后强制中止
    pub cancel_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            cancel_grace: Duration::from_secs(10),
        }
    }
}

/// 在有限并发下执行任务集合
pub struct Scheduler {
    downloader: Arc<Downloader>,
    config: SchedulerConfig,
    progress_tx: Option<mpsc::Sender<SyncProgress>>,
}

impl Scheduler {
    pub fn new(downloader: Arc<Downloader>, config: SchedulerConfig) -> Self {
        Self {
            downloader,
            config,
            progress_tx: None,
        }
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<SyncProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// 执行所有任务，每个任务恰好产生一个结果
    pub async fn run(&self, tasks: Vec<TransferTask>, cancel: &CancellationToken) -> SyncReport {
        let mut report = SyncReport::new(Utc::now());
        let concurrency = effective_concurrency(self.config.concurrency);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let stats = Arc::new(TransferStats::default());
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferOutcome>();

        let files_total = tasks.len() as u64;
        let to_transfer = tasks
            .iter()
            .filter(|t| matches!(t.plan, TaskPlan::Transfer(_)))
            .count();
        info!("开始传输: {} 个任务, {} 个需要下载, 并发数 {}", tasks.len(), to_transfer, concurrency);

        let progress_handle = self.spawn_progress_reporter(stats.clone(), files_total);

        let mut handles = Vec::new();
        for task in tasks {
            let reason = match &task.plan {
                TaskPlan::Skip => {
                    let outcome = TransferOutcome::skipped(task);
                    stats.record(&outcome);
                    let _ = tx.send(outcome);
                    continue;
                }
                TaskPlan::Failed(error) => {
                    let error = error.clone();
                    let outcome = TransferOutcome::failed(task, error, 0, Duration::ZERO);
                    stats.record(&outcome);
                    let _ = tx.send(outcome);
                    continue;
                }
                TaskPlan::Transfer(reason) => *reason,
            };

            // 取消后不再派发新任务
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let outcome = cancelled_outcome(task);
                stats.record(&outcome);
                let _ = tx.send(outcome);
                continue;
            };

            debug!("开始下载 ({}): {}", reason, task.relative_path);
            let downloader = self.downloader.clone();
            let stats = stats.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let fallback = task.clone();

            let handle = tokio::spawn(async move {
                let outcome = downloader.transfer(task, &cancel).await;
                stats.record(&outcome);
                let _ = tx.send(outcome);
                drop(permit);
            });
            handles.push((fallback, handle));
        }

        // 等待所有任务完成；取消后超过宽限期则强制中止
        let abort_handles: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();
        let join_all = async {
            let mut results = Vec::with_capacity(handles.len());
            for (task, handle) in handles {
                results.push((task, handle.await));
            }
            results
        };
        tokio::pin!(join_all);

        let grace = self.config.cancel_grace;
        let results = tokio::select! {
            results = &mut join_all => results,
            _ = async {
                cancel.cancelled().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!("取消宽限期 {}s 已过，中止剩余传输", grace.as_secs());
                for handle in &abort_handles {
                    handle.abort();
                }
                join_all.await
            }
        };

        for (task, result) in results {
            if let Err(e) = result {
                let outcome = if e.is_cancelled() {
                    cancelled_outcome(task)
                } else {
                    error!("传输任务异常退出: {} - {}", task.source_url, e);
                    TransferOutcome::failed(
                        task,
                        ErrorInfo {
                            kind: ErrorKind::Io,
                            message: format!("传输任务异常退出: {}", e),
                        },
                        0,
                        Duration::ZERO,
                    )
                };
                stats.record(&outcome);
                let _ = tx.send(outcome);
            }
        }

        if let Some(handle) = progress_handle {
            handle.abort();
        }

        // 单一汇总点
        drop(tx);
        while let Some(outcome) = rx.recv().await {
            report.record(outcome);
        }
        report.finish(cancel.is_cancelled());
        report
    }

    /// 每 500ms 发送一次进度
    fn spawn_progress_reporter(
        &self,
        stats: Arc<TransferStats>,
        files_total: u64,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let tx = self.progress_tx.clone()?;
        Some(tokio::spawn(async move {
            let mut last_bytes = 0u64;
            let mut last_time = Instant::now();

            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;

                let completed = stats.files_completed.load(Ordering::Relaxed);
                let failed = stats.files_failed.load(Ordering::Relaxed);
                let bytes = stats.bytes_transferred.load(Ordering::Relaxed);

                let now = Instant::now();
                let elapsed = now.duration_since(last_time).as_secs_f64();
                let speed = if elapsed > 0.0 {
                    (bytes.saturating_sub(last_bytes) as f64 / elapsed) as u64
                } else {
                    0
                };
                last_bytes = bytes;
                last_time = now;

                let progress = SyncProgress {
                    phase: SyncPhase::Transferring,
                    files_total,
                    files_completed: completed,
                    files_failed: failed,
                    bytes_transferred: bytes,
                    speed,
                };
                if tx.send(progress).await.is_err() || completed + failed >= files_total {
                    break;
                }
            }
        }))
    }
}

fn cancelled_outcome(task: TransferTask) -> TransferOutcome {
    TransferOutcome::failed(task, ErrorInfo::from(MirrorError::Cancelled), 0, Duration::ZERO)
}

/// 运行结束事件
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_complete(&self, report: &SyncReport) -> Result<()>;
}

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub remote_url: Url,
    pub local_root: PathBuf,
    /// 写入 `<local_root>/YYYY-MM-DD`
    pub dated_subdirectory: bool,
    pub walk: WalkConfig,
    pub compare: CompareConfig,
    pub retry: RetryPolicy,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    pub fn new(remote_url: Url, local_root: impl Into<PathBuf>) -> Self {
        Self {
            remote_url,
            local_root: local_root.into(),
            dated_subdirectory: false,
            walk: WalkConfig::default(),
            compare: CompareConfig::default(),
            retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// 镜像引擎：扫描 → 调度 → 报告 → 完成事件
pub struct MirrorEngine {
    walker: TreeWalker,
    downloader: Arc<Downloader>,
    config: EngineConfig,
    hooks: Vec<Arc<dyn CompletionHook>>,
    progress_tx: Option<mpsc::Sender<SyncProgress>>,
}

impl MirrorEngine {
    /// 用同一个远程实现提供全部三种能力
    pub fn new<R>(remote: Arc<R>, config: EngineConfig) -> Result<Self>
    where
        R: ListingClient + MetadataProbe + ContentSource + 'static,
    {
        Self::with_parts(remote.clone(), remote.clone(), remote, config)
    }

    pub fn with_parts(
        lister: Arc<dyn ListingClient>,
        prober: Arc<dyn MetadataProbe>,
        source: Arc<dyn ContentSource>,
        config: EngineConfig,
    ) -> Result<Self> {
        let walker = TreeWalker::new(
            lister,
            prober,
            ChangeDetector::new(config.compare.clone()),
            config.retry.clone(),
            config.walk.clone(),
        )?;
        let downloader = Arc::new(Downloader::new(source, config.retry.clone()));
        Ok(Self {
            walker,
            downloader,
            config,
            hooks: Vec::new(),
            progress_tx: None,
        })
    }

    pub fn add_hook(&mut self, hook: Arc<dyn CompletionHook>) {
        self.hooks.push(hook);
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<SyncProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 本次运行实际写入的根目录
    pub fn local_root_at(&self, at: DateTime<Utc>) -> PathBuf {
        if self.config.dated_subdirectory {
            self.config
                .local_root
                .join(at.format("%Y-%m-%d").to_string())
        } else {
            self.config.local_root.clone()
        }
    }

    /// 只扫描和判断，不下载
    pub async fn plan(&self, cancel: &CancellationToken) -> WalkResult {
        let local_root = self.local_root_at(Utc::now());
        self.walker
            .walk(&self.config.remote_url, &local_root, cancel)
            .await
    }

    /// 执行一次完整的镜像
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let started_at = Utc::now();
        let local_root = self.local_root_at(started_at);
        info!("开始镜像: {} -> {}", self.config.remote_url, local_root.display());

        tokio::fs::create_dir_all(&local_root)
            .await
            .map_err(|e| MirrorError::io(&local_root, e))?;
        if let Err(e) = sweep_staging_files(&local_root).await {
            warn!("清理暂存文件失败: {}", e);
        }

        self.send_progress(SyncPhase::Scanning, 0).await;
        let walk = self
            .walker
            .walk(&self.config.remote_url, &local_root, cancel)
            .await;

        self.send_progress(SyncPhase::Transferring, walk.tasks.len() as u64)
            .await;
        let mut scheduler = Scheduler::new(self.downloader.clone(), self.config.scheduler.clone());
        if let Some(tx) = &self.progress_tx {
            scheduler = scheduler.with_progress(tx.clone());
        }
        let mut report = scheduler.run(walk.tasks, cancel).await;

        report.started_at = started_at;
        report.local_root = local_root;
        report.walk_errors = walk.errors;
        report.finish(cancel.is_cancelled());

        for line in report.summary_lines() {
            info!("{}", line);
        }

        if report.cancelled {
            self.send_progress(SyncPhase::Cancelled, report.total_discovered as u64)
                .await;
            info!("镜像已取消，跳过完成事件");
            return Ok(report);
        }

        self.send_progress(SyncPhase::Completed, report.total_discovered as u64)
            .await;
        for hook in &self.hooks {
            if let Err(e) = hook.on_complete(&report).await {
                error!("完成事件处理失败: {}", e);
            }
        }

        Ok(report)
    }

    async fn send_progress(&self, phase: SyncPhase, files_total: u64) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx
                .send(SyncProgress {
                    phase,
                    files_total,
                    files_completed: 0,
                    files_failed: 0,
                    bytes_transferred: 0,
                    speed: 0,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comparator::TransferReason;
    use crate::testing::{MemoryRemote, RemoteFile};
    use std::sync::Mutex;

    fn task(remote: &MemoryRemote, dir: &std::path::Path, name: &str, plan: TaskPlan) -> TransferTask {
        let url = Url::parse(&format!("http://mirror.test/tools/{}", name)).unwrap();
        TransferTask {
            remote: remote.metadata_of(&url).unwrap_or_default(),
            source_url: url,
            relative_path: name.to_string(),
            destination: dir.join(name),
            plan,
        }
    }

    fn scheduler(remote: &Arc<MemoryRemote>, concurrency: usize) -> Scheduler {
        let downloader = Downloader::new(remote.clone(), RetryPolicy::new(1, Duration::from_millis(1)));
        Scheduler::new(
            Arc::new(downloader),
            SchedulerConfig {
                concurrency,
                cancel_grace: Duration::from_millis(50),
            },
        )
    }

    #[test]
    fn test_effective_concurrency() {
        assert_eq!(effective_concurrency(1), 1);
        assert_eq!(effective_concurrency(8), 8);
        assert_eq!(effective_concurrency(100), MAX_CONCURRENT_TRANSFERS);
        let auto = effective_concurrency(0);
        assert!((1..=MAX_CONCURRENT_TRANSFERS).contains(&auto));
    }

    #[tokio::test]
    async fn test_every_task_yields_one_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        for i in 0..10 {
            remote.add_file(
                &format!("http://mirror.test/tools/f{}.bin", i),
                RemoteFile::new(vec![i as u8; 100]),
            );
        }

        let mut tasks: Vec<_> = (0..10)
            .map(|i| {
                task(
                    &remote,
                    dir.path(),
                    &format!("f{}.bin", i),
                    TaskPlan::Transfer(TransferReason::Missing),
                )
            })
            .collect();
        tasks.push(task(&remote, dir.path(), "skip.bin", TaskPlan::Skip));
        tasks.push(task(
            &remote,
            dir.path(),
            "gone.bin",
            TaskPlan::Failed(ErrorInfo {
                kind: ErrorKind::Fetch,
                message: "HTTP 404".to_string(),
            }),
        ));

        let report = scheduler(&remote, 3)
            .run(tasks, &CancellationToken::new())
            .await;

        assert_eq!(report.total_discovered, 12);
        assert_eq!(report.downloaded, 10);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.bytes_transferred, 1000);
        assert!(!report.cancelled);
        assert!(remote.max_concurrent_opens() <= 3);
    }

    #[tokio::test]
    async fn test_failing_task_does_not_affect_others() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file("http://mirror.test/tools/ok.bin", RemoteFile::new(vec![1; 10]));
        remote.add_file(
            "http://mirror.test/tools/bad.bin",
            RemoteFile::new(vec![1; 10]).declared_size(20),
        );

        let tasks = vec![
            task(&remote, dir.path(), "ok.bin", TaskPlan::Transfer(TransferReason::Missing)),
            task(&remote, dir.path(), "bad.bin", TaskPlan::Transfer(TransferReason::Missing)),
        ];
        let report = scheduler(&remote, 2)
            .run(tasks, &CancellationToken::new())
            .await;

        assert_eq!(report.downloaded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].error.kind, ErrorKind::SizeMismatch);
        assert!(dir.path().join("ok.bin").exists());
        assert!(!dir.path().join("bad.bin").exists());
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_marks_tasks_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file("http://mirror.test/tools/a.bin", RemoteFile::new(vec![1; 10]));
        remote.add_file("http://mirror.test/tools/b.bin", RemoteFile::new(vec![1; 10]));

        let tasks = vec![
            task(&remote, dir.path(), "a.bin", TaskPlan::Transfer(TransferReason::Missing)),
            task(&remote, dir.path(), "b.bin", TaskPlan::Transfer(TransferReason::Missing)),
            task(&remote, dir.path(), "c.bin", TaskPlan::Skip),
        ];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = scheduler(&remote, 2).run(tasks, &cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.total_discovered, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 2);
        assert!(report
            .failures
            .iter()
            .all(|f| f.error.kind == ErrorKind::Cancelled));
        assert_eq!(remote.open_calls("http://mirror.test/tools/a.bin"), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_in_flight_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file(
            "http://mirror.test/tools/slow.bin",
            RemoteFile::new(vec![1; 4096])
                .chunk_size(16)
                .chunk_delay(Duration::from_millis(20)),
        );

        let tasks = vec![task(
            &remote,
            dir.path(),
            "slow.bin",
            TaskPlan::Transfer(TransferReason::Missing),
        )];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let report = scheduler(&remote, 1).run(tasks, &cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].error.kind, ErrorKind::Cancelled);
        assert!(!dir.path().join("slow.bin").exists());
        assert!(!dir.path().join("slow.bin.mirror-part").exists());
    }

    struct RecordingHook {
        reports: Mutex<Vec<(usize, usize)>>,
    }

    #[async_trait]
    impl CompletionHook for RecordingHook {
        async fn on_complete(&self, report: &SyncReport) -> Result<()> {
            self.reports
                .lock()
                .unwrap()
                .push((report.downloaded, report.skipped));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_engine_runs_hook_and_dated_root() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file("http://mirror.test/tools/a.iso", RemoteFile::new(vec![1; 100]));

        let mut config = EngineConfig::new(
            Url::parse("http://mirror.test/tools/").unwrap(),
            dir.path(),
        );
        config.dated_subdirectory = true;
        config.retry = RetryPolicy::none();

        let hook = Arc::new(RecordingHook {
            reports: Mutex::new(Vec::new()),
        });
        let mut engine = MirrorEngine::new(remote.clone(), config).unwrap();
        engine.add_hook(hook.clone());

        // 上次崩溃留下的暂存文件
        let today = engine.local_root_at(Utc::now());
        std::fs::create_dir_all(&today).unwrap();
        std::fs::write(today.join("old.bin.mirror-part"), b"x").unwrap();

        let report = engine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.local_root, today);
        assert!(today.join("a.iso").exists());
        assert!(!today.join("old.bin.mirror-part").exists());
        assert_eq!(*hook.reports.lock().unwrap(), vec![(1, 0)]);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_hook() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.add_file("http://mirror.test/tools/a.iso", RemoteFile::new(vec![1; 100]));

        let config = EngineConfig::new(
            Url::parse("http://mirror.test/tools/").unwrap(),
            dir.path(),
        );
        let hook = Arc::new(RecordingHook {
            reports: Mutex::new(Vec::new()),
        });
        let mut engine = MirrorEngine::new(remote, config).unwrap();
        engine.add_hook(hook.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = engine.run(&cancel).await.unwrap();

        assert!(report.cancelled);
        assert!(hook.reports.lock().unwrap().is_empty());
    }
}
