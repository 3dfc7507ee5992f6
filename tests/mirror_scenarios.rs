use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use mirrortools_lib::core::{
    EngineConfig, MirrorEngine, RetryPolicy, SyncReport, TaskPlan, TransferReason,
};
use mirrortools_lib::error::ErrorKind;
use mirrortools_lib::testing::{MemoryRemote, RemoteFile};
use reqwest::Url;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ROOT: &str = "http://mirror.test/tools/";
const A_ISO: &str = "http://mirror.test/tools/a.iso";
const B_ZIP: &str = "http://mirror.test/tools/patches/b.zip";

fn engine(remote: &Arc<MemoryRemote>, local_root: &Path) -> MirrorEngine {
    engine_with(remote, local_root, |_| {})
}

fn engine_with(
    remote: &Arc<MemoryRemote>,
    local_root: &Path,
    tweak: impl FnOnce(&mut EngineConfig),
) -> MirrorEngine {
    let mut config = EngineConfig::new(Url::parse(ROOT).unwrap(), local_root);
    config.retry = RetryPolicy::new(3, Duration::from_millis(1));
    config.scheduler.concurrency = 4;
    config.scheduler.cancel_grace = Duration::from_millis(200);
    tweak(&mut config);
    MirrorEngine::new(remote.clone(), config).unwrap()
}

fn counts(report: &SyncReport) -> (usize, usize, usize, usize) {
    (
        report.total_discovered,
        report.downloaded,
        report.skipped,
        report.failed,
    )
}

fn tools_tree() -> Arc<MemoryRemote> {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.add_file(A_ISO, RemoteFile::new(vec![0xA1; 1000]).modified(t0));
    remote.add_file(B_ZIP, RemoteFile::new(vec![0xB2; 500]));
    remote
}

#[tokio::test]
async fn first_run_second_run_and_growth() {
    let dir = tempfile::tempdir().unwrap();
    let remote = tools_tree();
    let cancel = CancellationToken::new();

    let first = engine(&remote, dir.path()).run(&cancel).await.unwrap();
    assert_eq!(counts(&first), (2, 2, 0, 0));
    assert_eq!(first.bytes_transferred, 1500);
    assert_eq!(std::fs::read(dir.path().join("a.iso")).unwrap(), vec![0xA1; 1000]);
    assert_eq!(
        std::fs::read(dir.path().join("patches").join("b.zip")).unwrap(),
        vec![0xB2; 500]
    );

    let second = engine(&remote, dir.path()).run(&cancel).await.unwrap();
    assert_eq!(counts(&second), (2, 0, 2, 0));
    assert_eq!(remote.total_opens(), 2);

    // a.iso 变为 1200 字节
    let t1 = Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap();
    remote.add_file(A_ISO, RemoteFile::new(vec![0xA3; 1200]).modified(t1));

    let third = engine(&remote, dir.path()).run(&cancel).await.unwrap();
    assert_eq!((third.downloaded, third.skipped), (1, 1));
    assert_eq!(std::fs::metadata(dir.path().join("a.iso")).unwrap().len(), 1200);
}

#[tokio::test]
async fn transient_probe_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let remote = tools_tree();
    remote.fail_probe(B_ZIP, 2);

    let report = engine(&remote, dir.path())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(counts(&report), (2, 2, 0, 0));
    assert_eq!(remote.probe_calls(B_ZIP), 3);
    assert!(dir.path().join("patches").join("b.zip").exists());
}

#[tokio::test]
async fn exhausted_probe_retries_fail_only_that_file() {
    let dir = tempfile::tempdir().unwrap();
    let remote = tools_tree();
    remote.fail_probe(B_ZIP, u32::MAX);

    let report = engine(&remote, dir.path())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(counts(&report), (2, 1, 0, 1));
    assert_eq!(report.failures[0].url, B_ZIP);
    assert_eq!(report.failures[0].error.kind, ErrorKind::Fetch);
    assert!(report.has_failures());
}

#[tokio::test]
async fn self_referential_listing_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let remote = tools_tree();
    remote.add_link(ROOT, "./");
    remote.add_link("http://mirror.test/tools/patches/", "./");
    remote.add_link("http://mirror.test/tools/patches/", "http://mirror.test/tools/");

    let report = engine(&remote, dir.path())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(counts(&report), (2, 2, 0, 0));
    assert_eq!(report.walk_errors.len(), 3);
    assert!(report
        .walk_errors
        .iter()
        .all(|e| e.error.kind == ErrorKind::Structural));
}

#[tokio::test]
async fn walk_yields_one_task_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let mut expected = HashSet::new();
    for d in 0..5 {
        for f in 0..7 {
            let rel = format!("dir{}/sub{}/file{}.bin", d, d % 2, f);
            remote.add_file(&format!("{}{}", ROOT, rel), RemoteFile::new(vec![f as u8; 16]));
            expected.insert(rel);
        }
    }

    let result = engine(&remote, dir.path())
        .plan(&CancellationToken::new())
        .await;

    assert_eq!(result.tasks.len(), 35);
    assert!(result.errors.is_empty());
    let destinations: HashSet<_> = result.tasks.iter().map(|t| t.destination.clone()).collect();
    assert_eq!(destinations.len(), 35);
    let relatives: HashSet<_> = result.tasks.iter().map(|t| t.relative_path.clone()).collect();
    assert_eq!(relatives, expected);
    // 1 个根目录 + 5 个一级目录 + 5 个二级目录
    assert_eq!(result.directories, 11);
}

#[tokio::test]
async fn interrupted_download_keeps_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let remote = tools_tree();
    engine(&remote, dir.path())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    // 新版本在每次传输中途都断开
    remote.add_file(
        A_ISO,
        RemoteFile::new(vec![0xEE; 1200])
            .chunk_size(100)
            .fail_body_after(600),
    );
    let report = engine(&remote, dir.path())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(std::fs::read(dir.path().join("a.iso")).unwrap(), vec![0xA1; 1000]);
    assert!(!dir.path().join("a.iso.mirror-part").exists());
}

#[tokio::test]
async fn unverifiable_files_follow_policy() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.add_file(A_ISO, RemoteFile::new(vec![1; 10]).unknown_metadata());
    let cancel = CancellationToken::new();

    engine(&remote, dir.path()).run(&cancel).await.unwrap();

    let again = engine(&remote, dir.path()).run(&cancel).await.unwrap();
    assert_eq!(again.downloaded, 1);

    let skipped = engine_with(&remote, dir.path(), |c| c.compare.transfer_unverifiable = false)
        .run(&cancel)
        .await
        .unwrap();
    assert_eq!((skipped.downloaded, skipped.skipped), (0, 1));
}

#[tokio::test]
async fn content_etag_detects_same_size_change() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let old = b"hello".to_vec();
    remote.add_file(
        A_ISO,
        RemoteFile::new(old.clone()).etag(format!("\"{:x}\"", md5::compute(&old))),
    );
    let cancel = CancellationToken::new();

    engine(&remote, dir.path()).run(&cancel).await.unwrap();
    let unchanged = engine(&remote, dir.path()).run(&cancel).await.unwrap();
    assert_eq!(unchanged.skipped, 1);

    let new = b"world".to_vec();
    remote.add_file(
        A_ISO,
        RemoteFile::new(new.clone()).etag(format!("\"{:x}\"", md5::compute(&new))),
    );
    let plan = engine(&remote, dir.path()).plan(&cancel).await;
    assert_eq!(
        plan.tasks[0].plan,
        TaskPlan::Transfer(TransferReason::EntityTagChanged)
    );

    let changed = engine(&remote, dir.path()).run(&cancel).await.unwrap();
    assert_eq!(changed.downloaded, 1);
    assert_eq!(std::fs::read(dir.path().join("a.iso")).unwrap(), new);
}

#[tokio::test]
async fn remote_newer_mtime_triggers_download() {
    let dir = tempfile::tempdir().unwrap();
    let remote = tools_tree();
    let cancel = CancellationToken::new();
    engine(&remote, dir.path()).run(&cancel).await.unwrap();

    let later = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + ChronoDuration::hours(1);
    remote.add_file(A_ISO, RemoteFile::new(vec![0xA1; 1000]).modified(later));

    let plan = engine(&remote, dir.path()).plan(&cancel).await;
    let a = plan
        .tasks
        .iter()
        .find(|t| t.relative_path == "a.iso")
        .unwrap();
    assert_eq!(a.plan, TaskPlan::Transfer(TransferReason::RemoteNewer));

    let tolerant = engine_with(&remote, dir.path(), |c| {
        c.compare.time_tolerance_seconds = 7200;
    })
    .plan(&cancel)
    .await;
    assert!(tolerant.tasks.iter().all(|t| t.plan == TaskPlan::Skip));
}

#[tokio::test]
async fn force_redownloads_everything() {
    let dir = tempfile::tempdir().unwrap();
    let remote = tools_tree();
    let cancel = CancellationToken::new();
    engine(&remote, dir.path()).run(&cancel).await.unwrap();

    let forced = engine_with(&remote, dir.path(), |c| c.walk.force = true)
        .run(&cancel)
        .await
        .unwrap();
    assert_eq!(counts(&forced), (2, 2, 0, 0));
    assert_eq!(remote.total_opens(), 4);
}

#[tokio::test]
async fn cancellation_mid_run_leaves_no_partial_files() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    for i in 0..6 {
        remote.add_file(
            &format!("{}slow{}.bin", ROOT, i),
            RemoteFile::new(vec![i as u8; 2048])
                .chunk_size(64)
                .chunk_delay(Duration::from_millis(10)),
        );
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        trigger.cancel();
    });

    let report = engine_with(&remote, dir.path(), |c| c.scheduler.concurrency = 2)
        .run(&cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.total_discovered, 6);
    assert!(report.failed > 0);
    assert!(report
        .failures
        .iter()
        .all(|f| f.error.kind == ErrorKind::Cancelled));

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".mirror-part"))
        .collect();
    assert!(leftovers.is_empty());
    for i in 0..6 {
        let path = dir.path().join(format!("slow{}.bin", i));
        if path.exists() {
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 2048);
        }
    }
}

#[tokio::test]
async fn failed_listing_records_walk_error_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let remote = tools_tree();
    remote.fail_listing("http://mirror.test/tools/patches/", u32::MAX);

    let report = engine(&remote, dir.path())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(counts(&report), (1, 1, 0, 0));
    assert_eq!(report.walk_errors.len(), 1);
    assert_eq!(report.walk_errors[0].error.kind, ErrorKind::Fetch);
    assert!(report.has_failures());
}
