pub mod comparator;
pub mod engine;
pub mod file_state;
pub mod report;
pub mod retry;
pub mod scanner;
pub mod transfer;

pub use comparator::{ChangeDetector, CompareConfig, Decision, EtagAlgorithm, TransferReason};
pub use engine::{
    effective_concurrency, CompletionHook, EngineConfig, MirrorEngine, Scheduler, SchedulerConfig,
    SyncPhase, SyncProgress, MAX_CONCURRENT_TRANSFERS,
};
pub use file_state::{HashAlgorithm, LocalFileState};
pub use report::{FailedTransfer, SyncReport};
pub use retry::RetryPolicy;
pub use scanner::{TreeWalker, WalkConfig, WalkError, WalkResult};
pub use transfer::{Downloader, TaskPlan, TransferOutcome, TransferStatus, TransferTask};
