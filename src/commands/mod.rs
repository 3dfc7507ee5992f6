pub mod shell;
pub mod sync;
pub mod test;

pub use shell::ShellHook;
pub use sync::{analyze_job, build_engine, plan_lines, start_sync, write_report};
pub use test::{test_connection, test_local_root, TestConnectionResult};
