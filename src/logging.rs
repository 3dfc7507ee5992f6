//! 日志模块 - 文件日志和大小轮转

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;

/// 日志文件名
pub const LOG_FILE_NAME: &str = "sync.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件的最大大小（MB），超过后轮转为 `.old`
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    /// 在配置级别的基础上按 `-v`/`-q` 调整
    pub fn adjusted_level(&self, verbose: u8, quiet: u8) -> tracing::Level {
        const LEVELS: [tracing::Level; 5] = [
            tracing::Level::ERROR,
            tracing::Level::WARN,
            tracing::Level::INFO,
            tracing::Level::DEBUG,
            tracing::Level::TRACE,
        ];
        let base = LEVELS
            .iter()
            .position(|l| *l == self.tracing_level())
            .unwrap_or(2) as i32;
        let index = (base + verbose as i32 - quiet as i32).clamp(0, LEVELS.len() as i32 - 1);
        LEVELS[index as usize]
    }
}

struct FileState {
    writer: Option<BufWriter<File>>,
    written: u64,
}

/// 带大小限制的日志写入器，超过上限时把 `sync.log` 轮转为 `sync.log.old`
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    state: Arc<Mutex<FileState>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = (max_size_mb.max(1) as u64) * 1024 * 1024;

        let existing = fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
        if existing > max_size {
            rotate_log(&file_path)?;
        }
        let written = fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            state: Arc::new(Mutex::new(FileState {
                writer: Some(open_append(&file_path)?),
                written,
            })),
            file_path,
            max_size,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn open_append(file_path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(file_path)?;
    Ok(BufWriter::new(file))
}

/// 轮转日志文件：sync.log -> sync.log.old（覆盖旧备份）
fn rotate_log(file_path: &Path) -> io::Result<()> {
    let mut backup = file_path.as_os_str().to_os_string();
    backup.push(".old");
    let backup_path = PathBuf::from(backup);

    if backup_path.exists() {
        fs::remove_file(&backup_path)?;
    }
    fs::rename(file_path, &backup_path)
}

/// 单次日志事件的写入句柄
pub struct LogWriter {
    inner: SizeRotatingWriter,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.lock();

        if state.written >= self.inner.max_size {
            if let Some(mut w) = state.writer.take() {
                let _ = w.flush();
            }
            let rotated = rotate_log(&self.inner.file_path);
            state.writer = Some(open_append(&self.inner.file_path)?);
            state.written = 0;
            rotated?;
        }

        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件不可用"))?;
        let n = writer.write(buf)?;
        writer.flush()?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock().writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.clone(),
        }
    }
}

/// 默认日志目录，与配置文件放在一起
pub fn default_log_dir() -> PathBuf {
    crate::dirs::app_config_dir()
}
