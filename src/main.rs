use clap::{ArgAction, Args, Parser, Subcommand};
use mirrortools_lib::commands;
use mirrortools_lib::logging::{default_log_dir, LogConfig, SizeRotatingWriter};
use mirrortools_lib::remote::HttpRemote;
use mirrortools_lib::MirrorConfig;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

const EXIT_FAILURES: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "mirrortools", version, about = "把 HTTP 目录索引镜像到本地，只下载新增或变更的文件")]
struct Cli {
    /// 配置文件路径（默认 <配置目录>/mirrortools/config.json）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 提高日志级别（可重复）
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// 降低日志级别（可重复）
    #[arg(short, long, action = ArgAction::Count, global = true)]
    quiet: u8,

    /// 日志目录
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 执行一次镜像
    Sync {
        #[command(flatten)]
        overrides: Overrides,

        /// 把同步报告写成 JSON
        #[arg(long)]
        report_json: Option<PathBuf>,

        /// 有失败时以状态码 1 退出
        #[arg(long)]
        fail_on_error: bool,
    },
    /// 只扫描和比较，列出将要下载的文件
    Plan {
        #[command(flatten)]
        overrides: Overrides,

        /// 同时列出会跳过的文件
        #[arg(long)]
        all: bool,
    },
    /// 检查远程根目录是否可达
    Check {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// 覆盖配置文件中的值
#[derive(Args, Default)]
struct Overrides {
    /// 远程根目录 URL
    #[arg(long)]
    remote_url: Option<String>,

    /// 本地根目录
    #[arg(long)]
    local_root: Option<PathBuf>,

    /// 最大并发下载数（0 = 自动）
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// 忽略变更判断，全部重新下载
    #[arg(long)]
    force: bool,

    /// 镜像到 <local_root>/YYYY-MM-DD
    #[arg(long)]
    dated: bool,

    /// 额外的请求头，格式 `Name: value`（可重复）
    #[arg(long = "header", value_name = "NAME: VALUE")]
    headers: Vec<String>,
}

impl Overrides {
    fn apply(&self, config: &mut MirrorConfig) -> anyhow::Result<()> {
        if let Some(url) = &self.remote_url {
            config.remote_url = url.clone();
        }
        if let Some(root) = &self.local_root {
            config.local_root = root.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if self.force {
            config.force = true;
        }
        if self.dated {
            config.dated_subdirectory = true;
        }
        for header in &self.headers {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("请求头格式应为 `Name: value`: {}", header))?;
            config
                .headers
                .insert(name.trim().to_string(), value.trim().to_string());
        }
        Ok(())
    }
}

impl Command {
    fn overrides(&self) -> &Overrides {
        match self {
            Command::Sync { overrides, .. }
            | Command::Plan { overrides, .. }
            | Command::Check { overrides } => overrides,
        }
    }
}

/// 初始化日志系统
fn init_logging(config: &LogConfig, log_dir: &Path, verbose: u8, quiet: u8) {
    let level = config.adjusted_level(verbose, quiet);
    let mut env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = if config.enabled {
        match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
            Ok(file_writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(false),
            ),
            Err(e) => {
                eprintln!("无法创建日志文件 {}: {}", log_dir.display(), e);
                None
            }
        }
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Ctrl-C 时取消运行；第二次 Ctrl-C 直接退出
fn install_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("收到中断信号，正在取消（再按一次立即退出）...");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(EXIT_CANCELLED as i32);
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(MirrorConfig::default_path);
    let mut config = match MirrorConfig::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let log_dir = cli.log_dir.clone().unwrap_or_else(default_log_dir);
    init_logging(&config.log, &log_dir, cli.verbose, cli.quiet);

    if let Err(e) = cli.command.overrides().apply(&mut config) {
        error!("{:#}", e);
        return ExitCode::from(EXIT_CONFIG);
    }
    let root_url = match config.validate() {
        Ok(url) => url,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let cancel = CancellationToken::new();
    install_ctrl_c(cancel.clone());

    match cli.command {
        Command::Sync {
            report_json,
            fail_on_error,
            ..
        } => {
            let report = match commands::start_sync(&config, &cancel, report_json.as_deref()).await {
                Ok(report) => report,
                Err(e) => {
                    error!("同步失败: {:#}", e);
                    return ExitCode::from(EXIT_FAILURES);
                }
            };
            for line in report.summary_lines() {
                println!("{}", line);
            }

            if report.cancelled {
                ExitCode::from(EXIT_CANCELLED)
            } else if fail_on_error && report.has_failures() {
                ExitCode::from(EXIT_FAILURES)
            } else {
                ExitCode::SUCCESS
            }
        }
        Command::Plan { all, .. } => {
            let result = match commands::analyze_job(&config, &cancel).await {
                Ok(result) => result,
                Err(e) => {
                    error!("扫描失败: {:#}", e);
                    return ExitCode::from(EXIT_FAILURES);
                }
            };
            for line in commands::plan_lines(&result, all) {
                println!("{}", line);
            }
            if cancel.is_cancelled() {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::SUCCESS
            }
        }
        Command::Check { .. } => {
            let remote = match HttpRemote::new(config.http_config()) {
                Ok(remote) => remote,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::from(EXIT_CONFIG);
                }
            };

            let remote_result = commands::test_connection(&remote, &root_url).await;
            let local_result = commands::test_local_root(&config.local_root);
            for (what, result) in [("远程", &remote_result), ("本地", &local_result)] {
                println!(
                    "{}: {} {}",
                    what,
                    result.message,
                    result.details.as_deref().unwrap_or_default()
                );
            }
            info!("检查完成: {}", root_url);

            if remote_result.success && local_result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_FAILURES)
            }
        }
    }
}
