//! 日志初始化
//!
//! 控制台输出人类可读格式，同时把 JSON 格式写入 `<log_dir>/deploy-<时间戳>.<pid>.log`。
//! 设置了 RUST_LOG 时两者都以它为准。

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 日志句柄，drop 时刷新文件缓冲
pub struct LogHandle {
    pub path: PathBuf,
    _guard: WorkerGuard,
}

/// 控制台过滤规则
///
/// - 0: info
/// - 1: 本 crate debug (-v)
/// - 2+: 本 crate trace (-vv)
pub fn console_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "info,pacs_deploy=debug",
        _ => "debug,pacs_deploy=trace",
    }
}

/// 文件总是记录 debug，便于事后排查
const FILE_DIRECTIVE: &str = "info,pacs_deploy=debug";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// 安装全局 subscriber
pub fn init(verbosity: u8, log_dir: &Path) -> io::Result<LogHandle> {
    fs::create_dir_all(log_dir)?;

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let file_name = format!("deploy-{}.{}.log", timestamp, process::id());
    let path = log_dir.join(&file_name);

    let file_appender = tracing_appender::rolling::never(log_dir, &file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(filter(console_directive(verbosity))),
        )
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .json()
                .with_filter(filter(FILE_DIRECTIVE)),
        );

    if subscriber.try_init().is_err() {
        tracing::debug!("Global tracing subscriber already initialized");
    }

    tracing::info!(log_file = %path.display(), "Logging initialized");

    Ok(LogHandle {
        path,
        _guard: guard,
    })
}
