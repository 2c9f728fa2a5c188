//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - 超时控制（超时或取消时杀掉子进程）
//! - 取消支持
//! - stdout/stderr 分离

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::env::constants::COMMAND_TIMEOUT_SECS;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(std::io::Error),
    /// 命令超时
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    /// 命令被取消
    #[error("Command was cancelled")]
    Cancelled,
}

/// 一条外部命令
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            work_dir: None,
            timeout: Duration::from_secs(COMMAND_TIMEOUT_SECS),
        }
    }

    /// 使用 sh -c 执行命令字符串
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new("sh", ["-c".to_string(), command.into()])
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// 命令执行结果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// 被信号杀死时为 None
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// 命令执行抽象
///
/// 编排器只依赖这个 trait，测试中可以替换成记录型实现
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError>;
}

/// 命令执行器
pub struct CommandRunner;

impl CommandRunner {
    /// 执行命令，支持超时和取消
    ///
    /// 子进程设置了 kill_on_drop，超时或取消时 future 被丢弃即杀掉进程
    pub async fn run(
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.work_dir {
            command.current_dir(dir);
        }

        debug!(command = %spec, "Running command");

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(command = %spec, "Command cancelled, killing process");
                return Err(CommandError::Cancelled);
            }
            _ = tokio::time::sleep(spec.timeout) => {
                warn!(command = %spec, timeout = ?spec.timeout, "Command timed out");
                return Err(CommandError::Timeout(spec.timeout));
            }
            result = command.output() => result.map_err(CommandError::SpawnFailed)?,
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// 执行简单命令（无取消）
    ///
    /// 用于工具探测这类只关心是否成功的场景
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(CommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout(timeout))
            }
        }
    }

    /// 程序是否可用（`<program> <args>` 能成功退出）
    pub async fn is_available(program: &str, args: &[&str], timeout: Duration) -> bool {
        match Self::run_simple(program, args, Path::new("/"), timeout).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl CommandExecutor for CommandRunner {
    async fn execute(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        Self::run(spec, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_simple_success() {
        let result = CommandRunner::run_simple(
            "echo",
            &["hello"],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = CommandRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_run_captures_exit_code() {
        let spec = CommandSpec::shell("echo out; echo err >&2; exit 3");
        let output = CommandRunner::run(&spec, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let spec = CommandSpec::new("sleep", ["5"]).with_timeout(Duration::from_millis(100));
        let result = CommandRunner::run(&spec, &CancellationToken::new()).await;
        assert!(matches!(result, Err(CommandError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let spec = CommandSpec::new("sleep", ["5"]);
        let result = CommandRunner::run(&spec, &cancel).await;
        assert!(matches!(result, Err(CommandError::Cancelled)));
    }

    #[test]
    fn test_spec_display_quotes_spaces() {
        let spec = CommandSpec::shell("rm -f /tmp/x");
        assert_eq!(spec.to_string(), "sh -c \"rm -f /tmp/x\"");
    }
}
