//! 外部命令的有界重试
//!
//! 重试只作用于单条命令，不会重启整个流程

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::env::constants::{MAX_RETRIES, RETRY_BASE_DELAY_SECS};

use super::command::{CommandError, CommandExecutor, CommandOutput, CommandSpec};

/// 重试策略：指数退避
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次失败后的最大重试次数
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// 第 n 次重试前的等待（n 从 0 开始）：base, 2*base, 4*base ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_secs(RETRY_BASE_DELAY_SECS),
        }
    }
}

/// 重试结果
#[derive(Debug)]
pub enum RetryOutcome {
    Succeeded { output: CommandOutput, attempts: u32 },
    Exhausted {
        attempts: u32,
        exit_code: Option<i32>,
        reason: String,
    },
    Cancelled,
}

/// 按策略执行命令直到成功、重试耗尽或被取消
pub async fn run_with_retry(
    executor: &dyn CommandExecutor,
    spec: &CommandSpec,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> RetryOutcome {
    let mut attempts = 0;
    let mut last_exit_code = None;
    let mut last_reason = String::new();

    while attempts < policy.max_attempts() {
        if attempts > 0 {
            let delay = policy.delay_for(attempts - 1);
            warn!(
                command = %spec,
                attempt = attempts + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying command"
            );
            tokio::select! {
                _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        attempts += 1;

        match executor.execute(spec, cancel).await {
            Ok(output) if output.success() => {
                return RetryOutcome::Succeeded { output, attempts };
            }
            Ok(output) => {
                last_exit_code = output.exit_code;
                last_reason = format!(
                    "exited with {}: {}",
                    output
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    output.stderr.trim()
                );
            }
            Err(CommandError::Cancelled) => return RetryOutcome::Cancelled,
            Err(e) => {
                last_exit_code = None;
                last_reason = e.to_string();
            }
        }
    }

    RetryOutcome::Exhausted {
        attempts,
        exit_code: last_exit_code,
        reason: last_reason,
    }
}
