//! 基础设施模块
//!
//! 封装外部依赖（命令执行、重试）

pub mod command;
pub mod retry;

pub use command::{CommandError, CommandExecutor, CommandOutput, CommandRunner, CommandSpec};
pub use retry::{run_with_retry, RetryOutcome, RetryPolicy};
