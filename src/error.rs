//! 统一错误处理
//!
//! 每类致命错误对应一个退出码：
//! - 1: 探测 / 规划 / 配置生成失败
//! - 2: 应用失败（含中断）
//! - 3: 健康检查失败

use thiserror::Error;

use crate::domain::deploy::{DeployStage, DeployState};
use crate::domain::health::HealthErrorKind;
use crate::domain::manifest::Category;

/// 主机信息不可读
#[derive(Debug, Error)]
#[error("host information unreadable: {0}")]
pub struct ProbeError(pub String);

/// 内部依赖目录缺失某个类别（打包错误，不是运行时问题）
#[derive(Debug, Error)]
#[error("no packages in catalog for category '{category}'")]
pub struct UnresolvableDependencyError {
    pub category: Category,
}

/// 模板渲染失败
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateRenderError {
    #[error("template '{template}' is missing required variable '{variable}'")]
    MissingVariable { template: String, variable: String },

    /// 值无法在目标格式中无歧义地表示
    #[error("template '{template}' cannot represent variable '{variable}': {reason}")]
    InvalidValue {
        template: String,
        variable: String,
        reason: String,
    },

    #[error("template '{template}' failed to render: {reason}")]
    Engine { template: String, reason: String },
}

/// 应用阶段错误
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("step '{step}' failed after {attempts} attempt(s): `{command}` {reason}")]
    StepFailed {
        step: String,
        command: String,
        exit_code: Option<i32>,
        attempts: u32,
        reason: String,
    },

    #[error("interrupted during step '{step}'")]
    Interrupted { step: String },

    #[error("cannot bootstrap dependencies on this host: {0}")]
    Unsupported(String),

    #[error("host still cannot run a deployment after installing dependencies")]
    BootstrapIneffective,
}

/// 协作方在限定时间内始终不可达
#[derive(Debug, Error)]
#[error("{target} not reachable after {waited_secs}s (last error: {last_error:?})")]
pub struct HealthCheckTimeout {
    pub target: String,
    pub waited_secs: u64,
    pub last_error: Option<HealthErrorKind>,
}

/// 部署错误
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Unresolvable(#[from] UnresolvableDependencyError),

    #[error(transparent)]
    Template(#[from] TemplateRenderError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    HealthCheck(#[from] HealthCheckTimeout),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// CLI 退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::Probe(_)
            | DeployError::Unresolvable(_)
            | DeployError::Template(_)
            | DeployError::Config(_)
            | DeployError::Io(_) => 1,
            DeployError::Apply(_) => 2,
            DeployError::HealthCheck(_) => 3,
        }
    }
}

/// 一次失败的部署运行
///
/// 带上最后完成的状态和失败的步骤，供 CLI 输出
#[derive(Debug, Error)]
#[error("deployment failed in {failed_state} at step '{step}': {source}")]
pub struct RunFailure {
    pub last_completed: DeployState,
    pub failed_state: DeployState,
    pub step: String,
    pub source: DeployError,
    pub stages: Vec<DeployStage>,
}

impl RunFailure {
    pub fn exit_code(&self) -> i32 {
        self.source.exit_code()
    }
}
