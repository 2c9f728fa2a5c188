//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 部署模式
///
/// 每次运行只选择一次，所有分派点都必须穷举处理
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Docker Compose 全量栈（含异步任务 worker）
    DockerFull,
    /// Docker Compose 精简栈
    DockerMinimal,
    /// systemd 原生部署
    NativeSystemd,
    /// 先安装系统依赖，再重新探测
    InstallDependencies,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::DockerFull => "docker_full",
            DeploymentMode::DockerMinimal => "docker_minimal",
            DeploymentMode::NativeSystemd => "native_systemd",
            DeploymentMode::InstallDependencies => "install_dependencies",
        }
    }

    /// 是否通过容器运行（意味着有 broker 可用）
    pub fn is_containerized(&self) -> bool {
        matches!(
            self,
            DeploymentMode::DockerFull | DeploymentMode::DockerMinimal
        )
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 未知的部署模式字符串
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown deployment mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for DeploymentMode {
    type Err = UnknownMode;

    /// 兼容旧脚本里的 `docker` / `native` 写法
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "docker_full" | "docker" | "full" => Ok(DeploymentMode::DockerFull),
            "docker_minimal" | "minimal" => Ok(DeploymentMode::DockerMinimal),
            "native_systemd" | "native" | "systemd" => Ok(DeploymentMode::NativeSystemd),
            "install_dependencies" | "bootstrap" => Ok(DeploymentMode::InstallDependencies),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

/// 规格参数
///
/// 只依赖 (memory_gb, cpu_cores)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SizingParams {
    /// 1..=8
    pub worker_count: u32,
    /// web 进程内存上限
    pub memory_limit_mb: u32,
    pub db_pool_size: u32,
    pub db_memory_limit_mb: u32,
    pub cache_memory_limit_mb: u32,
    pub task_worker_memory_limit_mb: u32,
    pub task_worker_concurrency: u32,
}

/// 部署状态机
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Init,
    Probed,
    Planned,
    Configured,
    Applying,
    Validating,
    Succeeded,
    Failed,
}

impl DeployState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployState::Init => "INIT",
            DeployState::Probed => "PROBED",
            DeployState::Planned => "PLANNED",
            DeployState::Configured => "CONFIGURED",
            DeployState::Applying => "APPLYING",
            DeployState::Validating => "VALIDATING",
            DeployState::Succeeded => "SUCCEEDED",
            DeployState::Failed => "FAILED",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployState::Succeeded | DeployState::Failed)
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            StageStatus::Success => "✓",
            StageStatus::Failed => "✗",
            StageStatus::Skipped => "⊘",
            StageStatus::Running => "⟳",
            StageStatus::Pending => "○",
        }
    }
}

/// 部署阶段信息
#[derive(Clone, Debug, Serialize)]
pub struct DeployStage {
    /// 阶段标识 (e.g., "probe", "emit", "apply")
    pub name: String,
    /// 显示名称
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl DeployStage {
    /// 创建新的待执行阶段
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    /// 开始执行阶段
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    /// 完成阶段
    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }

    /// 汇总行，如 `✓ Probe host (12ms)`
    pub fn summary_line(&self) -> String {
        let duration = self
            .duration_ms
            .map(|d| format!("{}ms", d))
            .unwrap_or_else(|| "-".to_string());
        match self.message {
            Some(ref msg) => format!(
                "{} {} ({}) - {}",
                self.status.icon(),
                self.display_name,
                duration,
                msg
            ),
            None => format!("{} {} ({})", self.status.icon(), self.display_name, duration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip_names() {
        for mode in [
            DeploymentMode::DockerFull,
            DeploymentMode::DockerMinimal,
            DeploymentMode::NativeSystemd,
            DeploymentMode::InstallDependencies,
        ] {
            assert_eq!(mode.as_str().parse::<DeploymentMode>(), Ok(mode));
        }
    }

    #[test]
    fn test_mode_legacy_aliases() {
        assert_eq!("docker".parse::<DeploymentMode>(), Ok(DeploymentMode::DockerFull));
        assert_eq!("Native".parse::<DeploymentMode>(), Ok(DeploymentMode::NativeSystemd));
        assert_eq!("docker-minimal".parse::<DeploymentMode>(), Ok(DeploymentMode::DockerMinimal));
        assert!("kubernetes".parse::<DeploymentMode>().is_err());
    }

    #[test]
    fn test_deploy_state_is_terminal() {
        assert!(!DeployState::Applying.is_terminal());
        assert!(DeployState::Succeeded.is_terminal());
        assert!(DeployState::Failed.is_terminal());
    }

    #[test]
    fn test_deploy_stage_lifecycle() {
        let mut stage = DeployStage::new("probe", "Probe host");
        assert_eq!(stage.status, StageStatus::Pending);

        stage.start();
        assert_eq!(stage.status, StageStatus::Running);
        assert!(stage.started_at.is_some());

        stage.finish(true, None);
        assert_eq!(stage.status, StageStatus::Success);
        assert!(stage.duration_ms.is_some());
        assert!(stage.summary_line().starts_with("✓ Probe host"));
    }

    #[test]
    fn test_deploy_stage_skip() {
        let mut stage = DeployStage::new("apply", "Apply");
        stage.skip(Some("dry run".to_string()));
        assert_eq!(stage.summary_line(), "⊘ Apply (-) - dry run");
    }
}
