//! 健康检查领域模型

use serde::Serialize;
use std::fmt;

/// 健康检查目标
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthTarget {
    /// HTTP GET，期望 200
    Web { url: String },
    /// 只做 TCP 连接，不做 DICOM 握手
    Dicom { host: String, port: u16 },
    Database { host: String, port: u16 },
    Cache { host: String, port: u16 },
    /// 在 compose 服务容器内执行命令，退出码 0 视为就绪
    Container { service: String, argv: Vec<String> },
}

impl HealthTarget {
    pub fn name(&self) -> &str {
        match self {
            HealthTarget::Web { .. } => "web",
            HealthTarget::Dicom { .. } => "dicom",
            HealthTarget::Database { .. } => "database",
            HealthTarget::Cache { .. } => "cache",
            HealthTarget::Container { service, .. } => service,
        }
    }
}

impl fmt::Display for HealthTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthTarget::Web { url } => write!(f, "web ({})", url),
            HealthTarget::Dicom { host, port }
            | HealthTarget::Database { host, port }
            | HealthTarget::Cache { host, port } => {
                write!(f, "{} ({}:{})", self.name(), host, port)
            }
            HealthTarget::Container { service, argv } => {
                write!(f, "{} ({})", service, argv.join(" "))
            }
        }
    }
}

/// 失败原因分类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthErrorKind {
    ConnectionRefused,
    Timeout,
    /// HTTP 返回非 200
    BadStatus(u16),
    /// 容器内检查命令返回非 0
    NotReady,
    Other,
}

/// 单次健康检查结果（不持久化）
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    pub target: HealthTarget,
    pub reachable: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<HealthErrorKind>,
}

impl HealthCheckResult {
    pub fn reachable(target: HealthTarget, latency_ms: u64) -> Self {
        Self {
            target,
            reachable: true,
            latency_ms,
            error_kind: None,
        }
    }

    pub fn unreachable(target: HealthTarget, latency_ms: u64, kind: HealthErrorKind) -> Self {
        Self {
            target,
            reachable: false,
            latency_ms,
            error_kind: Some(kind),
        }
    }
}
