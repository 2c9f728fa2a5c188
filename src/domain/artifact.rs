//! 配置产物领域模型

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// 产物类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Env,
    Nginx,
    SystemdUnit,
    DockerCompose,
    HealthScript,
    Requirements,
    Report,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Env => "env",
            ArtifactKind::Nginx => "nginx",
            ArtifactKind::SystemdUnit => "systemd-unit",
            ArtifactKind::DockerCompose => "docker-compose",
            ArtifactKind::HealthScript => "health-script",
            ArtifactKind::Requirements => "requirements",
            ArtifactKind::Report => "report",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个配置产物
///
/// `path` 是提升后的最终路径，`checksum` 是 `content` 的 SHA-256
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConfigArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub content: String,
    pub checksum: String,
}

impl ConfigArtifact {
    pub fn new(kind: ArtifactKind, path: PathBuf, content: String) -> Self {
        let checksum = sha256_hex(content.as_bytes());
        Self {
            kind,
            path,
            content,
            checksum,
        }
    }

    /// 文件名部分
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// 计算 SHA-256 十六进制摘要
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
