//! 主机资源领域模型

use serde::Serialize;
use std::fmt;

/// 操作系统家族
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OsFamily {
    LinuxDebian,
    LinuxRhel,
    Other,
}

impl OsFamily {
    /// 从 /etc/os-release 内容解析
    ///
    /// 先看 `ID`，再看 `ID_LIKE`，都不认识则为 `Other`
    pub fn from_os_release(content: &str) -> Self {
        let mut id = String::new();
        let mut id_like = String::new();

        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_lowercase();
            match key.trim() {
                "ID" => id = value,
                "ID_LIKE" => id_like = value,
                _ => {}
            }
        }

        Self::classify(&id)
            .or_else(|| id_like.split_whitespace().find_map(Self::classify))
            .unwrap_or(OsFamily::Other)
    }

    fn classify(id: &str) -> Option<Self> {
        match id {
            "debian" | "ubuntu" | "raspbian" | "linuxmint" => Some(OsFamily::LinuxDebian),
            "rhel" | "centos" | "fedora" | "rocky" | "almalinux" | "ol" => {
                Some(OsFamily::LinuxRhel)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::LinuxDebian => "linux-debian",
            OsFamily::LinuxRhel => "linux-rhel",
            OsFamily::Other => "other",
        }
    }
}

/// CPU 架构
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86_64,
    Arm64,
    /// 其他架构，保留原始名称
    Other(String),
}

impl Architecture {
    pub fn from_arch(arch: &str) -> Self {
        match arch {
            "x86_64" | "amd64" => Architecture::X86_64,
            "aarch64" | "arm64" => Architecture::Arm64,
            other => Architecture::Other(other.to_string()),
        }
    }

    /// 当前编译目标的架构
    pub fn current() -> Self {
        Self::from_arch(std::env::consts::ARCH)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Arm64 => write!(f, "arm64"),
            Architecture::Other(name) => write!(f, "{}", name),
        }
    }
}

/// 主机资源快照
///
/// 每次部署由 ResourceProbe 创建一次，之后只读
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SystemProfile {
    pub os_family: OsFamily,
    pub architecture: Architecture,
    pub memory_gb: u32,
    /// 至少为 1
    pub cpu_cores: u32,
    pub storage_gb_free: u32,
    pub has_docker: bool,
    pub has_compose: bool,
    /// 只有独立的 docker-compose 可用（没有 compose 插件）
    pub compose_standalone: bool,
    pub has_systemd: bool,
    pub has_nginx: bool,
    pub has_python3: bool,
    pub has_build_tools: bool,
}

impl SystemProfile {
    /// 最保守的画像：未知数值取 0，能力全部为 false
    pub fn conservative() -> Self {
        Self {
            os_family: OsFamily::Other,
            architecture: Architecture::current(),
            memory_gb: 0,
            cpu_cores: 1,
            storage_gb_free: 0,
            has_docker: false,
            has_compose: false,
            compose_standalone: false,
            has_systemd: false,
            has_nginx: false,
            has_python3: false,
            has_build_tools: false,
        }
    }

    /// 测试和覆盖场景下按资源快速构造
    pub fn with_resources(memory_gb: u32, cpu_cores: u32) -> Self {
        Self {
            memory_gb,
            cpu_cores: cpu_cores.max(1),
            ..Self::conservative()
        }
    }

    pub fn constraints(&self) -> ResourceConstraints {
        ResourceConstraints::from_profile(self)
    }

    /// 能否从源码编译 Python 扩展：需要构建工具和至少 3 GB 空闲磁盘
    pub fn supports_compilation(&self) -> bool {
        self.has_build_tools && self.storage_gb_free > 2
    }
}

/// 由画像派生的资源约束
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceConstraints {
    pub memory_limited: bool,
    pub cpu_limited: bool,
    pub storage_limited: bool,
    pub low_memory: bool,
    pub very_low_resources: bool,
    pub low_cpu: bool,
    pub can_run_full_stack: bool,
    pub can_run_ai_features: bool,
}

impl ResourceConstraints {
    pub fn from_profile(profile: &SystemProfile) -> Self {
        Self {
            memory_limited: profile.memory_gb < 2,
            cpu_limited: profile.cpu_cores < 2,
            storage_limited: profile.storage_gb_free < 5,
            low_memory: profile.memory_gb < 4,
            very_low_resources: profile.memory_gb < 1,
            low_cpu: profile.cpu_cores < 4,
            can_run_full_stack: profile.memory_gb >= 4 && profile.cpu_cores >= 2,
            can_run_ai_features: profile.memory_gb >= 8 && profile.cpu_cores >= 4,
        }
    }

    /// 生效的约束名称列表（用于部署报告）
    pub fn applied(&self) -> Vec<&'static str> {
        [
            ("memory_limited", self.memory_limited),
            ("cpu_limited", self.cpu_limited),
            ("storage_limited", self.storage_limited),
            ("low_memory", self.low_memory),
            ("low_cpu", self.low_cpu),
            ("very_low_resources", self.very_low_resources),
        ]
        .into_iter()
        .filter_map(|(name, active)| active.then_some(name))
        .collect()
    }
}
