//! 主机资源探测
//!
//! 读取顺序固定：内存 → CPU → 磁盘 → 工具。
//! 单项读取失败时取最保守的值（数值为 0，能力为 false），
//! 只有内存和 CPU 都读不到时才返回 ProbeError。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, info, warn};

use crate::config::env::constants::TOOL_PROBE_TIMEOUT_SECS;
use crate::domain::system::{Architecture, OsFamily, SystemProfile};
use crate::error::ProbeError;
use crate::infra::CommandRunner;

const GIB: u64 = 1024 * 1024 * 1024;
const OS_RELEASE_PATH: &str = "/etc/os-release";
const SYSTEMD_RUNTIME_DIR: &str = "/run/systemd/system";

/// 硬件读数，None 表示读取失败
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardwareReadings {
    pub memory_bytes: Option<u64>,
    pub cpu_count: Option<usize>,
    pub disk_free_bytes: Option<u64>,
    pub os_release: Option<String>,
}

/// 工具探测结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ToolPresence {
    pub docker: bool,
    pub compose_plugin: bool,
    pub compose_standalone: bool,
    pub systemd: bool,
    pub nginx: bool,
    pub python3: bool,
    pub build_tools: bool,
}

/// 汇总读数生成画像
pub fn build_profile(
    hardware: HardwareReadings,
    tools: ToolPresence,
    architecture: Architecture,
) -> Result<SystemProfile, ProbeError> {
    if hardware.memory_bytes.is_none() && hardware.cpu_count.is_none() {
        return Err(ProbeError(
            "neither memory nor CPU information is readable".to_string(),
        ));
    }

    let memory_gb = hardware
        .memory_bytes
        .map(round_gib)
        .unwrap_or_else(|| {
            warn!("Memory size unreadable, assuming 0GB");
            0
        });
    let cpu_cores = hardware
        .cpu_count
        .map(|c| c.max(1) as u32)
        .unwrap_or_else(|| {
            warn!("CPU count unreadable, assuming 1 core");
            1
        });
    let storage_gb_free = hardware
        .disk_free_bytes
        .map(|b| u32::try_from(b / GIB).unwrap_or(u32::MAX))
        .unwrap_or_else(|| {
            warn!("Free disk space unreadable, assuming 0GB");
            0
        });
    let os_family = hardware
        .os_release
        .as_deref()
        .map(OsFamily::from_os_release)
        .unwrap_or(OsFamily::Other);

    Ok(SystemProfile {
        os_family,
        architecture,
        memory_gb,
        cpu_cores,
        storage_gb_free,
        has_docker: tools.docker,
        has_compose: tools.compose_plugin || tools.compose_standalone,
        compose_standalone: !tools.compose_plugin && tools.compose_standalone,
        has_systemd: tools.systemd,
        has_nginx: tools.nginx,
        has_python3: tools.python3,
        has_build_tools: tools.build_tools,
    })
}

/// 四舍五入到 GiB（标称 8GB 的机器通常只报告 7.7GB 左右）
fn round_gib(bytes: u64) -> u32 {
    u32::try_from((bytes + GIB / 2) / GIB).unwrap_or(u32::MAX)
}

/// 资源探测器
pub struct ResourceProbe {
    /// 用于选择磁盘的路径（应用目录）
    storage_path: PathBuf,
    tool_timeout: Duration,
}

impl ResourceProbe {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            tool_timeout: Duration::from_secs(TOOL_PROBE_TIMEOUT_SECS),
        }
    }

    /// 探测主机，只读
    pub async fn probe(&self) -> Result<SystemProfile, ProbeError> {
        let storage_path = self.storage_path.clone();
        let hardware = tokio::task::spawn_blocking(move || read_hardware(&storage_path));

        // 硬件读取和工具探测并行，全部完成后再汇总
        let (hardware, tools) = tokio::join!(hardware, detect_tools(self.tool_timeout));
        let hardware =
            hardware.map_err(|e| ProbeError(format!("hardware probe task failed: {}", e)))?;

        let profile = build_profile(hardware, tools, Architecture::current())?;

        info!(
            os = profile.os_family.as_str(),
            arch = %profile.architecture,
            memory_gb = profile.memory_gb,
            cpu_cores = profile.cpu_cores,
            storage_gb_free = profile.storage_gb_free,
            docker = profile.has_docker,
            compose = profile.has_compose,
            systemd = profile.has_systemd,
            nginx = profile.has_nginx,
            python3 = profile.has_python3,
            "System probe complete"
        );

        Ok(profile)
    }
}

/// 主机探测抽象，编排器在引导安装后会再次调用
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn probe(&self) -> Result<SystemProfile, ProbeError>;
}

#[async_trait]
impl HostProbe for ResourceProbe {
    async fn probe(&self) -> Result<SystemProfile, ProbeError> {
        ResourceProbe::probe(self).await
    }
}

/// 读取内存、CPU、磁盘和 os-release（阻塞）
fn read_hardware(storage_path: &Path) -> HardwareReadings {
    let mut sys = System::new_with_specifics(
        RefreshKind::new()
            .with_cpu(CpuRefreshKind::new())
            .with_memory(MemoryRefreshKind::new().with_ram()),
    );
    sys.refresh_memory();

    let memory_bytes = Some(sys.total_memory()).filter(|m| *m > 0);
    let cpu_count = Some(sys.cpus().len()).filter(|c| *c > 0);

    let disks = Disks::new_with_refreshed_list();
    let disk_free_bytes = disks
        .iter()
        .filter(|d| storage_path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space());

    let os_release = std::fs::read_to_string(OS_RELEASE_PATH).ok();

    debug!(
        ?memory_bytes,
        ?cpu_count,
        ?disk_free_bytes,
        storage_path = %storage_path.display(),
        "Hardware readings collected"
    );

    HardwareReadings {
        memory_bytes,
        cpu_count,
        disk_free_bytes,
        os_release,
    }
}

/// 并行探测工具是否可用
async fn detect_tools(timeout: Duration) -> ToolPresence {
    let available = |program: &'static str, args: &'static [&'static str]| {
        CommandRunner::is_available(program, args, timeout)
    };

    let (docker, compose_plugin, compose_standalone, systemctl, nginx, python3, gcc, make, pkg_config) = tokio::join!(
        available("docker", &["--version"]),
        available("docker", &["compose", "version"]),
        available("docker-compose", &["--version"]),
        available("systemctl", &["--version"]),
        available("nginx", &["-v"]),
        available("python3", &["--version"]),
        available("gcc", &["--version"]),
        available("make", &["--version"]),
        available("pkg-config", &["--version"]),
    );

    // systemctl 存在但不是 PID 1（容器内常见）时不算
    let systemd = systemctl && Path::new(SYSTEMD_RUNTIME_DIR).exists();

    ToolPresence {
        docker,
        compose_plugin: docker && compose_plugin,
        compose_standalone,
        systemd,
        nginx,
        python3,
        build_tools: gcc || make || pkg_config,
    }
}
