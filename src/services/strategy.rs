//! 部署策略选择
//!
//! 纯函数：同一画像永远得到同一 (模式, 规格)

use tracing::info;

use crate::domain::deploy::{DeploymentMode, SizingParams};
use crate::domain::system::SystemProfile;

/// worker 数上限
pub const MAX_WORKERS: u32 = 8;

/// 选择部署模式和规格
///
/// 规则按能力要求递增，首个命中即返回
pub fn select(profile: &SystemProfile) -> (DeploymentMode, SizingParams) {
    (select_mode(profile), sizing(profile.memory_gb, profile.cpu_cores))
}

/// 带覆盖的选择：覆盖只影响模式，规格仍由画像决定
pub fn select_with_override(
    profile: &SystemProfile,
    mode_override: Option<DeploymentMode>,
) -> (DeploymentMode, SizingParams) {
    let (detected, sizing) = select(profile);
    let mode = match mode_override {
        Some(forced) => {
            if forced != detected {
                info!(detected = %detected, forced = %forced, "Deployment mode overridden");
            }
            forced
        }
        None => detected,
    };
    (mode, sizing)
}

fn select_mode(p: &SystemProfile) -> DeploymentMode {
    if p.memory_gb >= 8 && p.cpu_cores >= 4 && p.has_docker && p.has_compose {
        DeploymentMode::DockerFull
    } else if p.memory_gb >= 4 && p.cpu_cores >= 2 && p.has_docker {
        DeploymentMode::DockerMinimal
    } else if p.memory_gb >= 2 && p.cpu_cores >= 1 && p.has_systemd {
        DeploymentMode::NativeSystemd
    } else {
        DeploymentMode::InstallDependencies
    }
}

/// 规格计算
///
/// worker_count 对两个输入都单调不减，范围 1..=8
pub fn sizing(memory_gb: u32, cpu_cores: u32) -> SizingParams {
    let cpu = cpu_cores.max(1);

    let base = if memory_gb >= 8 && cpu >= 4 {
        cpu.saturating_mul(2)
    } else if memory_gb >= 4 && cpu >= 2 {
        cpu
    } else {
        cpu.min(memory_gb)
    };
    let worker_count = base.clamp(1, MAX_WORKERS);

    let memory_mb = memory_gb.saturating_mul(1024);

    SizingParams {
        worker_count,
        memory_limit_mb: percent_of(memory_mb, 40).clamp(512, 2048),
        db_pool_size: (worker_count * 2).min(20),
        db_memory_limit_mb: percent_of(memory_mb, 20).clamp(256, 1024),
        cache_memory_limit_mb: percent_of(memory_mb, 10).clamp(128, 512),
        task_worker_memory_limit_mb: percent_of(memory_mb, 20).clamp(256, 1024),
        task_worker_concurrency: (cpu / 2).max(1),
    }
}

fn percent_of(value: u32, percent: u32) -> u32 {
    (u64::from(value) * u64::from(percent) / 100) as u32
}
