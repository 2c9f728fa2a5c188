//! 应用步骤规划
//!
//! 纯函数：根据模式和画像生成有序的外部命令列表，每步可带撤销命令。

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::deploy::DeploymentMode;
use crate::domain::health::HealthTarget;
use crate::domain::manifest::{Category, DependencyManifest};
use crate::domain::system::{OsFamily, SystemProfile};
use crate::error::ApplyError;
use crate::infra::CommandSpec;
use crate::services::emitter::{
    EmitSettings, COMPOSE_FILE_NAME, DICOM_UNIT_NAME, NGINX_FILE_NAME, REQUIREMENTS_FILE_NAME,
    WEB_UNIT_NAME,
};

/// nginx 站点配置链接位置
pub const NGINX_SITE_LINK: &str = "/etc/nginx/conf.d/pacs.conf";

const DEBIAN_PACKAGES: &[&str] = &[
    "python3",
    "python3-venv",
    "python3-pip",
    "python3-dev",
    "build-essential",
    "libpq-dev",
    "nginx",
    "curl",
    "netcat-openbsd",
];

const RHEL_PACKAGES: &[&str] = &[
    "python3",
    "python3-pip",
    "python3-devel",
    "gcc",
    "make",
    "libpq-devel",
    "nginx",
    "curl",
    "nmap-ncat",
];

/// nginx 站点链接在部署前的状态
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NginxSite {
    pub link: PathBuf,
    /// 部署前链接指向的文件，None 表示原来没有链接
    pub previous: Option<PathBuf>,
}

impl NginxSite {
    /// 读取链接当前指向
    pub async fn inspect(link: impl Into<PathBuf>) -> Self {
        let link = link.into();
        let previous = match tokio::fs::read_link(&link).await {
            Ok(target) => Some(target),
            Err(e) => {
                debug!(link = %link.display(), error = %e, "No existing nginx site link");
                None
            }
        };
        Self { link, previous }
    }
}

/// 单个应用步骤
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyStep {
    pub name: String,
    pub command: CommandSpec,
    /// 回滚时执行，None 表示无需撤销
    pub undo: Option<CommandSpec>,
}

impl ApplyStep {
    fn new(name: &str, command: CommandSpec) -> Self {
        Self {
            name: name.to_string(),
            command,
            undo: None,
        }
    }

    fn with_undo(mut self, undo: CommandSpec) -> Self {
        self.undo = Some(undo);
        self
    }
}

/// 生成应用步骤
pub fn plan_steps(
    mode: DeploymentMode,
    profile: &SystemProfile,
    settings: &EmitSettings,
    nginx: &NginxSite,
    output_dir: &Path,
) -> Result<Vec<ApplyStep>, ApplyError> {
    let steps = match mode {
        DeploymentMode::InstallDependencies => bootstrap_steps(profile)?,
        DeploymentMode::NativeSystemd => {
            let mut steps = native_steps(settings, output_dir);
            if profile.has_nginx {
                steps.push(nginx_step(nginx, output_dir));
            }
            steps
        }
        DeploymentMode::DockerFull | DeploymentMode::DockerMinimal => {
            let mut steps = vec![compose_step(profile, output_dir)];
            if profile.has_nginx {
                steps.push(nginx_step(nginx, output_dir));
            }
            steps
        }
    };
    Ok(steps)
}

fn bootstrap_steps(profile: &SystemProfile) -> Result<Vec<ApplyStep>, ApplyError> {
    match profile.os_family {
        OsFamily::LinuxDebian => Ok(vec![
            ApplyStep::new("apt_update", CommandSpec::new("apt-get", ["update"])),
            ApplyStep::new(
                "apt_install",
                CommandSpec::new(
                    "apt-get",
                    ["install", "-y"].iter().chain(DEBIAN_PACKAGES).copied(),
                ),
            ),
        ]),
        OsFamily::LinuxRhel => Ok(vec![ApplyStep::new(
            "dnf_install",
            CommandSpec::new("dnf", ["install", "-y"].iter().chain(RHEL_PACKAGES).copied()),
        )]),
        OsFamily::Other => Err(ApplyError::Unsupported(
            "no supported package manager for this OS family".to_string(),
        )),
    }
}

fn native_steps(settings: &EmitSettings, output_dir: &Path) -> Vec<ApplyStep> {
    let app_dir = &settings.app_dir;
    let venv = app_dir.join("venv").display().to_string();
    let pip = app_dir.join("venv/bin/pip").display().to_string();
    let requirements = output_dir.join(REQUIREMENTS_FILE_NAME).display().to_string();
    let web_unit = output_dir.join(WEB_UNIT_NAME).display().to_string();
    let dicom_unit = output_dir.join(DICOM_UNIT_NAME).display().to_string();

    let mut steps = vec![
        ApplyStep::new(
            "create_venv",
            CommandSpec::new("python3", ["-m", "venv", venv.as_str()]).in_dir(app_dir),
        ),
        ApplyStep::new(
            "pip_install",
            CommandSpec::new(pip, ["install", "-r", requirements.as_str()]).in_dir(app_dir),
        ),
        ApplyStep::new(
            "link_web_unit",
            CommandSpec::new("systemctl", ["link", web_unit.as_str()]),
        ),
    ];
    if settings.dicom.enabled {
        steps.push(ApplyStep::new(
            "link_dicom_unit",
            CommandSpec::new("systemctl", ["link", dicom_unit.as_str()]),
        ));
    }

    steps.push(ApplyStep::new(
        "daemon_reload",
        CommandSpec::new("systemctl", ["daemon-reload"]),
    ));
    // restart：已在运行的旧进程也要加载新配置
    steps.push(
        ApplyStep::new(
            "start_web",
            CommandSpec::new("systemctl", ["restart", WEB_UNIT_NAME]),
        )
        .with_undo(CommandSpec::new("systemctl", ["stop", WEB_UNIT_NAME])),
    );
    if settings.dicom.enabled {
        steps.push(
            ApplyStep::new(
                "start_dicom",
                CommandSpec::new("systemctl", ["restart", DICOM_UNIT_NAME]),
            )
            .with_undo(CommandSpec::new("systemctl", ["stop", DICOM_UNIT_NAME])),
        );
    }
    steps
}

fn compose_step(profile: &SystemProfile, output_dir: &Path) -> ApplyStep {
    ApplyStep::new(
        "compose_up",
        compose_command(profile, output_dir, &["up", "-d", "--build"]),
    )
    .with_undo(compose_command(profile, output_dir, &["down"]))
}

/// 只有独立 docker-compose 时才用它，否则用 compose 插件
pub fn compose_command(profile: &SystemProfile, output_dir: &Path, action: &[&str]) -> CommandSpec {
    let (program, mut args) = if profile.compose_standalone {
        ("docker-compose", Vec::new())
    } else {
        ("docker", vec!["compose".to_string()])
    };
    args.push("-f".to_string());
    args.push(output_dir.join(COMPOSE_FILE_NAME).display().to_string());
    args.extend(action.iter().map(|s| s.to_string()));
    CommandSpec::new(program, args).in_dir(output_dir)
}

/// compose 内置的数据库和缓存，在容器内检查就绪状态
///
/// 配置了外部 URL 的服务不在 compose 中，由 TCP 检查覆盖
pub fn compose_health_targets(
    profile: &SystemProfile,
    settings: &EmitSettings,
    manifest: &DependencyManifest,
    output_dir: &Path,
) -> Vec<HealthTarget> {
    let mut checks: Vec<(&str, &[&str])> = Vec::new();
    if settings.database_url.is_none() {
        checks.push(("db", &["pg_isready", "-U", "pacs", "-d", "pacs"]));
    }
    if settings.redis_url.is_none() && manifest.contains_category(Category::Cache) {
        checks.push(("redis", &["redis-cli", "ping"]));
    }

    checks
        .into_iter()
        .map(|(service, check)| {
            let action: Vec<&str> = ["exec", "-T", service]
                .into_iter()
                .chain(check.iter().copied())
                .collect();
            let command = compose_command(profile, output_dir, &action);
            HealthTarget::Container {
                service: service.to_string(),
                argv: std::iter::once(command.program).chain(command.args).collect(),
            }
        })
        .collect()
}

fn nginx_step(nginx: &NginxSite, output_dir: &Path) -> ApplyStep {
    let site = output_dir.join(NGINX_FILE_NAME);
    let link = nginx.link.display();
    let undo = match nginx.previous {
        Some(ref previous) => format!(
            "ln -sfn '{}' '{}' && systemctl reload nginx",
            previous.display(),
            link
        ),
        None => format!("rm -f '{}' && systemctl reload nginx", link),
    };
    ApplyStep::new(
        "nginx_site",
        CommandSpec::shell(format!(
            "ln -sfn '{}' '{}' && nginx -t && systemctl reload nginx",
            site.display(),
            link
        )),
    )
    .with_undo(CommandSpec::shell(undo))
}
