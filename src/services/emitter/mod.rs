//! 配置生成
//!
//! 所有模板先在内存中渲染完成，再写入 `<output_dir>.staging`，
//! 最后通过 rename 整体替换 `output_dir`。渲染失败时磁盘不会被修改。

pub mod template;
pub mod templates;

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::env::constants::VERSION;
use crate::config::{DicomConfig, EnvConfig};
use crate::domain::artifact::{sha256_hex, ArtifactKind, ConfigArtifact};
use crate::domain::deploy::{DeploymentMode, SizingParams};
use crate::domain::manifest::{Category, DependencyManifest};
use crate::domain::system::SystemProfile;
use crate::error::{DeployError, TemplateRenderError};
use crate::services::planner::{render_requirements, PlanReport};

use template::{TemplateEngine, TemplateVars};

pub const ENV_FILE_NAME: &str = ".env";
pub const NGINX_FILE_NAME: &str = "nginx.conf";
pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";
pub const WEB_UNIT_NAME: &str = "pacs-web.service";
pub const DICOM_UNIT_NAME: &str = "pacs-dicom.service";
pub const HEALTH_SCRIPT_NAME: &str = "healthcheck.sh";
pub const REQUIREMENTS_FILE_NAME: &str = "requirements.txt";
pub const REPORT_FILE_NAME: &str = "deployment-report.json";

/// 生成配置时固定不变的参数
#[derive(Clone, Debug)]
pub struct EmitSettings {
    pub django_port: u16,
    pub dicom: DicomConfig,
    /// 对外域名，None 时 nginx 使用 `server_name _`
    pub domain: Option<String>,
    pub tls: bool,
    pub secret_key: String,
    pub app_dir: PathBuf,
    pub wsgi_module: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub debug: bool,
    /// 写入部署报告的主机名
    pub hostname: Option<String>,
}

impl EmitSettings {
    pub fn from_config(config: &EnvConfig, secret_key: String) -> Self {
        Self {
            django_port: config.django_port,
            dicom: config.dicom.clone(),
            domain: config.force_domain.clone(),
            tls: config.tls_enabled(),
            secret_key,
            app_dir: config.app_dir.clone(),
            wsgi_module: config.wsgi_module.clone(),
            database_url: config.database_url.clone(),
            redis_url: config.redis_url.clone(),
            debug: !config.production,
            hostname: None,
        }
    }

    pub fn with_hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    fn server_name(&self) -> &str {
        self.domain.as_deref().unwrap_or("_")
    }

    fn allowed_hosts(&self) -> String {
        match self.domain {
            Some(ref domain) => format!("{},localhost,127.0.0.1", domain),
            None => "*".to_string(),
        }
    }

    /// `pacs.wsgi:application` → `pacs`
    fn celery_app(&self) -> &str {
        self.wsgi_module
            .split(['.', ':'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("pacs")
    }

    /// compose 内置数据库的密码，由 SECRET_KEY 派生，保证重复生成结果一致
    fn db_password(&self) -> String {
        sha256_hex(format!("pacs-db:{}", self.secret_key).as_bytes())[..24].to_string()
    }

    /// 容器模式下未配置 DATABASE_URL 时使用 compose 内置数据库
    pub fn effective_database_url(&self, mode: DeploymentMode) -> Option<String> {
        match self.database_url {
            Some(ref url) => Some(url.clone()),
            None if mode.is_containerized() => {
                Some(format!("postgres://pacs:{}@db:5432/pacs", self.db_password()))
            }
            None => None,
        }
    }

    /// 容器模式且清单包含缓存时，未配置 REDIS_URL 则使用 compose 内置 redis
    pub fn effective_redis_url(
        &self,
        mode: DeploymentMode,
        manifest: &DependencyManifest,
    ) -> Option<String> {
        match self.redis_url {
            Some(ref url) => Some(url.clone()),
            None if mode.is_containerized() && manifest.contains_category(Category::Cache) => {
                Some("redis://redis:6379/0".to_string())
            }
            None => None,
        }
    }
}

/// 配置生成器
pub struct ConfigEmitter {
    settings: EmitSettings,
    profile: SystemProfile,
    engine: TemplateEngine,
}

impl ConfigEmitter {
    pub fn new(settings: EmitSettings, profile: SystemProfile) -> Self {
        Self {
            settings,
            profile,
            engine: TemplateEngine::new(),
        }
    }

    pub fn settings(&self) -> &EmitSettings {
        &self.settings
    }

    /// 渲染并原子写入全部产物
    pub async fn emit(
        &self,
        mode: DeploymentMode,
        sizing: &SizingParams,
        manifest: &DependencyManifest,
        output_dir: &Path,
    ) -> Result<Vec<ConfigArtifact>, DeployError> {
        let output_dir = absolute_output_dir(output_dir)?;
        let artifacts = self.render(mode, sizing, manifest, &output_dir)?;
        promote(&artifacts, &output_dir).await?;

        info!(
            mode = %mode,
            output_dir = %output_dir.display(),
            artifacts = artifacts.len(),
            "Configuration artifacts written"
        );
        Ok(artifacts)
    }

    /// 只在内存中渲染，不触碰磁盘
    pub fn render(
        &self,
        mode: DeploymentMode,
        sizing: &SizingParams,
        manifest: &DependencyManifest,
        output_dir: &Path,
    ) -> Result<Vec<ConfigArtifact>, DeployError> {
        let vars = self.base_vars(mode, sizing, manifest, output_dir);
        let env_vars = self.env_vars(mode, sizing, manifest)?;
        let engine = &self.engine;

        let mut artifacts = Vec::new();
        let mut add = |kind: ArtifactKind, name: &str, content: String| {
            artifacts.push(ConfigArtifact::new(kind, output_dir.join(name), content));
        };

        add(
            ArtifactKind::Env,
            ENV_FILE_NAME,
            engine.render(&templates::ENV_FILE, &env_vars)?,
        );
        add(
            ArtifactKind::Nginx,
            NGINX_FILE_NAME,
            engine.render(&templates::NGINX_SITE, &vars)?,
        );

        if mode.is_containerized() {
            add(
                ArtifactKind::DockerCompose,
                COMPOSE_FILE_NAME,
                engine.render(&templates::COMPOSE_FILE, &vars)?,
            );
        } else {
            add(
                ArtifactKind::SystemdUnit,
                WEB_UNIT_NAME,
                engine.render(&templates::SYSTEMD_WEB, &vars)?,
            );
            if self.settings.dicom.enabled {
                add(
                    ArtifactKind::SystemdUnit,
                    DICOM_UNIT_NAME,
                    engine.render(&templates::SYSTEMD_DICOM, &vars)?,
                );
            }
        }

        add(
            ArtifactKind::HealthScript,
            HEALTH_SCRIPT_NAME,
            engine.render(&templates::HEALTH_SCRIPT, &vars)?,
        );
        add(
            ArtifactKind::Requirements,
            REQUIREMENTS_FILE_NAME,
            render_requirements(manifest, &self.profile),
        );

        let report = PlanReport::new(
            &self.profile,
            mode,
            *sizing,
            manifest,
            self.settings.hostname.clone(),
        );
        let report = serde_json::to_string_pretty(&report)
            .map_err(|e| DeployError::config(format!("failed to serialize report: {}", e)))?;
        add(ArtifactKind::Report, REPORT_FILE_NAME, report + "\n");

        for artifact in &artifacts {
            debug!(file = %artifact.file_name(), checksum = %artifact.checksum, "Rendered artifact");
        }
        Ok(artifacts)
    }

    /// nginx、systemd、compose 和健康检查脚本共用的变量
    fn base_vars(
        &self,
        mode: DeploymentMode,
        sizing: &SizingParams,
        manifest: &DependencyManifest,
        output_dir: &Path,
    ) -> TemplateVars {
        let s = &self.settings;
        let mut vars = TemplateVars::new();
        vars.set("version", VERSION)
            .set("server_name", s.server_name())
            .set("port", s.django_port)
            .set("dicom_port", s.dicom.port)
            .set("dicom_ae_title", &s.dicom.ae_title)
            .set("worker_count", sizing.worker_count)
            .set("memory_limit_mb", sizing.memory_limit_mb)
            .set("db_memory_limit_mb", sizing.db_memory_limit_mb)
            .set("cache_memory_limit_mb", sizing.cache_memory_limit_mb)
            .set("task_worker_memory_limit_mb", sizing.task_worker_memory_limit_mb)
            .set("task_worker_concurrency", sizing.task_worker_concurrency)
            .set("app_dir", s.app_dir.display())
            .set("wsgi_module", &s.wsgi_module)
            .set("celery_app", s.celery_app())
            .set("db_password", s.db_password())
            .set("env_file", output_dir.join(ENV_FILE_NAME).display())
            .set_flag("tls", s.tls)
            .set_flag(
                "with_dicom",
                s.dicom.enabled && manifest.contains_category(Category::Imaging),
            )
            .set_flag(
                "with_cache",
                mode.is_containerized() && manifest.contains_category(Category::Cache),
            )
            .set_flag(
                "with_async",
                mode.is_containerized() && manifest.contains_category(Category::Async),
            );

        // 不设置时 TLS 块会报缺少 domain
        if let Some(ref domain) = s.domain {
            vars.set("domain", domain);
        }
        vars
    }

    /// `.env` 的变量，每个值都经过转义
    fn env_vars(
        &self,
        mode: DeploymentMode,
        sizing: &SizingParams,
        manifest: &DependencyManifest,
    ) -> Result<TemplateVars, TemplateRenderError> {
        let s = &self.settings;
        let mut vars = TemplateVars::new();
        vars.set("version", VERSION)
            .set("deployment_mode", env_value("deployment_mode", &mode.to_string())?)
            .set("debug", if s.debug { "True" } else { "False" })
            .set("secret_key", env_value("secret_key", &s.secret_key)?)
            .set("allowed_hosts", env_value("allowed_hosts", &s.allowed_hosts())?)
            .set("port", s.django_port)
            .set("dicom_enabled", if s.dicom.enabled { "true" } else { "false" })
            .set("dicom_port", s.dicom.port)
            .set("dicom_ae_title", env_value("dicom_ae_title", &s.dicom.ae_title)?)
            .set("worker_count", sizing.worker_count)
            .set("db_pool_size", sizing.db_pool_size);

        let database_url = s
            .effective_database_url(mode)
            .map(|url| env_value("database_url", &url))
            .transpose()?;
        let redis_url = s
            .effective_redis_url(mode, manifest)
            .map(|url| env_value("redis_url", &url))
            .transpose()?;
        vars.set_opt("database_url", database_url)
            .set_opt("redis_url", redis_url);
        Ok(vars)
    }
}

/// 不需要加引号的字符
fn is_plain_env_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | ':' | '@' | ',' | '+' | '-' | '=' | '*')
}

/// `.env` 中的值
///
/// 普通字符原样输出，其余整体加单引号；systemd 的 EnvironmentFile 和 compose 的
/// env_file 都按字面读取单引号内容，不做 `$` 插值和反斜杠转义。
/// 单引号和控制字符无法表示。
fn env_value(variable: &str, value: &str) -> Result<String, TemplateRenderError> {
    if let Some(c) = value.chars().find(|c| c.is_control() || *c == '\'') {
        return Err(TemplateRenderError::InvalidValue {
            template: templates::ENV_FILE.name.to_string(),
            variable: variable.to_string(),
            reason: format!("contains {:?}", c),
        });
    }
    if !value.is_empty() && value.chars().all(is_plain_env_char) {
        Ok(value.to_string())
    } else {
        Ok(format!("'{}'", value))
    }
}

/// 读取上一次生成的 `.env` 中的 SECRET_KEY
pub async fn previous_secret_key(output_dir: &Path) -> Option<String> {
    let content = fs::read_to_string(output_dir.join(ENV_FILE_NAME)).await.ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("SECRET_KEY="))
        .map(str::trim)
        .map(|v| {
            v.strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .unwrap_or(v)
        })
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn absolute_output_dir(output_dir: &Path) -> Result<PathBuf, DeployError> {
    let dir = std::path::absolute(output_dir)?;
    if dir.file_name().is_none() {
        return Err(DeployError::config(format!(
            "output directory '{}' has no final path component",
            output_dir.display()
        )));
    }
    Ok(dir)
}

/// `/srv/deploy` + `staging` → `/srv/deploy.staging`
fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    dir.with_file_name(name)
}

/// 写入 staging 目录后整体替换输出目录
async fn promote(artifacts: &[ConfigArtifact], output_dir: &Path) -> std::io::Result<()> {
    let staging = sibling(output_dir, "staging");
    let previous = sibling(output_dir, "previous");

    if let Some(parent) = output_dir.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::try_exists(&staging).await? {
        fs::remove_dir_all(&staging).await?;
    }
    fs::create_dir_all(&staging).await?;

    for artifact in artifacts {
        let path = staging.join(artifact.file_name());
        fs::write(&path, &artifact.content).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if artifact.kind == ArtifactKind::HealthScript {
                fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
            }
        }
    }

    if fs::try_exists(&previous).await? {
        fs::remove_dir_all(&previous).await?;
    }
    let had_previous = fs::try_exists(output_dir).await?;
    if had_previous {
        fs::rename(output_dir, &previous).await?;
    }

    if let Err(e) = fs::rename(&staging, output_dir).await {
        // 恢复旧目录
        if had_previous {
            let _ = fs::rename(&previous, output_dir).await;
        }
        return Err(e);
    }

    if had_previous {
        if let Err(e) = fs::remove_dir_all(&previous).await {
            warn!(path = %previous.display(), error = %e, "Failed to remove previous output directory");
        }
    }
    Ok(())
}
