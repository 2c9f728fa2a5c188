//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use tracing::warn;

use crate::domain::deploy::DeploymentMode;
use crate::error::DeployError;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 强制使用的域名（FORCE_DOMAIN）
    pub force_domain: Option<String>,
    /// 证书申请邮箱（FORCE_EMAIL）
    pub force_email: Option<String>,
    /// 覆盖自动检测的部署模式（DEPLOYMENT_TYPE）
    pub deployment_type: Option<DeploymentMode>,
    /// Django HTTP 端口
    pub django_port: u16,
    /// DICOM 接收配置
    pub dicom: DicomConfig,
    /// 应用代码目录
    pub app_dir: PathBuf,
    /// WSGI 入口，如 `pacs.wsgi:application`
    pub wsgi_module: String,
    pub secret_key: Option<String>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    /// 是否为生产环境（DJANGO_ENV=production 或 DEBUG=false）
    pub production: bool,
}

/// DICOM 接收进程配置
#[derive(Clone, Debug)]
pub struct DicomConfig {
    pub enabled: bool,
    pub port: u16,
    pub ae_title: String,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, DeployError> {
        let force_domain = checked(non_empty("FORCE_DOMAIN"), "FORCE_DOMAIN")?;
        let force_email = non_empty("FORCE_EMAIL");

        // DEPLOYMENT_TYPE 覆盖自动检测；`auto` 等同于未设置
        let deployment_type = match non_empty("DEPLOYMENT_TYPE") {
            Some(v) if v.eq_ignore_ascii_case("auto") => None,
            Some(v) => Some(
                v.parse::<DeploymentMode>()
                    .map_err(|e| DeployError::config(format!("DEPLOYMENT_TYPE: {}", e)))?,
            ),
            None => None,
        };

        let django_port = parse_port("DJANGO_PORT", constants::DEFAULT_DJANGO_PORT)?;
        let dicom = DicomConfig::from_env()?;

        let app_dir = checked(env::var("APP_DIR").ok(), "APP_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(constants::DEFAULT_APP_DIR));

        let wsgi_module = checked(env::var("WSGI_MODULE").ok(), "WSGI_MODULE")?
            .unwrap_or_else(|| constants::DEFAULT_WSGI_MODULE.to_string());

        let secret_key = checked(non_empty("SECRET_KEY"), "SECRET_KEY")?;

        // DATABASE_URL - 支持旧名称兼容
        let database_url = checked(load_with_fallback("DATABASE_URL", "DB_URL"), "DATABASE_URL")?;
        if env::var("DB_URL").is_ok() {
            warn!("Deprecated environment variable DB_URL detected. Please use DATABASE_URL");
        }
        let redis_url = checked(non_empty("REDIS_URL"), "REDIS_URL")?;

        let production = env::var("DJANGO_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false)
            || env::var("DEBUG")
                .map(|v| v == "0" || v.eq_ignore_ascii_case("false"))
                .unwrap_or(false);

        Ok(Self {
            force_domain,
            force_email,
            deployment_type,
            django_port,
            dicom,
            app_dir,
            wsgi_module,
            secret_key,
            database_url,
            redis_url,
            production,
        })
    }

    /// TLS 只在同时给出域名和邮箱时启用
    pub fn tls_enabled(&self) -> bool {
        self.force_domain.is_some() && self.force_email.is_some()
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            force_domain: None,
            force_email: None,
            deployment_type: None,
            django_port: constants::DEFAULT_DJANGO_PORT,
            dicom: DicomConfig::default(),
            app_dir: PathBuf::from(constants::DEFAULT_APP_DIR),
            wsgi_module: constants::DEFAULT_WSGI_MODULE.to_string(),
            secret_key: None,
            database_url: None,
            redis_url: None,
            production: false,
        }
    }
}

impl DicomConfig {
    pub fn from_env() -> Result<Self, DeployError> {
        let enabled = env::var("DICOM_ENABLED")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        let port = parse_port("DICOM_PORT", constants::DEFAULT_DICOM_PORT)?;

        let ae_title = env::var("DICOM_AE_TITLE")
            .unwrap_or_else(|_| constants::DEFAULT_AE_TITLE.to_string());
        // AE Title 最长 16 个字符
        if ae_title.is_empty() || ae_title.len() > 16 {
            return Err(DeployError::config(format!(
                "DICOM_AE_TITLE must be 1-16 characters, got '{}'",
                ae_title
            )));
        }

        Ok(Self {
            enabled,
            port,
            ae_title,
        })
    }
}

impl Default for DicomConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: constants::DEFAULT_DICOM_PORT,
            ae_title: constants::DEFAULT_AE_TITLE.to_string(),
        }
    }
}

/// 读取端口，非法值报错而不是静默回退
fn parse_port(key: &str, default: u16) -> Result<u16, DeployError> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| DeployError::config(format!("{} is not a valid port: '{}'", key, v))),
        Err(_) => Ok(default),
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// 会写入 `.env` 和 unit 文件的值不能含控制字符或单引号
fn checked(value: Option<String>, key: &str) -> Result<Option<String>, DeployError> {
    match value {
        Some(v) if v.chars().any(|c| c.is_control() || c == '\'') => Err(DeployError::config(
            format!("{} contains a control character or single quote", key),
        )),
        other => Ok(other),
    }
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    non_empty(primary).or_else(|| non_empty(fallback))
}

/// 常量
pub mod constants {
    pub const DEFAULT_DJANGO_PORT: u16 = 8000;
    pub const DEFAULT_DICOM_PORT: u16 = 11112;
    pub const DEFAULT_AE_TITLE: &str = "PACS_SCP";
    pub const DEFAULT_APP_DIR: &str = "/opt/pacs";
    pub const DEFAULT_WSGI_MODULE: &str = "pacs.wsgi:application";
    pub const DEFAULT_LOG_DIR: &str = "log";
    pub const DEFAULT_OUTPUT_DIR: &str = "deploy";

    /// 外部命令失败后的最大重试次数
    pub const MAX_RETRIES: u32 = 3;
    /// 首次重试前的等待（秒），之后翻倍
    pub const RETRY_BASE_DELAY_SECS: u64 = 2;
    /// 单条外部命令超时（秒）
    pub const COMMAND_TIMEOUT_SECS: u64 = 600;
    /// 工具探测超时（秒）
    pub const TOOL_PROBE_TIMEOUT_SECS: u64 = 5;

    /// 每个健康检查目标的等待上限（秒）
    pub const HEALTH_WAIT_SECS: u64 = 30;
    /// 健康检查轮询间隔（秒）
    pub const HEALTH_POLL_INTERVAL_SECS: u64 = 2;
    /// 单次健康探测超时（秒）
    pub const HEALTH_ATTEMPT_TIMEOUT_SECS: u64 = 5;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
