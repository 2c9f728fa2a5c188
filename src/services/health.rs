//! 部署后健康检查
//!
//! web 目标做 HTTP GET（期望 200），容器目标在 compose 服务内执行命令，
//! 其余目标只做 TCP 连接。

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::env::constants::{
    HEALTH_ATTEMPT_TIMEOUT_SECS, HEALTH_POLL_INTERVAL_SECS, HEALTH_WAIT_SECS,
};
use crate::domain::health::{HealthCheckResult, HealthErrorKind, HealthTarget};
use crate::error::HealthCheckTimeout;
use crate::infra::{CommandError, CommandExecutor, CommandRunner, CommandSpec};
use crate::services::emitter::EmitSettings;

const POSTGRES_DEFAULT_PORT: u16 = 5432;
const REDIS_DEFAULT_PORT: u16 = 6379;

/// 健康检查器
pub struct HealthChecker {
    client: reqwest::Client,
    /// 执行容器内检查命令
    executor: Arc<dyn CommandExecutor>,
    /// 单个目标的最长等待时间
    wait: Duration,
    poll_interval: Duration,
    attempt_timeout: Duration,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::with_timing(
            Duration::from_secs(HEALTH_WAIT_SECS),
            Duration::from_secs(HEALTH_POLL_INTERVAL_SECS),
            Duration::from_secs(HEALTH_ATTEMPT_TIMEOUT_SECS),
        )
    }

    pub fn with_timing(wait: Duration, poll_interval: Duration, attempt_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build HTTP client with timeout, using defaults");
                reqwest::Client::new()
            });
        Self {
            client,
            executor: Arc::new(CommandRunner),
            wait,
            poll_interval,
            attempt_timeout,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// 单次检查
    pub async fn check_once(&self, target: &HealthTarget) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = match target {
            HealthTarget::Web { url } => self.check_http(url).await,
            HealthTarget::Dicom { host, port }
            | HealthTarget::Database { host, port }
            | HealthTarget::Cache { host, port } => self.check_tcp(host, *port).await,
            HealthTarget::Container { argv, .. } => self.check_container(argv).await,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => HealthCheckResult::reachable(target.clone(), latency_ms),
            Err(kind) => HealthCheckResult::unreachable(target.clone(), latency_ms, kind),
        }
    }

    /// 轮询直到目标可达或超时
    pub async fn wait_until_reachable(
        &self,
        target: &HealthTarget,
    ) -> Result<HealthCheckResult, HealthCheckTimeout> {
        let deadline = Instant::now() + self.wait;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = self.check_once(target).await;
            if result.reachable {
                info!(
                    target = %target,
                    latency_ms = result.latency_ms,
                    attempts,
                    "Health check passed"
                );
                return Ok(result);
            }

            debug!(target = %target, error = ?result.error_kind, attempts, "Health check attempt failed");

            if Instant::now() + self.poll_interval > deadline {
                warn!(target = %target, error = ?result.error_kind, attempts, "Health check timed out");
                return Err(HealthCheckTimeout {
                    target: target.to_string(),
                    waited_secs: self.wait.as_secs(),
                    last_error: result.error_kind,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn check_http(&self, url: &str) -> Result<(), HealthErrorKind> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_http_error(&e))?;
        let status = response.status().as_u16();
        if status == 200 {
            Ok(())
        } else {
            Err(HealthErrorKind::BadStatus(status))
        }
    }

    async fn check_tcp(&self, host: &str, port: u16) -> Result<(), HealthErrorKind> {
        match tokio::time::timeout(self.attempt_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(classify_io_error(&e)),
            Err(_) => Err(HealthErrorKind::Timeout),
        }
    }

    async fn check_container(&self, argv: &[String]) -> Result<(), HealthErrorKind> {
        let Some((program, args)) = argv.split_first() else {
            return Err(HealthErrorKind::Other);
        };
        let spec = CommandSpec::new(program.as_str(), args.iter().cloned())
            .with_timeout(self.attempt_timeout);
        match self.executor.execute(&spec, &CancellationToken::new()).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => {
                debug!(command = %spec, exit_code = ?output.exit_code, stderr = %output.stderr.trim(), "Container check not ready");
                Err(HealthErrorKind::NotReady)
            }
            Err(CommandError::Timeout(_)) => Err(HealthErrorKind::Timeout),
            Err(e) => {
                debug!(command = %spec, error = %e, "Container check failed to run");
                Err(HealthErrorKind::Other)
            }
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_io_error(e: &io::Error) -> HealthErrorKind {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => HealthErrorKind::ConnectionRefused,
        io::ErrorKind::TimedOut => HealthErrorKind::Timeout,
        _ => HealthErrorKind::Other,
    }
}

fn classify_http_error(e: &reqwest::Error) -> HealthErrorKind {
    if e.is_timeout() {
        return HealthErrorKind::Timeout;
    }
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return classify_io_error(io_err);
        }
        source = err.source();
    }
    if e.is_connect() {
        HealthErrorKind::ConnectionRefused
    } else {
        HealthErrorKind::Other
    }
}

/// 部署后需要验证的目标
///
/// 数据库和缓存只在显式配置了 URL 时检查
pub fn validation_targets(settings: &EmitSettings) -> Vec<HealthTarget> {
    let mut targets = vec![HealthTarget::Web {
        url: format!("http://127.0.0.1:{}/health", settings.django_port),
    }];

    if settings.dicom.enabled {
        targets.push(HealthTarget::Dicom {
            host: "127.0.0.1".to_string(),
            port: settings.dicom.port,
        });
    }

    if let Some((host, port)) = settings
        .database_url
        .as_deref()
        .and_then(|url| host_port(url, POSTGRES_DEFAULT_PORT))
    {
        targets.push(HealthTarget::Database { host, port });
    }
    if let Some((host, port)) = settings
        .redis_url
        .as_deref()
        .and_then(|url| host_port(url, REDIS_DEFAULT_PORT))
    {
        targets.push(HealthTarget::Cache { host, port });
    }

    targets
}

fn host_port(url: &str, default_port: u16) -> Option<(String, u16)> {
    let parsed = match reqwest::Url::parse(url) {
        Ok(u) => u,
        Err(e) => {
            warn!(url = %url, error = %e, "Unparseable service URL, skipping health check");
            return None;
        }
    };
    let host = parsed.host_str()?.to_string();
    Some((host, parsed.port().unwrap_or(default_port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DicomConfig;
    use axum::{http::StatusCode, routing::get, Router};
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    async fn spawn_server(router: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn fast_checker() -> HealthChecker {
        HealthChecker::with_timing(
            Duration::from_millis(300),
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
    }

    fn settings(django_port: u16) -> EmitSettings {
        EmitSettings {
            django_port,
            dicom: DicomConfig {
                enabled: false,
                ..DicomConfig::default()
            },
            domain: None,
            tls: false,
            secret_key: "k".to_string(),
            app_dir: PathBuf::from("/opt/pacs"),
            wsgi_module: "pacs.wsgi:application".to_string(),
            database_url: None,
            redis_url: None,
            debug: true,
            hostname: None,
        }
    }

    /// 前 `failures` 次返回退出码 1，之后返回 0
    struct FlakyExecutor {
        failures: u32,
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CommandExecutor for FlakyExecutor {
        async fn execute(
            &self,
            spec: &CommandSpec,
            _cancel: &CancellationToken,
        ) -> Result<crate::infra::CommandOutput, CommandError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(spec.to_string());
            let exit_code = if calls.len() as u32 > self.failures { 0 } else { 1 };
            Ok(crate::infra::CommandOutput {
                exit_code: Some(exit_code),
                ..Default::default()
            })
        }
    }

    fn db_target() -> HealthTarget {
        HealthTarget::Container {
            service: "db".to_string(),
            argv: ["docker", "compose", "exec", "-T", "db", "pg_isready", "-U", "pacs"]
                .map(String::from)
                .to_vec(),
        }
    }

    #[tokio::test]
    async fn test_container_target_polls_until_ready() {
        let executor = Arc::new(FlakyExecutor {
            failures: 2,
            calls: Default::default(),
        });
        let checker = HealthChecker::with_timing(
            Duration::from_secs(5),
            Duration::from_millis(10),
            Duration::from_millis(200),
        )
        .with_executor(executor.clone());

        let result = checker.wait_until_reachable(&db_target()).await.unwrap();
        assert!(result.reachable);
        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], "docker compose exec -T db pg_isready -U pacs");
    }

    #[tokio::test]
    async fn test_container_target_not_ready() {
        let checker = fast_checker().with_executor(Arc::new(FlakyExecutor {
            failures: u32::MAX,
            calls: Default::default(),
        }));
        let result = checker.check_once(&db_target()).await;
        assert!(!result.reachable);
        assert_eq!(result.error_kind, Some(HealthErrorKind::NotReady));

        let err = checker.wait_until_reachable(&db_target()).await.unwrap_err();
        assert!(err.target.starts_with("db ("));
        assert_eq!(err.last_error, Some(HealthErrorKind::NotReady));
    }

    #[tokio::test]
    async fn test_web_target_on_configured_port_is_reachable() {
        let port = spawn_server(Router::new().route("/health", get(|| async { "ok" }))).await;
        let targets = validation_targets(&settings(port));
        assert_eq!(targets.len(), 1);

        let result = fast_checker().check_once(&targets[0]).await;
        assert!(result.reachable, "{:?}", result);
        assert!(result.error_kind.is_none());
    }

    #[tokio::test]
    async fn test_non_200_is_bad_status() {
        let port = spawn_server(
            Router::new().route("/health", get(|| async { StatusCode::SERVICE_UNAVAILABLE })),
        )
        .await;
        let target = HealthTarget::Web {
            url: format!("http://127.0.0.1:{}/health", port),
        };
        let result = fast_checker().check_once(&target).await;
        assert!(!result.reachable);
        assert_eq!(result.error_kind, Some(HealthErrorKind::BadStatus(503)));
    }

    #[tokio::test]
    async fn test_closed_port_is_connection_refused() {
        let port = closed_port().await;
        let target = HealthTarget::Dicom {
            host: "127.0.0.1".to_string(),
            port,
        };
        let result = fast_checker().check_once(&target).await;
        assert!(!result.reachable);
        assert_eq!(result.error_kind, Some(HealthErrorKind::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_wait_times_out_with_last_error() {
        let port = closed_port().await;
        let target = HealthTarget::Web {
            url: format!("http://127.0.0.1:{}/health", port),
        };
        let err = fast_checker().wait_until_reachable(&target).await.unwrap_err();
        assert!(err.target.starts_with("web"));
        assert_eq!(err.last_error, Some(HealthErrorKind::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_wait_succeeds_once_server_starts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let router = Router::new().route("/health", get(|| async { "ok" }));
            axum::serve(listener, router).await.unwrap();
        });

        let checker = HealthChecker::with_timing(
            Duration::from_secs(5),
            Duration::from_millis(50),
            Duration::from_millis(500),
        );
        let target = HealthTarget::Web {
            url: format!("http://127.0.0.1:{}/health", port),
        };
        let result = checker.wait_until_reachable(&target).await.unwrap();
        assert!(result.reachable);
    }

    #[test]
    fn test_validation_targets_from_settings() {
        let mut s = settings(8000);
        s.dicom.enabled = true;
        s.database_url = Some("postgres://pacs:pw@10.0.0.5/pacs".to_string());
        s.redis_url = Some("redis://cache.local:6380/0".to_string());

        let targets = validation_targets(&s);
        assert_eq!(
            targets,
            vec![
                HealthTarget::Web {
                    url: "http://127.0.0.1:8000/health".to_string()
                },
                HealthTarget::Dicom {
                    host: "127.0.0.1".to_string(),
                    port: 11112
                },
                HealthTarget::Database {
                    host: "10.0.0.5".to_string(),
                    port: 5432
                },
                HealthTarget::Cache {
                    host: "cache.local".to_string(),
                    port: 6380
                },
            ]
        );
    }

    #[test]
    fn test_unparseable_url_skipped() {
        let mut s = settings(8000);
        s.database_url = Some("not a url".to_string());
        assert_eq!(validation_targets(&s).len(), 1);
    }
}
