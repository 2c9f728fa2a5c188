//! 部署编排
//!
//! 状态机：INIT → PROBED → PLANNED → CONFIGURED → APPLYING → VALIDATING → SUCCEEDED
//! 任意一步失败都进入 FAILED。APPLYING 和 VALIDATING 阶段失败（含中断）时，
//! 已启动的服务按相反顺序停止，已写入的配置保留在磁盘上。

pub mod apply;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EnvConfig;
use crate::domain::artifact::ConfigArtifact;
use crate::domain::deploy::{DeployStage, DeployState, DeploymentMode, SizingParams, StageStatus};
use crate::domain::health::HealthCheckResult;
use crate::domain::manifest::DependencyManifest;
use crate::domain::system::SystemProfile;
use crate::error::{ApplyError, DeployError, RunFailure};
use crate::infra::{run_with_retry, CommandExecutor, CommandRunner, RetryOutcome, RetryPolicy};
use crate::services::emitter::{self, ConfigEmitter, EmitSettings};
use crate::services::health::{validation_targets, HealthChecker};
use crate::services::planner::DependencyPlanner;
use crate::services::probe::{HostProbe, ResourceProbe};
use crate::services::strategy;

use apply::{ApplyStep, NginxSite, NGINX_SITE_LINK};

/// 单次运行参数
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// CLI 指定的模式，优先于 DEPLOYMENT_TYPE
    pub mode_override: Option<DeploymentMode>,
    pub dry_run: bool,
    pub output_dir: PathBuf,
}

/// 成功运行的结果
#[derive(Debug)]
pub struct RunReport {
    /// SUCCEEDED，dry run 时为 CONFIGURED
    pub state: DeployState,
    pub profile: SystemProfile,
    pub mode: DeploymentMode,
    pub sizing: SizingParams,
    pub artifacts: Vec<ConfigArtifact>,
    pub health: Vec<HealthCheckResult>,
    pub stages: Vec<DeployStage>,
}

/// 部署编排器
pub struct DeploymentOrchestrator {
    config: EnvConfig,
    probe: Arc<dyn HostProbe>,
    executor: Arc<dyn CommandExecutor>,
    health: HealthChecker,
    retry: RetryPolicy,
    nginx_site_link: PathBuf,
    cancel: CancellationToken,
}

impl DeploymentOrchestrator {
    pub fn new(config: EnvConfig, cancel: CancellationToken) -> Self {
        let probe: Arc<dyn HostProbe> = Arc::new(ResourceProbe::new(config.app_dir.clone()));
        let executor: Arc<dyn CommandExecutor> = Arc::new(CommandRunner);
        Self {
            config,
            probe,
            health: HealthChecker::new().with_executor(executor.clone()),
            executor,
            retry: RetryPolicy::default(),
            nginx_site_link: PathBuf::from(NGINX_SITE_LINK),
            cancel,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HostProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// 应用步骤和容器内健康检查共用同一个执行器
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.health = self.health.with_executor(executor.clone());
        self.executor = executor;
        self
    }

    pub fn with_health_checker(mut self, health: HealthChecker) -> Self {
        self.health = health.with_executor(self.executor.clone());
        self
    }

    pub fn with_nginx_site_link(mut self, link: impl Into<PathBuf>) -> Self {
        self.nginx_site_link = link.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 执行一次部署
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport, RunFailure> {
        let mut progress = Progress::new();
        match self.execute(&mut progress, options).await {
            Ok(report) => Ok(report),
            Err(e) => Err(progress.fail(e)),
        }
    }

    async fn execute(
        &self,
        progress: &mut Progress,
        options: &RunOptions,
    ) -> Result<RunReport, StepError> {
        let output_dir = std::path::absolute(&options.output_dir).map_err(at("resolve_output_dir"))?;

        // INIT → PROBED
        self.check_cancelled("probe")?;
        progress.start_stage("probe", "Probe host");
        let profile = self.probe.probe().await.map_err(at("probe"))?;
        progress.finish_stage(Some(format!(
            "{}GB / {} cores / {}GB free",
            profile.memory_gb, profile.cpu_cores, profile.storage_gb_free
        )));
        progress.complete(DeployState::Probed);

        // PROBED → PLANNED
        self.check_cancelled("plan")?;
        progress.start_stage("plan", "Plan deployment");
        let requested = options.mode_override.or(self.config.deployment_type);
        let mut plan = self.plan(profile, requested).map_err(at("plan"))?;
        progress.finish_stage(Some(format!(
            "{}, {} workers, {} packages",
            plan.mode,
            plan.sizing.worker_count,
            plan.manifest.len()
        )));
        progress.complete(DeployState::Planned);

        // PLANNED → CONFIGURED
        self.check_cancelled("emit")?;
        progress.start_stage("emit", "Write configuration");
        let secret_key = self.resolve_secret_key(&output_dir).await;
        let hostname = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().into_owned());
        let settings = EmitSettings::from_config(&self.config, secret_key).with_hostname(hostname);
        let mut artifacts = self
            .emit(&settings, &plan, &output_dir)
            .await
            .map_err(at("emit"))?;
        progress.finish_stage(Some(format!("{} files in {}", artifacts.len(), output_dir.display())));
        progress.complete(DeployState::Configured);

        if options.dry_run {
            info!(output_dir = %output_dir.display(), "Dry run, stopping after configuration");
            progress.skip_stage("apply", "Apply", "dry run");
            progress.skip_stage("validate", "Validate", "dry run");
            return Ok(progress.report(DeployState::Configured, plan, artifacts, Vec::new()));
        }

        // CONFIGURED → APPLYING
        self.check_cancelled("apply")?;
        progress.enter(DeployState::Applying);
        let mut undo_stack = Vec::new();
        if let Err(e) = self
            .apply(progress, &mut plan, &mut artifacts, &settings, &output_dir, &mut undo_stack)
            .await
        {
            self.unwind(&undo_stack).await;
            return Err(e);
        }

        // APPLYING → VALIDATING
        progress.enter(DeployState::Validating);
        progress.start_stage("validate", "Validate");
        let health = match self.validate(&settings, &plan, &output_dir).await {
            Ok(results) => results,
            Err(e) => {
                self.unwind(&undo_stack).await;
                return Err(e);
            }
        };
        progress.finish_stage(Some(format!("{} target(s) reachable", health.len())));

        progress.complete(DeployState::Succeeded);
        Ok(progress.report(DeployState::Succeeded, plan, artifacts, health))
    }

    fn plan(
        &self,
        profile: SystemProfile,
        requested: Option<DeploymentMode>,
    ) -> Result<Plan, DeployError> {
        let (mode, sizing) = strategy::select_with_override(&profile, requested);
        let manifest = DependencyPlanner::new(self.config.production).plan(&profile, mode)?;
        info!(
            mode = %mode,
            workers = sizing.worker_count,
            memory_limit_mb = sizing.memory_limit_mb,
            db_pool_size = sizing.db_pool_size,
            "Deployment planned"
        );
        Ok(Plan {
            profile,
            mode,
            sizing,
            manifest,
        })
    }

    async fn emit(
        &self,
        settings: &EmitSettings,
        plan: &Plan,
        output_dir: &Path,
    ) -> Result<Vec<ConfigArtifact>, DeployError> {
        ConfigEmitter::new(settings.clone(), plan.profile.clone())
            .emit(plan.mode, &plan.sizing, &plan.manifest, output_dir)
            .await
    }

    /// SECRET_KEY：环境变量 → 上次生成的 .env → 新生成
    async fn resolve_secret_key(&self, output_dir: &Path) -> String {
        if let Some(ref key) = self.config.secret_key {
            return key.clone();
        }
        if let Some(key) = emitter::previous_secret_key(output_dir).await {
            info!("Reusing SECRET_KEY from previous configuration");
            return key;
        }
        info!("Generating new SECRET_KEY");
        format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
    }

    async fn apply(
        &self,
        progress: &mut Progress,
        plan: &mut Plan,
        artifacts: &mut Vec<ConfigArtifact>,
        settings: &EmitSettings,
        output_dir: &Path,
        undo_stack: &mut Vec<ApplyStep>,
    ) -> Result<(), StepError> {
        // 回滚时恢复部署前的站点链接
        let nginx = NginxSite::inspect(&self.nginx_site_link).await;

        if plan.mode == DeploymentMode::InstallDependencies {
            progress.start_stage("bootstrap", "Install system packages");
            let steps = apply::plan_steps(plan.mode, &plan.profile, settings, &nginx, output_dir)
                .map_err(at("bootstrap"))?;
            self.run_steps(&steps, undo_stack).await?;

            // 只重新探测一次
            self.check_cancelled("reprobe")?;
            let profile = self.probe.probe().await.map_err(at("reprobe"))?;
            let next = self.plan(profile, None).map_err(at("reprobe"))?;
            if next.mode == DeploymentMode::InstallDependencies {
                return Err(StepError::new("reprobe", ApplyError::BootstrapIneffective));
            }
            info!(mode = %next.mode, "Host re-classified after bootstrap");

            *artifacts = self
                .emit(settings, &next, output_dir)
                .await
                .map_err(at("emit"))?;
            *plan = next;
            progress.finish_stage(Some(format!("re-selected {}", plan.mode)));
        }

        progress.start_stage("apply", "Apply");
        let steps = apply::plan_steps(plan.mode, &plan.profile, settings, &nginx, output_dir)
            .map_err(at("apply"))?;
        self.run_steps(&steps, undo_stack).await?;
        progress.finish_stage(Some(format!("{} step(s)", steps.len())));
        Ok(())
    }

    /// 顺序执行步骤，失败即停止，后续步骤不再尝试
    async fn run_steps(
        &self,
        steps: &[ApplyStep],
        undo_stack: &mut Vec<ApplyStep>,
    ) -> Result<(), StepError> {
        for step in steps {
            self.check_cancelled(&step.name)?;

            // 先登记撤销命令：命令中途被打断时服务可能已经部分启动
            if step.undo.is_some() {
                undo_stack.push(step.clone());
            }

            info!(step = %step.name, command = %step.command, "Running apply step");
            match run_with_retry(self.executor.as_ref(), &step.command, self.retry, &self.cancel)
                .await
            {
                RetryOutcome::Succeeded { attempts, .. } => {
                    info!(step = %step.name, attempts, "Apply step succeeded");
                }
                RetryOutcome::Exhausted {
                    attempts,
                    exit_code,
                    reason,
                } => {
                    error!(step = %step.name, attempts, ?exit_code, reason = %reason, "Apply step failed");
                    return Err(StepError::new(
                        step.name.clone(),
                        ApplyError::StepFailed {
                            step: step.name.clone(),
                            command: step.command.to_string(),
                            exit_code,
                            attempts,
                            reason,
                        },
                    ));
                }
                RetryOutcome::Cancelled => {
                    warn!(step = %step.name, "Apply step interrupted");
                    return Err(StepError::new(
                        step.name.clone(),
                        ApplyError::Interrupted {
                            step: step.name.clone(),
                        },
                    ));
                }
            }
        }
        Ok(())
    }

    /// 按相反顺序执行撤销命令
    ///
    /// 使用独立的取消令牌，中断信号不会打断回滚本身
    async fn unwind(&self, undo_stack: &[ApplyStep]) {
        if undo_stack.is_empty() {
            return;
        }
        warn!(steps = undo_stack.len(), "Unwinding started services");
        let unwind_token = CancellationToken::new();

        for step in undo_stack.iter().rev() {
            let Some(ref undo) = step.undo else {
                continue;
            };
            match run_with_retry(self.executor.as_ref(), undo, self.retry, &unwind_token).await {
                RetryOutcome::Succeeded { .. } => {
                    info!(step = %step.name, command = %undo, "Undo succeeded");
                }
                RetryOutcome::Exhausted { reason, .. } => {
                    error!(step = %step.name, command = %undo, reason = %reason, "Undo failed");
                }
                RetryOutcome::Cancelled => {}
            }
        }
    }

    async fn validate(
        &self,
        settings: &EmitSettings,
        plan: &Plan,
        output_dir: &Path,
    ) -> Result<Vec<HealthCheckResult>, StepError> {
        let mut targets = validation_targets(settings);
        if plan.mode.is_containerized() {
            targets.extend(apply::compose_health_targets(
                &plan.profile,
                settings,
                &plan.manifest,
                output_dir,
            ));
        }

        let mut results = Vec::new();
        for target in targets {
            let step = format!("health_{}", target.name());
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(StepError::new(step.clone(), ApplyError::Interrupted { step }));
                }
                r = self.health.wait_until_reachable(&target) => {
                    r.map_err(|e| StepError::new(step, e))?
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    fn check_cancelled(&self, step: &str) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            warn!(step, "Interrupt received");
            return Err(StepError::new(
                step,
                ApplyError::Interrupted {
                    step: step.to_string(),
                },
            ));
        }
        Ok(())
    }
}

/// 已规划的部署
struct Plan {
    profile: SystemProfile,
    mode: DeploymentMode,
    sizing: SizingParams,
    manifest: DependencyManifest,
}

/// 失败的步骤
struct StepError {
    step: String,
    source: DeployError,
}

impl StepError {
    fn new(step: impl Into<String>, source: impl Into<DeployError>) -> Self {
        Self {
            step: step.into(),
            source: source.into(),
        }
    }
}

fn at<E: Into<DeployError>>(step: &'static str) -> impl FnOnce(E) -> StepError {
    move |e| StepError::new(step, e)
}

/// 运行进度：当前状态、最后完成的状态和阶段记录
struct Progress {
    state: DeployState,
    last_completed: DeployState,
    stages: Vec<DeployStage>,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: DeployState::Init,
            last_completed: DeployState::Init,
            stages: Vec::new(),
        }
    }

    /// 进入执行中的状态（APPLYING / VALIDATING）
    fn enter(&mut self, next: DeployState) {
        info!(from = %self.state, to = %next, "State transition");
        if matches!(self.state, DeployState::Applying | DeployState::Validating) {
            self.last_completed = self.state;
        }
        self.state = next;
    }

    /// 进入结果状态，同时记为已完成
    fn complete(&mut self, reached: DeployState) {
        self.enter(reached);
        self.last_completed = reached;
    }

    fn start_stage(&mut self, name: &str, display_name: &str) {
        let mut stage = DeployStage::new(name, display_name);
        stage.start();
        self.stages.push(stage);
    }

    fn finish_stage(&mut self, message: Option<String>) {
        if let Some(stage) = self.stages.last_mut() {
            stage.finish(true, message);
        }
    }

    fn skip_stage(&mut self, name: &str, display_name: &str, reason: &str) {
        let mut stage = DeployStage::new(name, display_name);
        stage.skip(Some(reason.to_string()));
        self.stages.push(stage);
    }

    fn report(
        &self,
        state: DeployState,
        plan: Plan,
        artifacts: Vec<ConfigArtifact>,
        health: Vec<HealthCheckResult>,
    ) -> RunReport {
        RunReport {
            state,
            profile: plan.profile,
            mode: plan.mode,
            sizing: plan.sizing,
            artifacts,
            health,
            stages: self.stages.clone(),
        }
    }

    fn fail(mut self, err: StepError) -> RunFailure {
        if let Some(stage) = self.stages.last_mut() {
            if stage.status == StageStatus::Running {
                stage.finish(false, Some(err.source.to_string()));
            }
        }
        let failed_state = self.state;
        error!(
            state = %failed_state,
            last_completed = %self.last_completed,
            step = %err.step,
            error = %err.source,
            "Deployment failed"
        );
        let failed = DeployState::Failed;
        info!(from = %failed_state, to = %failed, "State transition");

        RunFailure {
            last_completed: self.last_completed,
            failed_state,
            step: err.step,
            source: err.source,
            stages: self.stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DicomConfig;
    use crate::domain::system::OsFamily;
    use crate::error::ProbeError;
    use crate::infra::{CommandError, CommandOutput, CommandSpec};
    use async_trait::async_trait;
    use axum::{routing::get, Router};
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::sync::Notify;

    /// 按顺序返回预设画像，最后一个重复使用
    struct ScriptedProbe {
        profiles: Mutex<VecDeque<Result<SystemProfile, String>>>,
    }

    impl ScriptedProbe {
        fn new(profiles: Vec<Result<SystemProfile, String>>) -> Arc<Self> {
            Arc::new(Self {
                profiles: Mutex::new(profiles.into()),
            })
        }
    }

    #[async_trait]
    impl HostProbe for ScriptedProbe {
        async fn probe(&self) -> Result<SystemProfile, ProbeError> {
            let mut profiles = self.profiles.lock().unwrap();
            let next = if profiles.len() > 1 {
                profiles.pop_front().unwrap()
            } else {
                profiles.front().cloned().unwrap()
            };
            next.map_err(ProbeError)
        }
    }

    /// 记录命令并跟踪处于运行中的服务
    #[derive(Default)]
    struct RecordingExecutor {
        commands: Mutex<Vec<String>>,
        live: Mutex<HashSet<String>>,
        /// 命令包含该片段时总是失败
        fail_on: Option<String>,
        /// 命令包含该片段时标记服务已启动，然后阻塞直到取消
        hang_on: Option<String>,
        reached_hang: Notify,
    }

    impl RecordingExecutor {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn live(&self) -> HashSet<String> {
            self.live.lock().unwrap().clone()
        }

        fn track(&self, spec: &CommandSpec) {
            let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
            let mut live = self.live.lock().unwrap();
            match (spec.program.as_str(), args.as_slice()) {
                ("systemctl", ["start" | "restart", unit]) => {
                    live.insert(unit.to_string());
                }
                ("systemctl", ["stop", unit]) => {
                    live.remove(*unit);
                }
                ("docker", [.., "up", "-d", "--build"]) => {
                    live.insert("compose".to_string());
                }
                ("docker", [.., "down"]) => {
                    live.remove("compose");
                }
                _ => {}
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(
            &self,
            spec: &CommandSpec,
            cancel: &CancellationToken,
        ) -> Result<CommandOutput, CommandError> {
            let line = spec.to_string();
            self.commands.lock().unwrap().push(line.clone());

            if self.hang_on.as_deref().is_some_and(|p| line.contains(p)) {
                self.track(spec);
                self.reached_hang.notify_one();
                cancel.cancelled().await;
                return Err(CommandError::Cancelled);
            }
            if self.fail_on.as_deref().is_some_and(|p| line.contains(p)) {
                return Ok(CommandOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: "unit failed".to_string(),
                });
            }

            self.track(spec);
            Ok(CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    fn native_profile() -> SystemProfile {
        SystemProfile {
            os_family: OsFamily::LinuxDebian,
            storage_gb_free: 20,
            has_systemd: true,
            has_python3: true,
            ..SystemProfile::with_resources(2, 1)
        }
    }

    fn config(app_dir: &Path, django_port: u16, dicom_enabled: bool) -> EnvConfig {
        EnvConfig {
            django_port,
            dicom: DicomConfig {
                enabled: dicom_enabled,
                ..DicomConfig::default()
            },
            app_dir: app_dir.to_path_buf(),
            production: true,
            ..EnvConfig::default()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn fast_health() -> HealthChecker {
        HealthChecker::with_timing(
            Duration::from_millis(300),
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
    }

    async fn health_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let router = Router::new().route("/health", get(|| async { "ok" }));
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn orchestrator(
        config: EnvConfig,
        probe: Arc<dyn HostProbe>,
        executor: Arc<RecordingExecutor>,
        cancel: CancellationToken,
    ) -> DeploymentOrchestrator {
        let site_link = config.app_dir.join("nginx-site.conf");
        DeploymentOrchestrator::new(config, cancel)
            .with_probe(probe)
            .with_executor(executor)
            .with_health_checker(fast_health())
            .with_retry_policy(fast_retry())
            .with_nginx_site_link(site_link)
    }

    fn options(dir: &TempDir, dry_run: bool) -> RunOptions {
        RunOptions {
            mode_override: None,
            dry_run,
            output_dir: dir.path().join("deploy"),
        }
    }

    #[tokio::test]
    async fn test_dry_run_stops_after_configured() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            config(dir.path(), 8000, true),
            ScriptedProbe::new(vec![Ok(native_profile())]),
            executor.clone(),
            CancellationToken::new(),
        );

        let report = orch.run(&options(&dir, true)).await.unwrap();
        assert_eq!(report.state, DeployState::Configured);
        assert_eq!(report.mode, DeploymentMode::NativeSystemd);
        assert!(executor.commands().is_empty());
        assert!(dir.path().join("deploy/pacs-web.service").exists());
        assert_eq!(report.stages.last().unwrap().status, StageStatus::Skipped);
    }

    async fn dry_run(dir: &TempDir) -> RunReport {
        orchestrator(
            config(dir.path(), 8000, false),
            ScriptedProbe::new(vec![Ok(native_profile())]),
            Arc::new(RecordingExecutor::default()),
            CancellationToken::new(),
        )
        .run(&options(dir, true))
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_secret_key_reused_between_runs() {
        let dir = TempDir::new().unwrap();
        let first = dry_run(&dir).await;
        let second = dry_run(&dir).await;
        let checksums =
            |r: &RunReport| r.artifacts.iter().map(|a| a.checksum.clone()).collect::<Vec<_>>();
        assert_eq!(checksums(&first), checksums(&second));
    }

    #[tokio::test]
    async fn test_mode_override_wins() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            config(dir.path(), 8000, false),
            ScriptedProbe::new(vec![Ok(native_profile())]),
            Arc::new(RecordingExecutor::default()),
            CancellationToken::new(),
        );
        let mut opts = options(&dir, true);
        opts.mode_override = Some(DeploymentMode::DockerMinimal);
        let report = orch.run(&opts).await.unwrap();
        assert_eq!(report.mode, DeploymentMode::DockerMinimal);
        assert!(dir.path().join("deploy/docker-compose.yml").exists());
    }

    #[tokio::test]
    async fn test_probe_failure_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            config(dir.path(), 8000, false),
            ScriptedProbe::new(vec![Err("no /proc".to_string())]),
            Arc::new(RecordingExecutor::default()),
            CancellationToken::new(),
        );
        let failure = orch.run(&options(&dir, false)).await.unwrap_err();
        assert_eq!(failure.exit_code(), 1);
        assert_eq!(failure.last_completed, DeployState::Init);
        assert_eq!(failure.step, "probe");
        assert!(!dir.path().join("deploy").exists());
    }

    #[tokio::test]
    async fn test_successful_native_run() {
        let dir = TempDir::new().unwrap();
        let port = health_server().await;
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            config(dir.path(), port, false),
            ScriptedProbe::new(vec![Ok(native_profile())]),
            executor.clone(),
            CancellationToken::new(),
        );

        let report = orch.run(&options(&dir, false)).await.unwrap();
        assert_eq!(report.state, DeployState::Succeeded);
        assert_eq!(report.health.len(), 1);
        assert!(report.health[0].reachable);
        assert!(executor.live().contains("pacs-web.service"));
        assert!(report
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Success));
    }

    #[tokio::test]
    async fn test_step_failure_unwinds_and_stops() {
        let dir = TempDir::new().unwrap();
        let mut profile = native_profile();
        profile.has_nginx = true;
        let executor = Arc::new(RecordingExecutor {
            fail_on: Some("restart pacs-dicom.service".to_string()),
            ..Default::default()
        });
        let orch = orchestrator(
            config(dir.path(), 8000, true),
            ScriptedProbe::new(vec![Ok(profile)]),
            executor.clone(),
            CancellationToken::new(),
        );

        let failure = orch.run(&options(&dir, false)).await.unwrap_err();
        assert_eq!(failure.exit_code(), 2);
        assert_eq!(failure.failed_state, DeployState::Applying);
        assert_eq!(failure.last_completed, DeployState::Configured);
        assert_eq!(failure.step, "start_dicom");
        match failure.source {
            DeployError::Apply(ApplyError::StepFailed { attempts, exit_code, .. }) => {
                assert_eq!(attempts, 4);
                assert_eq!(exit_code, Some(1));
            }
            ref other => panic!("unexpected error: {:?}", other),
        }

        let commands = executor.commands();
        let dicom_attempts = commands
            .iter()
            .filter(|c| c.as_str() == "systemctl restart pacs-dicom.service")
            .count();
        assert_eq!(dicom_attempts, 4);
        assert!(!commands.iter().any(|c| c.contains("nginx -t")));
        assert!(commands.contains(&"systemctl stop pacs-web.service".to_string()));
        assert!(executor.live().is_empty());
    }

    #[tokio::test]
    async fn test_health_timeout_unwinds_but_keeps_config() {
        let dir = TempDir::new().unwrap();
        let port = closed_port().await;
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            config(dir.path(), port, false),
            ScriptedProbe::new(vec![Ok(native_profile())]),
            executor.clone(),
            CancellationToken::new(),
        );

        let failure = orch.run(&options(&dir, false)).await.unwrap_err();
        assert_eq!(failure.exit_code(), 3);
        assert_eq!(failure.failed_state, DeployState::Validating);
        assert_eq!(failure.last_completed, DeployState::Applying);
        assert_eq!(failure.step, "health_web");
        assert!(executor.live().is_empty());
        assert!(dir.path().join("deploy/.env").exists());
    }

    #[tokio::test]
    async fn test_interrupt_during_applying_leaves_nothing_running() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(RecordingExecutor {
            hang_on: Some("restart pacs-dicom.service".to_string()),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let orch = orchestrator(
            config(dir.path(), 8000, true),
            ScriptedProbe::new(vec![Ok(native_profile())]),
            executor.clone(),
            cancel.clone(),
        );

        let trigger = {
            let executor = executor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                executor.reached_hang.notified().await;
                // web 和 dicom 此时都被视为已启动
                assert_eq!(executor.live().len(), 2);
                cancel.cancel();
            })
        };

        let opts = options(&dir, false);
        let failure = tokio::time::timeout(Duration::from_secs(10), orch.run(&opts))
            .await
            .unwrap()
            .unwrap_err();
        trigger.await.unwrap();

        assert_eq!(failure.exit_code(), 2);
        assert_eq!(failure.failed_state, DeployState::Applying);
        assert!(matches!(
            failure.source,
            DeployError::Apply(ApplyError::Interrupted { ref step }) if step == "start_dicom"
        ));
        assert!(executor.live().is_empty(), "still running: {:?}", executor.live());

        let commands = executor.commands();
        let stop_dicom = commands
            .iter()
            .position(|c| c == "systemctl stop pacs-dicom.service")
            .unwrap();
        let stop_web = commands
            .iter()
            .position(|c| c == "systemctl stop pacs-web.service")
            .unwrap();
        assert!(stop_dicom < stop_web);
    }

    #[tokio::test]
    async fn test_interrupt_before_start_fails_fast() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            config(dir.path(), 8000, false),
            ScriptedProbe::new(vec![Ok(native_profile())]),
            executor.clone(),
            cancel,
        );
        let failure = orch.run(&options(&dir, false)).await.unwrap_err();
        assert_eq!(failure.exit_code(), 2);
        assert_eq!(failure.step, "probe");
        assert!(executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_then_reselect() {
        let dir = TempDir::new().unwrap();
        let port = health_server().await;
        let mut bare = SystemProfile::with_resources(2, 1);
        bare.os_family = OsFamily::LinuxDebian;
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            config(dir.path(), port, false),
            ScriptedProbe::new(vec![Ok(bare), Ok(native_profile())]),
            executor.clone(),
            CancellationToken::new(),
        );

        let report = orch.run(&options(&dir, false)).await.unwrap();
        assert_eq!(report.state, DeployState::Succeeded);
        assert_eq!(report.mode, DeploymentMode::NativeSystemd);

        let commands = executor.commands();
        assert_eq!(commands[0], "apt-get update");
        assert!(commands.iter().any(|c| c == "systemctl restart pacs-web.service"));
        assert!(report.stages.iter().any(|s| s.name == "bootstrap"));
    }

    #[tokio::test]
    async fn test_bootstrap_ineffective() {
        let dir = TempDir::new().unwrap();
        let mut bare = SystemProfile::with_resources(1, 1);
        bare.os_family = OsFamily::LinuxRhel;
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            config(dir.path(), 8000, false),
            ScriptedProbe::new(vec![Ok(bare)]),
            executor.clone(),
            CancellationToken::new(),
        );

        let failure = orch.run(&options(&dir, false)).await.unwrap_err();
        assert_eq!(failure.exit_code(), 2);
        assert!(matches!(
            failure.source,
            DeployError::Apply(ApplyError::BootstrapIneffective)
        ));
        assert!(executor.commands()[0].starts_with("dnf install -y"));
    }

    #[tokio::test]
    async fn test_docker_run_against_emitted_port() {
        let dir = TempDir::new().unwrap();
        let port = health_server().await;
        let profile = SystemProfile {
            storage_gb_free: 50,
            has_docker: true,
            has_compose: true,
            ..SystemProfile::with_resources(8, 4)
        };
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            config(dir.path(), port, false),
            ScriptedProbe::new(vec![Ok(profile)]),
            executor.clone(),
            CancellationToken::new(),
        );

        let report = orch.run(&options(&dir, false)).await.unwrap();
        assert_eq!(report.mode, DeploymentMode::DockerFull);
        assert_eq!(report.sizing.worker_count, 8);
        assert!(executor.live().contains("compose"));

        let compose = std::fs::read_to_string(dir.path().join("deploy/docker-compose.yml")).unwrap();
        assert!(compose.contains(&format!("\"{}:{}\"", port, port)));
        assert!(report.health[0].reachable);

        let checked: Vec<&str> = report.health.iter().map(|h| h.target.name()).collect();
        assert_eq!(checked, vec!["web", "db", "redis"]);
        assert!(report.health.iter().all(|h| h.reachable));
        let commands = executor.commands();
        assert!(commands.iter().any(|c| c.ends_with("exec -T db pg_isready -U pacs -d pacs")));
        assert!(commands.iter().any(|c| c.ends_with("exec -T redis redis-cli ping")));
    }

    #[tokio::test]
    async fn test_running_unit_is_restarted() {
        let dir = TempDir::new().unwrap();
        let port = health_server().await;
        let executor = Arc::new(RecordingExecutor::default());
        executor
            .live
            .lock()
            .unwrap()
            .insert("pacs-web.service".to_string());
        let orch = orchestrator(
            config(dir.path(), port, false),
            ScriptedProbe::new(vec![Ok(native_profile())]),
            executor.clone(),
            CancellationToken::new(),
        );

        let report = orch.run(&options(&dir, false)).await.unwrap();
        assert_eq!(report.state, DeployState::Succeeded);
        let commands = executor.commands();
        assert!(commands.contains(&"systemctl restart pacs-web.service".to_string()));
        assert!(!commands.iter().any(|c| c.starts_with("systemctl start ")));
    }

    #[tokio::test]
    async fn test_compose_db_not_ready_fails_validation() {
        let dir = TempDir::new().unwrap();
        let port = health_server().await;
        let profile = SystemProfile {
            storage_gb_free: 50,
            has_docker: true,
            has_compose: true,
            ..SystemProfile::with_resources(8, 4)
        };
        let executor = Arc::new(RecordingExecutor {
            fail_on: Some("pg_isready".to_string()),
            ..Default::default()
        });
        let orch = orchestrator(
            config(dir.path(), port, false),
            ScriptedProbe::new(vec![Ok(profile)]),
            executor.clone(),
            CancellationToken::new(),
        );

        let failure = orch.run(&options(&dir, false)).await.unwrap_err();
        assert_eq!(failure.exit_code(), 3);
        assert_eq!(failure.step, "health_db");
        assert!(executor.live().is_empty());
        assert!(executor.commands().iter().any(|c| c.ends_with(" down")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unwind_restores_previous_nginx_site() {
        let dir = TempDir::new().unwrap();
        let port = closed_port().await;
        let link = dir.path().join("nginx-site.conf");
        std::os::unix::fs::symlink("/srv/old/nginx.conf", &link).unwrap();

        let mut profile = native_profile();
        profile.has_nginx = true;
        let executor = Arc::new(RecordingExecutor::default());
        let orch = orchestrator(
            config(dir.path(), port, false),
            ScriptedProbe::new(vec![Ok(profile)]),
            executor.clone(),
            CancellationToken::new(),
        );

        let failure = orch.run(&options(&dir, false)).await.unwrap_err();
        assert_eq!(failure.exit_code(), 3);

        let restore = format!("ln -sfn '/srv/old/nginx.conf' '{}'", link.display());
        let commands = executor.commands();
        assert!(commands.iter().any(|c| c.contains(&restore)), "{:?}", commands);
        assert!(!commands.iter().any(|c| c.contains("rm -f")));
    }
}
