//! 服务层模块
//!
//! 探测 → 策略 → 规划 → 生成 → 应用 → 验证

pub mod emitter;
pub mod health;
pub mod orchestrator;
pub mod planner;
pub mod probe;
pub mod strategy;

pub use emitter::{ConfigEmitter, EmitSettings};
pub use health::HealthChecker;
pub use orchestrator::{DeploymentOrchestrator, RunOptions, RunReport};
pub use planner::DependencyPlanner;
pub use probe::{HostProbe, ResourceProbe};
