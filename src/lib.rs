//! PACS Deploy - 按主机资源自动选择部署方式并生成配置
//!
//! 流程：探测主机 → 选择部署模式与规格 → 规划依赖 → 生成配置 → 应用 → 健康检查

pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod logging;
pub mod services;

pub use config::EnvConfig;
pub use error::{DeployError, RunFailure};
pub use services::{DeploymentOrchestrator, RunOptions, RunReport};
