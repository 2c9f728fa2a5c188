//! 领域模型模块
//!
//! 纯数据结构，不依赖 tokio

pub mod artifact;
pub mod deploy;
pub mod health;
pub mod manifest;
pub mod system;

// Re-exports for convenience
pub use artifact::{ArtifactKind, ConfigArtifact};
pub use deploy::{DeployStage, DeployState, DeploymentMode, SizingParams, StageStatus};
pub use health::{HealthCheckResult, HealthErrorKind, HealthTarget};
pub use manifest::{Category, Dependency, DependencyManifest};
pub use system::{Architecture, OsFamily, ResourceConstraints, SystemProfile};
