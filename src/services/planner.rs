//! 依赖规划
//!
//! 根据画像和部署模式选择依赖类别，并从内置目录生成具体清单。
//! 规划器不下载任何东西，网络问题与它无关。

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::domain::deploy::{DeploymentMode, SizingParams};
use crate::domain::manifest::{Category, Dependency, DependencyManifest};
use crate::domain::system::{Architecture, OsFamily, SystemProfile};
use crate::error::UnresolvableDependencyError;

/// 目录条目
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub constraint: String,
}

/// 依赖目录：类别 → 包列表
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    entries: BTreeMap<Category, Vec<CatalogEntry>>,
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 设置某个类别的包列表
    pub fn with(mut self, category: Category, packages: &[(&str, &str)]) -> Self {
        self.entries.insert(
            category,
            packages
                .iter()
                .map(|(name, constraint)| CatalogEntry {
                    name: name.to_string(),
                    constraint: constraint.to_string(),
                })
                .collect(),
        );
        self
    }

    pub fn packages(&self, category: Category) -> &[CatalogEntry] {
        self.entries.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 内置目录
    pub fn builtin() -> Self {
        Self::empty()
            .with(
                Category::Core,
                &[
                    ("Django", ">=4.2,<5.0"),
                    ("gunicorn", ">=21.2"),
                    ("psycopg2-binary", ">=2.9"),
                    ("dj-database-url", ""),
                    ("whitenoise", ""),
                    ("djangorestframework", ""),
                    ("django-cors-headers", ""),
                    ("django-widget-tweaks", ""),
                    ("python-dotenv", ""),
                ],
            )
            .with(
                Category::Imaging,
                &[
                    ("pydicom", ">=2.4"),
                    ("pynetdicom", ">=2.0"),
                    ("Pillow", ">=10.0"),
                    ("numpy", ""),
                ],
            )
            .with(
                Category::ImagingAdvanced,
                &[
                    ("SimpleITK", ""),
                    ("pylibjpeg", ""),
                    ("pylibjpeg-libjpeg", ""),
                    ("pylibjpeg-openjpeg", ""),
                    ("highdicom", ""),
                ],
            )
            .with(
                Category::ImageProcessing,
                &[
                    ("opencv-python-headless", ""),
                    ("scikit-image", ""),
                    ("matplotlib", ""),
                ],
            )
            .with(
                Category::AiMl,
                &[
                    ("numpy", ""),
                    ("scipy", ""),
                    ("pandas", ""),
                    ("torch", ""),
                    ("torchvision", ""),
                    ("scikit-learn", ""),
                    ("transformers", ""),
                ],
            )
            .with(
                Category::Async,
                &[
                    ("celery", ">=5.3"),
                    ("channels", ">=4.0"),
                    ("channels-redis", ""),
                    ("daphne", ""),
                ],
            )
            .with(Category::Cache, &[("redis", ">=5.0"), ("django-redis", "")])
            .with(
                Category::Documents,
                &[
                    ("reportlab", ""),
                    ("PyMuPDF", ""),
                    ("python-docx", ""),
                    ("openpyxl", ""),
                ],
            )
            .with(Category::Printing, &[("pycups", ""), ("python-escpos", "")])
            .with(
                Category::Utilities,
                &[
                    ("requests", ""),
                    ("cryptography", ""),
                    ("PyJWT", ""),
                    ("qrcode", ""),
                ],
            )
            .with(
                Category::DevTools,
                &[("django-extensions", ""), ("django-debug-toolbar", "")],
            )
    }
}

/// 依赖规划器
pub struct DependencyPlanner {
    catalog: Catalog,
    /// 生产环境不装开发工具
    production: bool,
}

impl DependencyPlanner {
    pub fn new(production: bool) -> Self {
        Self::with_catalog(Catalog::builtin(), production)
    }

    pub fn with_catalog(catalog: Catalog, production: bool) -> Self {
        Self {
            catalog,
            production,
        }
    }

    /// 选择依赖类别（按固定顺序）
    pub fn select_categories(&self, profile: &SystemProfile, mode: DeploymentMode) -> Vec<Category> {
        let constraints = profile.constraints();
        let broker_available = mode.is_containerized();

        Category::ALL
            .into_iter()
            .filter(|category| match category {
                Category::Core | Category::Imaging | Category::Utilities => true,
                Category::ImagingAdvanced => {
                    profile.memory_gb >= 4 && !constraints.storage_limited
                }
                Category::ImageProcessing => {
                    profile.memory_gb >= 2 && profile.supports_compilation()
                }
                Category::AiMl => constraints.can_run_ai_features,
                Category::Async | Category::Cache => broker_available,
                Category::Documents => !constraints.very_low_resources,
                Category::Printing => {
                    profile.os_family != OsFamily::Other && profile.has_build_tools
                }
                Category::DevTools => !self.production,
            })
            .collect()
    }

    /// 生成依赖清单
    pub fn plan(
        &self,
        profile: &SystemProfile,
        mode: DeploymentMode,
    ) -> Result<DependencyManifest, UnresolvableDependencyError> {
        let categories = self.select_categories(profile, mode);
        let mut manifest = DependencyManifest::new();

        for category in categories {
            let packages = self.catalog.packages(category);
            if packages.is_empty() {
                return Err(UnresolvableDependencyError { category });
            }
            for entry in packages {
                let added = manifest.push(Dependency {
                    package_name: entry.name.clone(),
                    version_constraint: entry.constraint.clone(),
                    category,
                });
                if !added {
                    debug!(package = %entry.name, category = %category, "Duplicate package skipped");
                }
            }
        }

        info!(
            mode = %mode,
            packages = manifest.len(),
            categories = ?manifest.categories().iter().map(Category::as_str).collect::<Vec<_>>(),
            "Dependency manifest planned"
        );

        Ok(manifest)
    }
}

/// 渲染 requirements.txt
///
/// 按类别分组，末尾附上架构和系统相关的注释
pub fn render_requirements(manifest: &DependencyManifest, profile: &SystemProfile) -> String {
    let mut out = String::from("# Generated by pacs-deploy. Do not edit by hand.\n");
    for category in manifest.categories() {
        out.push('\n');
        out.push_str(&format!("# {}\n", category.description()));
        for dependency in manifest.in_category(category) {
            out.push_str(&dependency.requirement_line());
            out.push('\n');
        }
    }

    out.push_str("\n# Architecture-specific notes\n");
    for note in architecture_notes(&profile.architecture) {
        out.push_str(&format!("# {}\n", note));
    }
    out.push_str("\n# OS-specific notes\n");
    for note in os_notes(profile.os_family) {
        out.push_str(&format!("# {}\n", note));
    }
    out
}

fn architecture_notes(architecture: &Architecture) -> &'static [&'static str] {
    match architecture {
        Architecture::X86_64 => &[
            "x86_64: most packages have pre-built wheels",
            "Prefer binary packages when available",
        ],
        Architecture::Arm64 => &[
            "arm64: some packages may need compilation from source",
            "Consider --no-binary for packages without arm64 wheels",
        ],
        Architecture::Other(_) => &["No pre-built wheels expected, build tools are required"],
    }
}

fn os_notes(os_family: OsFamily) -> &'static [&'static str] {
    match os_family {
        OsFamily::LinuxDebian => &["Build headers: apt-get install python3-dev libpq-dev libcups2-dev"],
        OsFamily::LinuxRhel => &["Build headers: dnf install python3-devel libpq-devel cups-devel"],
        OsFamily::Other => &["Unrecognized OS, native packages may need manual installation"],
    }
}

/// 给运维的建议
pub fn recommendations(profile: &SystemProfile) -> Vec<String> {
    let constraints = profile.constraints();
    let mut recs = Vec::new();

    if constraints.memory_limited {
        recs.push("Consider adding more RAM for better performance".to_string());
    }
    if constraints.cpu_limited {
        recs.push("System may benefit from additional CPU cores".to_string());
    }
    if constraints.storage_limited {
        recs.push("Free up disk space before installation".to_string());
    }
    if !profile.has_docker {
        recs.push("Consider installing Docker for easier deployment".to_string());
    }
    if !profile.has_build_tools {
        recs.push("Install build tools for packages that require compilation".to_string());
    }
    if profile.architecture != Architecture::X86_64 {
        recs.push("Some packages may need to be compiled from source on this architecture".to_string());
    }

    recs
}

/// 部署报告（写入 deployment-report.json）
///
/// 不含时间戳，保证同样输入得到同样内容
#[derive(Clone, Debug, Serialize)]
pub struct PlanReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub profile: SystemProfile,
    pub mode: DeploymentMode,
    pub sizing: SizingParams,
    pub selected_categories: Vec<Category>,
    pub excluded_categories: Vec<Category>,
    pub constraints_applied: Vec<&'static str>,
    pub recommendations: Vec<String>,
}

impl PlanReport {
    pub fn new(
        profile: &SystemProfile,
        mode: DeploymentMode,
        sizing: SizingParams,
        manifest: &DependencyManifest,
        hostname: Option<String>,
    ) -> Self {
        let selected = manifest.categories();
        let excluded = Category::ALL
            .into_iter()
            .filter(|c| !selected.contains(c))
            .collect();
        Self {
            hostname,
            profile: profile.clone(),
            mode,
            sizing,
            selected_categories: selected,
            excluded_categories: excluded,
            constraints_applied: profile.constraints().applied(),
            recommendations: recommendations(profile),
        }
    }
}
