//! 依赖清单领域模型

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// 依赖类别
///
/// 每个包只属于一个类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// web 框架、WSGI 服务器、数据库驱动
    Core,
    /// DICOM 解析与图像库
    Imaging,
    ImagingAdvanced,
    /// 通用图像处理，需要编译环境
    ImageProcessing,
    /// 机器学习，只在资源充足时安装
    AiMl,
    /// 后台任务（需要 broker）
    Async,
    Cache,
    Documents,
    /// CUPS 打印，依赖系统头文件
    Printing,
    Utilities,
    DevTools,
}

impl Category {
    pub const ALL: [Category; 11] = [
        Category::Core,
        Category::Imaging,
        Category::ImagingAdvanced,
        Category::ImageProcessing,
        Category::AiMl,
        Category::Async,
        Category::Cache,
        Category::Documents,
        Category::Printing,
        Category::Utilities,
        Category::DevTools,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Core => "core",
            Category::Imaging => "imaging",
            Category::ImagingAdvanced => "imaging-advanced",
            Category::ImageProcessing => "image-processing",
            Category::AiMl => "ai-ml",
            Category::Async => "async",
            Category::Cache => "cache",
            Category::Documents => "documents",
            Category::Printing => "printing",
            Category::Utilities => "utilities",
            Category::DevTools => "dev-tools",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Category::Core => "Essential dependencies required for basic functionality",
            Category::Imaging => "DICOM parsing and image handling",
            Category::ImagingAdvanced => "Advanced DICOM codecs and processing (high memory)",
            Category::ImageProcessing => "Image processing and visualization",
            Category::AiMl => "AI and machine learning features (high resources)",
            Category::Async => "Background task processing",
            Category::Cache => "Caching and session storage",
            Category::Documents => "Document and report processing",
            Category::Printing => "Printing support",
            Category::Utilities => "Utility packages",
            Category::DevTools => "Development and debugging tools",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个依赖包
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub package_name: String,
    /// pip 版本约束，可以为空
    pub version_constraint: String,
    pub category: Category,
}

impl Dependency {
    /// requirements.txt 中的一行
    pub fn requirement_line(&self) -> String {
        format!("{}{}", self.package_name, self.version_constraint)
    }
}

/// 有序依赖清单
///
/// 包名不重复（先到先得），`core` 类别总是存在
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DependencyManifest {
    entries: Vec<Dependency>,
}

impl DependencyManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加依赖，包名已存在时忽略并返回 false
    pub fn push(&mut self, dependency: Dependency) -> bool {
        let exists = self
            .entries
            .iter()
            .any(|d| d.package_name.eq_ignore_ascii_case(&dependency.package_name));
        if exists {
            return false;
        }
        self.entries.push(dependency);
        true
    }

    pub fn entries(&self) -> &[Dependency] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_category(&self, category: Category) -> bool {
        self.entries.iter().any(|d| d.category == category)
    }

    /// 出现过的类别（按首次出现顺序）
    pub fn categories(&self) -> Vec<Category> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|d| seen.insert(d.category))
            .map(|d| d.category)
            .collect()
    }

    pub fn in_category(&self, category: Category) -> impl Iterator<Item = &Dependency> {
        self.entries.iter().filter(move |d| d.category == category)
    }
}
