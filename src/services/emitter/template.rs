//! 模板渲染
//!
//! 基于 handlebars，开启严格模式：
//! - `{{name}}` 必填，变量不存在时报 [`TemplateRenderError::MissingVariable`]
//! - 可选片段写成 `{{#if name}}...{{/if}}`，对应变量以 false / null 的形式存在
//!
//! 输出是配置文件，关闭 HTML 转义。

use handlebars::{no_escape, Handlebars, RenderError, RenderErrorReason};
use serde_json::{Map, Value};

use crate::error::TemplateRenderError;

/// 模板变量
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TemplateVars {
    values: Map<String, Value>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.values
            .insert(key.to_string(), Value::String(value.to_string()));
        self
    }

    /// `{{#if}}` 用的开关
    pub fn set_flag(&mut self, key: &str, on: bool) -> &mut Self {
        self.values.insert(key.to_string(), Value::Bool(on));
        self
    }

    /// None 时写入 null：`{{#if}}` 判为假，变量本身仍然存在
    pub fn set_opt(&mut self, key: &str, value: Option<impl ToString>) -> &mut Self {
        let value = value.map_or(Value::Null, |v| Value::String(v.to_string()));
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }
}

/// 具名模板
#[derive(Clone, Copy, Debug)]
pub struct Template {
    pub name: &'static str,
    source: &'static str,
}

impl Template {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }
}

/// 模板引擎
pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(no_escape);
        Self { registry }
    }

    /// 渲染模板，所有必填变量都必须存在
    pub fn render(
        &self,
        template: &Template,
        vars: &TemplateVars,
    ) -> Result<String, TemplateRenderError> {
        self.registry
            .render_template(template.source, &vars.values)
            .map_err(|e| render_error(template.name, e))
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn render_error(template: &str, e: RenderError) -> TemplateRenderError {
    match e.reason() {
        RenderErrorReason::MissingVariable(Some(path)) => TemplateRenderError::MissingVariable {
            template: template.to_string(),
            variable: path.trim_start_matches("this.").to_string(),
        },
        _ => TemplateRenderError::Engine {
            template: template.to_string(),
            reason: e.to_string(),
        },
    }
}
