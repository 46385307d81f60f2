//! Template and report engines, looked up by engine name.

use crate::error::AppError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Data handed to a renderer next to the content.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Helpers {
    /// Merged request params.
    pub params: Map<String, Value>,
    /// Route name to pattern, for building links.
    pub routes: BTreeMap<String, String>,
    pub flash: Option<Value>,
    pub format: String,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `template` (a path without extension) with `data`. Output may be binary.
    async fn render(&self, template: &str, data: &Value, helpers: &Helpers) -> Result<Vec<u8>, AppError>;
}

/// Adapts a plain function into a `Renderer`.
pub struct FnRenderer<F>(pub F);

#[async_trait]
impl<F> Renderer for FnRenderer<F>
where
    F: Fn(&str, &Value, &Helpers) -> Result<Vec<u8>, AppError> + Send + Sync,
{
    async fn render(&self, template: &str, data: &Value, helpers: &Helpers) -> Result<Vec<u8>, AppError> {
        (self.0)(template, data, helpers)
    }
}

#[derive(Clone, Default)]
pub struct RendererRegistry {
    engines: HashMap<String, Arc<dyn Renderer>>,
    /// Format name to engine name.
    by_format: HashMap<String, String>,
    default_engine: Option<String>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine. The first one registered is the default.
    pub fn register(&mut self, engine: &str, renderer: impl Renderer + 'static) {
        if self.default_engine.is_none() {
            self.default_engine = Some(engine.to_string());
        }
        self.engines.insert(engine.to_string(), Arc::new(renderer));
    }

    /// Route a format (`pdf`, `html`, ...) to a specific engine.
    pub fn use_for(&mut self, format: &str, engine: &str) {
        self.by_format.insert(format.to_string(), engine.to_string());
    }

    pub fn get(&self, engine: &str) -> Option<Arc<dyn Renderer>> {
        self.engines.get(engine).cloned()
    }

    /// Engine for a format: explicit override, then the format mapping, then the default.
    pub fn resolve(&self, format: &str, engine: Option<&str>) -> Result<Arc<dyn Renderer>, AppError> {
        let name = engine
            .or_else(|| self.by_format.get(format).map(String::as_str))
            .or(self.default_engine.as_deref())
            .ok_or_else(|| AppError::Render(format!("no renderer registered for format {}", format)))?;
        self.get(name)
            .ok_or_else(|| AppError::Render(format!("unknown render engine {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(tag: &'static str) -> FnRenderer<impl Fn(&str, &Value, &Helpers) -> Result<Vec<u8>, AppError>> {
        FnRenderer(move |t: &str, _: &Value, _: &Helpers| Ok(format!("{}:{}", tag, t).into_bytes()))
    }

    #[tokio::test]
    async fn format_mapping_beats_default() {
        let mut reg = RendererRegistry::new();
        reg.register("html", echo("html"));
        reg.register("report", echo("report"));
        reg.use_for("pdf", "report");
        let h = Helpers::default();
        let out = reg.resolve("pdf", None).unwrap().render("user/show", &json!({}), &h).await.unwrap();
        assert_eq!(out, b"report:user/show".to_vec());
        let out = reg.resolve("html", None).unwrap().render("x", &json!({}), &h).await.unwrap();
        assert_eq!(out, b"html:x".to_vec());
        assert!(reg.resolve("html", Some("nope")).is_err());
    }

    #[test]
    fn empty_registry_cannot_render() {
        assert!(matches!(RendererRegistry::new().resolve("html", None), Err(AppError::Render(_))));
    }
}
