//! The template engine.
//!
//! [`Environment`] is a tera instance pre-loaded with the whole filter,
//! function and test library plus the `RE_*` regex-flag globals. A
//! compiled template renders a scene into text, JSON, or a validated
//! [`StacItem`]. Rendering is synchronous; the orchestrator drives it
//! on blocking worker threads.

pub mod fetch;
pub mod filters;
pub mod functions;
pub mod geometry;
pub mod proj;
pub mod raster;
pub mod testers;
pub mod validation;

use std::sync::Arc;

use serde_json::{Map, Value};
use tera::{Context, Tera};
use tracing::debug;

pub use fetch::{BlobFetcher, HttpFetcher, MemoryFetcher};

use crate::error::RenderError;
use crate::stac::StacItem;

/// Regex flag globals exposed to every template, value-compatible with
/// the flag integers of Python's `re` module.
const REGEX_FLAG_GLOBALS: &[(&str, i64)] = &[
    ("RE_NOFLAG", 0),
    ("RE_IGNORECASE", 2),
    ("RE_LOCALE", 4),
    ("RE_MULTILINE", 8),
    ("RE_DOTALL", 16),
    ("RE_UNICODE", 32),
    ("RE_VERBOSE", 64),
    ("RE_ASCII", 256),
];

/// Template environment with the full library registered.
pub struct Environment {
    tera: Tera,
}

impl Environment {
    pub fn new(fetcher: Arc<dyn BlobFetcher>) -> Self {
        let mut tera = Tera::default();
        filters::register_filters(&mut tera);
        functions::register_functions(&mut tera, fetcher);
        testers::register_testers(&mut tera);
        Self { tera }
    }

    /// Compiles a template under `name`.
    ///
    /// # Errors
    ///
    /// `RenderError::Syntax` on parse failure; fatal for the run that
    /// carries the template.
    pub fn compile(&mut self, name: &str, source: &str) -> Result<(), RenderError> {
        debug!(template = name, "compiling template");
        self.tera
            .add_raw_template(name, source)
            .map_err(|e| RenderError::Syntax(error_chain(&e)))
    }

    /// Registers a shared fragment that templates may include or extend.
    pub fn add_fragment(&mut self, name: &str, source: &str) -> Result<(), RenderError> {
        self.compile(name, source)
    }

    fn base_context() -> Context {
        let mut context = Context::new();
        for (name, value) in REGEX_FLAG_GLOBALS {
            context.insert(*name, value);
        }
        context
    }

    /// Renders a compiled template against one scene.
    pub fn render_text(
        &self,
        name: &str,
        scene_info: &Value,
        extra: Option<&Map<String, Value>>,
    ) -> Result<String, RenderError> {
        let mut context = Self::base_context();
        context.insert("scene_info", scene_info);
        if let Some(extra) = extra {
            for (key, value) in extra {
                context.insert(key, value);
            }
        }
        self.tera.render(name, &context).map_err(|e| {
            if matches!(e.kind, tera::ErrorKind::TemplateNotFound(_)) {
                RenderError::TemplateNotFound(name.to_string())
            } else {
                RenderError::Runtime(error_chain(&e))
            }
        })
    }

    /// Renders and parses the output as one JSON document.
    pub fn render_json(
        &self,
        name: &str,
        scene_info: &Value,
        extra: Option<&Map<String, Value>>,
    ) -> Result<Value, RenderError> {
        let text = self.render_text(name, scene_info, extra)?;
        serde_json::from_str(&text).map_err(|e| RenderError::Json(e.to_string()))
    }

    /// Renders a scene into a validated STAC item.
    pub fn render_item(
        &self,
        name: &str,
        scene_info: &Value,
        extra: Option<&Map<String, Value>>,
    ) -> Result<StacItem, RenderError> {
        let value = self.render_json(name, scene_info, extra)?;
        StacItem::from_value(value)
    }
}

/// Flattens an error and its source chain into one message. Tera buries
/// the interesting part (a failed filter, a missing key) in the chain.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn environment() -> Environment {
        Environment::new(Arc::new(MemoryFetcher::new()))
    }

    #[test]
    fn renders_scene_url_into_id() {
        let mut env = environment();
        env.compile(
            "minimal",
            r#"{"id": "{{ scene_info | split(pat="/") | last }}"}"#,
        )
        .unwrap();
        let out = env
            .render_json("minimal", &json!("https://x/y/item123.tif"), None)
            .unwrap();
        assert_eq!(out["id"], json!("item123.tif"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut env = environment();
        env.compile(
            "det",
            r#"{"id": "{{ scene_info | regex_sub(pattern="\\.tif$", repl="") }}", "n": {{ 2 + 3 }}}"#,
        )
        .unwrap();
        let scene = json!("scene_a.tif");
        let first = env.render_text("det", &scene, None).unwrap();
        let second = env.render_text("det", &scene, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn syntax_error_is_fatal() {
        let mut env = environment();
        let err = env.compile("broken", "{% if %}").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_template_reported() {
        let env = environment();
        let err = env
            .render_text("never-compiled", &json!("x"), None)
            .unwrap_err();
        assert!(matches!(err, RenderError::TemplateNotFound(_)));
    }

    #[test]
    fn runtime_error_is_scene_scoped() {
        let mut env = environment();
        env.compile("bad", r#"{{ scene_info | regex_sub(repl="x") }}"#)
            .unwrap();
        let err = env.render_text("bad", &json!("abc"), None).unwrap_err();
        assert!(matches!(err, RenderError::Runtime(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn invalid_json_output_rejected() {
        let mut env = environment();
        env.compile("notjson", "this is {{ scene_info }} not json")
            .unwrap();
        let err = env.render_json("notjson", &json!("x"), None).unwrap_err();
        assert!(matches!(err, RenderError::Json(_)));
    }

    #[test]
    fn fragments_can_be_included() {
        let mut env = environment();
        env.add_fragment("assets.json", r#""assets": {"data": {"href": "{{ scene_info }}"}}"#)
            .unwrap();
        env.compile("with-include", r#"{ {% include "assets.json" %} }"#)
            .unwrap();
        let out = env
            .render_text("with-include", &json!("https://x/a.tif"), None)
            .unwrap();
        assert!(out.contains(r#""href": "https://x/a.tif""#));
    }

    #[test]
    fn renders_full_item(){
        let mut env = environment();
        env.compile(
            "item",
            r#"{
  "type": "Feature",
  "stac_version": "1.0.0",
  "id": "{{ scene_info | split(pat="/") | last | regex_sub(pattern="\\.tif$", repl="") }}",
  "geometry": {"type": "Point", "coordinates": [15.0, 37.0]},
  "bbox": [15.0, 37.0, 15.0, 37.0],
  "properties": {"datetime": "2024-06-01T00:00:00Z"},
  "links": [],
  "assets": {"data": {"href": "{{ scene_info }}", "type": "image/tiff; application=geotiff"}}
}"#,
        )
        .unwrap();
        let item = env
            .render_item("item", &json!("https://x/y/item123.tif"), None)
            .unwrap();
        assert_eq!(item.id, "item123");
        assert_eq!(item.assets["data"].href, "https://x/y/item123.tif");
    }

    #[test]
    fn regex_globals_available() {
        let mut env = environment();
        env.compile(
            "flags",
            r#"{{ scene_info | regex_sub(pattern="\\sAND\\s", repl=" & ", flags=RE_IGNORECASE) }}"#,
        )
        .unwrap();
        let out = env
            .render_text("flags", &json!("Baked Beans And Spam"), None)
            .unwrap();
        assert_eq!(out, "Baked Beans & Spam");
    }
}
