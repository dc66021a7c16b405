use chrono::Utc;
use dashmap::DashMap;
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
    RenderErrorReason,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

// Patterns in `match` helpers repeat on every protocol event; compile once.
static REGEX_CACHE: Lazy<DashMap<String, Option<Regex>>> = Lazy::new(DashMap::new);

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error("could not serialize template data: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Evaluates node fields against the merged variable scope.
///
/// Strings are handlebars templates; rendered text that parses as a JSON
/// literal is returned as the parsed value so templates can produce typed
/// data, not just text. Containers are rendered leaf by leaf, preserving
/// shape. Strict mode is on: an undefined reference is an error the caller
/// can tell apart from a legitimate null.
pub struct Renderer {
    hb: Handlebars<'static>,
}

impl Renderer {
    pub fn new() -> Self {
        let mut hb = Handlebars::new();
        hb.set_strict_mode(true);
        hb.register_helper("json", Box::new(json_helper) as Box<dyn HelperDef + Send + Sync>);
        hb.register_helper("match", Box::new(match_helper) as Box<dyn HelperDef + Send + Sync>);
        hb.register_helper(
            "utcnow",
            Box::new(utcnow_helper) as Box<dyn HelperDef + Send + Sync>,
        );
        hb.register_helper(
            "utcnow_isoformat",
            Box::new(utcnow_helper) as Box<dyn HelperDef + Send + Sync>,
        );
        Self { hb }
    }

    pub fn render(&self, data: &Value, scope: &Map<String, Value>) -> Result<Value, RenderError> {
        match data {
            Value::String(template) => self.render_str(template, scope),
            Value::Array(items) => {
                let rendered = items
                    .iter()
                    .map(|item| self.render(item, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(rendered))
            }
            Value::Object(map) => {
                let mut rendered = Map::with_capacity(map.len());
                for (key, value) in map {
                    rendered.insert(key.clone(), self.render(value, scope)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn render_str(
        &self,
        template: &str,
        scope: &Map<String, Value>,
    ) -> Result<Value, RenderError> {
        let text = self.hb.render_template(template, scope)?;
        Ok(coerce_literal(text))
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge flow defaults with channel variables; channel wins on collision.
pub fn merge_scope(
    defaults: &Map<String, Value>,
    channel_vars: &Map<String, Value>,
) -> Map<String, Value> {
    let mut scope = defaults.clone();
    for (key, value) in channel_vars {
        scope.insert(key.clone(), value.clone());
    }
    scope
}

/// Literal coercion of rendered text: booleans case-insensitively, then any
/// JSON scalar/list/map, with a single-quote-swap retry for map and list
/// literals. Anything else stays a string.
fn coerce_literal(text: String) -> Value {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    if trimmed.contains('\'') && (trimmed.starts_with('{') || trimmed.starts_with('[')) {
        if let Ok(value) = serde_json::from_str::<Value>(&trimmed.replace('\'', "\"")) {
            if value.is_object() || value.is_array() {
                return value;
            }
        }
    }
    Value::String(text)
}

fn json_helper(
    h: &Helper<'_>,
    _: &Handlebars<'_>,
    _: &Context,
    _: &mut RenderContext<'_, '_>,
    out: &mut dyn Output,
) -> HelperResult {
    let param = h.param(0).ok_or_else(|| {
        RenderErrorReason::MissingVariable(Some("Helper `json` got no argument".to_string()))
    })?;
    let serialized = serde_json::to_string(param.value())
        .map_err(RenderErrorReason::SerdeError)?;
    out.write(&serialized)?;
    Ok(())
}

fn match_helper(
    h: &Helper<'_>,
    _: &Handlebars<'_>,
    _: &Context,
    _: &mut RenderContext<'_, '_>,
    out: &mut dyn Output,
) -> HelperResult {
    let pattern = h
        .param(0)
        .and_then(|p| p.value().as_str().map(str::to_string))
        .ok_or_else(|| {
            RenderErrorReason::MissingVariable(Some("Helper `match` needs a pattern".to_string()))
        })?;
    let value = match h.param(1).map(|p| p.value()) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let compiled = REGEX_CACHE
        .entry(pattern.clone())
        .or_insert_with(|| Regex::new(&pattern).ok())
        .clone();
    let matched = compiled.map(|re| re.is_match(&value)).unwrap_or(false);
    out.write(if matched { "true" } else { "false" })?;
    Ok(())
}

fn utcnow_helper(
    _: &Helper<'_>,
    _: &Handlebars<'_>,
    _: &Context,
    _: &mut RenderContext<'_, '_>,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&Utc::now().to_rfc3339())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_plain_interpolation() {
        let renderer = Renderer::new();
        let scope = scope(&[("name", json!("world"))]);
        let out = renderer
            .render(&json!("hello {{ name }}"), &scope)
            .unwrap();
        assert_eq!(out, json!("hello world"));
    }

    #[test]
    fn test_literal_coercion() {
        let renderer = Renderer::new();
        let scope = Map::new();
        assert_eq!(renderer.render(&json!("TRUE"), &scope).unwrap(), json!(true));
        assert_eq!(renderer.render(&json!("False"), &scope).unwrap(), json!(false));
        assert_eq!(renderer.render(&json!("42"), &scope).unwrap(), json!(42));
        assert_eq!(
            renderer.render(&json!("[1, 2, 3]"), &scope).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(
            renderer.render(&json!("plain text"), &scope).unwrap(),
            json!("plain text")
        );
    }

    #[test]
    fn test_single_quoted_map_literal() {
        let renderer = Renderer::new();
        let out = renderer
            .render(&json!("{'a': 1, 'b': 'two'}"), &Map::new())
            .unwrap();
        assert_eq!(out, json!({"a": 1, "b": "two"}));
    }

    #[test]
    fn test_container_shape_preserved() {
        let renderer = Renderer::new();
        let scope = scope(&[("opt", json!("7"))]);
        let out = renderer
            .render(&json!({"digits": "{{ opt }}", "nested": ["{{ opt }}", "x"]}), &scope)
            .unwrap();
        assert_eq!(out, json!({"digits": 7, "nested": [7, "x"]}));
    }

    #[test]
    fn test_undefined_reference_is_an_error() {
        let renderer = Renderer::new();
        assert!(renderer.render(&json!("{{ missing }}"), &Map::new()).is_err());
    }

    #[test]
    fn test_render_is_idempotent_on_rendered_scalars() {
        let renderer = Renderer::new();
        let scope = scope(&[("n", json!("19"))]);
        let once = renderer.render(&json!("{{ n }}"), &scope).unwrap();
        let twice = renderer.render(&once, &scope).unwrap();
        assert_eq!(once, twice);

        let text = renderer.render(&json!("no templates here"), &scope).unwrap();
        assert_eq!(renderer.render(&text, &scope).unwrap(), text);
    }

    #[test]
    fn test_match_helper() {
        let renderer = Renderer::new();
        let scope = scope(&[("date", json!("14091999"))]);
        let out = renderer
            .render(&json!("{{ match \"^[0-9]+$\" date }}"), &scope)
            .unwrap();
        assert_eq!(out, json!(true));

        let out = renderer
            .render(&json!("{{ match \"^[a-z]+$\" date }}"), &scope)
            .unwrap();
        assert_eq!(out, json!(false));
    }

    #[test]
    fn test_channel_vars_win_scope_collision() {
        let defaults = scope(&[("greeting", json!("hi")), ("lang", json!("en"))]);
        let channel = scope(&[("greeting", json!("hola"))]);
        let merged = merge_scope(&defaults, &channel);
        assert_eq!(merged.get("greeting"), Some(&json!("hola")));
        assert_eq!(merged.get("lang"), Some(&json!("en")));
    }
}
