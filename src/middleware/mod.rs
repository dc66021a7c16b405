use std::{fs, path::Path};

use dashmap::DashMap;
use reqwest::header::SET_COOKIE;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::email::EmailServerConfig;

pub mod asr;
pub mod http;
pub mod tts;

pub use asr::AsrMiddleware;
pub use http::HttpAuthMiddleware;
pub use tts::TtsMiddleware;

/// A reusable outbound-HTTP adapter definition from the flow-utilities
/// bundle. Closed union keyed by the `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Middleware {
    #[serde(rename = "jwt", alias = "basic")]
    HttpAuth(HttpAuthMiddleware),
    Tts(TtsMiddleware),
    Asr(AsrMiddleware),
}

impl Middleware {
    pub fn id(&self) -> &str {
        match self {
            Middleware::HttpAuth(m) => &m.id,
            Middleware::Tts(m) => &m.id,
            Middleware::Asr(m) => &m.id,
        }
    }

    pub fn as_http_auth(&self) -> Option<&HttpAuthMiddleware> {
        match self {
            Middleware::HttpAuth(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tts(&self) -> Option<&TtsMiddleware> {
        match self {
            Middleware::Tts(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_asr(&self) -> Option<&AsrMiddleware> {
        match self {
            Middleware::Asr(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFlowUtils {
    #[serde(default)]
    middlewares: Vec<Value>,
    #[serde(default)]
    email_servers: Vec<Value>,
}

/// The flow-utilities bundle: middleware definitions and email servers,
/// loaded once per process and cached by id.
#[derive(Debug, Default)]
pub struct FlowUtils {
    middlewares: Vec<Middleware>,
    email_servers: Vec<EmailServerConfig>,
    by_id: DashMap<String, usize>,
}

impl FlowUtils {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(middlewares: Vec<Middleware>, email_servers: Vec<EmailServerConfig>) -> Self {
        Self {
            middlewares,
            email_servers,
            by_id: DashMap::new(),
        }
    }

    /// Load the bundle. A missing file or an unknown middleware kind is a
    /// warning, never fatal.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                warn!(path = %path.display(), "flow-utils bundle not found");
                return Self::empty();
            }
        };
        match Self::from_yaml(&raw) {
            Ok(utils) => utils,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not parse flow-utils bundle");
                Self::empty()
            }
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml_bw::Error> {
        let parsed: RawFlowUtils = serde_yaml_bw::from_str(raw)?;

        let mut middlewares = Vec::with_capacity(parsed.middlewares.len());
        for raw_middleware in parsed.middlewares {
            let kind = raw_middleware
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("<missing>")
                .to_string();
            match serde_json::from_value::<Middleware>(raw_middleware) {
                Ok(m) => middlewares.push(m),
                Err(e) => warn!(middleware_type = %kind, error = %e, "skipping middleware"),
            }
        }

        let mut email_servers = Vec::with_capacity(parsed.email_servers.len());
        for raw_server in parsed.email_servers {
            match serde_json::from_value::<EmailServerConfig>(raw_server) {
                Ok(s) => email_servers.push(s),
                Err(e) => warn!(error = %e, "skipping email server"),
            }
        }

        Ok(Self::new(middlewares, email_servers))
    }

    pub fn middleware(&self, id: &str) -> Option<&Middleware> {
        if let Some(index) = self.by_id.get(id) {
            return self.middlewares.get(*index);
        }
        let index = self.middlewares.iter().position(|m| m.id() == id)?;
        self.by_id.insert(id.to_string(), index);
        self.middlewares.get(index)
    }

    pub fn email_servers(&self) -> &[EmailServerConfig] {
        &self.email_servers
    }
}

/// A drained HTTP response: status, set-cookies by name, and the body both
/// as text and, when it parses, as JSON.
#[derive(Debug)]
pub(crate) struct ResponseParts {
    pub status: u16,
    pub cookies: Vec<(String, String)>,
    pub text: String,
    pub json: Option<Value>,
}

pub(crate) async fn read_parts(response: Response) -> ResponseParts {
    let status = response.status().as_u16();
    let cookies = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|header| {
            let raw = header.to_str().ok()?;
            let pair = raw.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();
    let text = response.text().await.unwrap_or_default();
    let json = serde_json::from_str::<Value>(&text).ok();
    ResponseParts {
        status,
        cookies,
        text,
        json,
    }
}

/// Dotted-path lookup into a JSON body (`data.token` → `body["data"]["token"]`).
pub(crate) fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Shared extraction: named cookies plus the configured
/// `{variable: body-path}` map. A JSON body supports path lookups; any other
/// body is only usable as a whole-text extraction, first variable wins.
pub(crate) fn extract_variables(
    parts: &ResponseParts,
    cookies_cfg: &Value,
    variables_cfg: &Value,
) -> Map<String, Value> {
    let mut variables = Map::new();

    if let Value::Object(cookies) = cookies_cfg {
        for cookie_name in cookies.keys() {
            if let Some((_, value)) = parts.cookies.iter().find(|(name, _)| name == cookie_name) {
                variables.insert(cookie_name.clone(), Value::String(value.clone()));
            }
        }
    }

    if let Value::Object(wanted) = variables_cfg {
        match &parts.json {
            Some(body) if body.is_object() || body.is_array() => {
                for (variable, path) in wanted {
                    let Some(path) = path.as_str() else { continue };
                    if let Some(found) = lookup_path(body, path) {
                        variables.insert(variable.clone(), found.clone());
                    }
                }
            }
            _ if !parts.text.is_empty() => {
                if let Some(variable) = wanted.keys().next() {
                    variables.insert(variable.clone(), Value::String(parts.text.clone()));
                }
            }
            _ => {}
        }
    }

    variables
}

/// Apply rendered request sections (headers, query, basic auth, form body,
/// JSON body) to a builder. Sections that rendered to something other than a
/// map are skipped.
pub(crate) fn apply_request_parts(
    mut builder: RequestBuilder,
    headers: &Value,
    query_params: &Value,
    basic_auth: &Value,
    data: &Value,
    json: &Value,
) -> RequestBuilder {
    if let Value::Object(headers) = headers {
        for (name, value) in headers {
            builder = builder.header(
                name.as_str(),
                value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()),
            );
        }
    }
    if let Value::Object(query) = query_params {
        let pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()),
                )
            })
            .collect();
        builder = builder.query(&pairs);
    }
    if let Value::Object(auth) = basic_auth {
        let login = auth.get("login").and_then(Value::as_str).unwrap_or_default();
        let password = auth.get("password").and_then(Value::as_str);
        builder = builder.basic_auth(login, password);
    }
    if let Value::Object(form) = data {
        let pairs: Vec<(String, String)> = form
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()),
                )
            })
            .collect();
        builder = builder.form(&pairs);
    }
    if !json.is_null() {
        builder = builder.json(json);
    }
    builder
}

pub(crate) fn parse_method(method: Option<&str>) -> Method {
    method
        .and_then(|m| Method::from_bytes(m.to_uppercase().as_bytes()).ok())
        .unwrap_or(Method::GET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BUNDLE: &str = r#"
middlewares:
  - id: api-auth
    type: jwt
    url: "https://api.example.com"
    auth:
      token_path: "/login"
      attempts: 2
      method: POST
      variables:
        token: "data.access_token"
  - id: say
    type: tts
    method: POST
    url: "https://tts.example.com/synthesize"
    sound_path: "{{ say.file }}"
  - id: listen
    type: asr
    method: POST
    url: "https://asr.example.com/recognize"
  - id: broken
    type: quantum
email_servers:
  - server_id: billing
    host: smtp.example.com
    port: 587
"#;

    #[test]
    fn test_bundle_skips_unknown_kinds() {
        let utils = FlowUtils::from_yaml(BUNDLE).unwrap();
        assert!(utils.middleware("api-auth").is_some());
        assert!(utils.middleware("say").and_then(Middleware::as_tts).is_some());
        assert!(utils.middleware("listen").and_then(Middleware::as_asr).is_some());
        assert!(utils.middleware("broken").is_none());
        assert_eq!(utils.email_servers().len(), 1);
    }

    #[test]
    fn test_middleware_lookup_is_cached() {
        let utils = FlowUtils::from_yaml(BUNDLE).unwrap();
        let first = utils.middleware("say").unwrap();
        let second = utils.middleware("say").unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_basic_alias_maps_to_http_auth() {
        let m: Middleware = serde_json::from_value(json!({
            "id": "legacy",
            "type": "basic",
            "url": "https://api.example.com",
        }))
        .unwrap();
        assert!(m.as_http_auth().is_some());
    }

    #[test]
    fn test_lookup_path() {
        let body = json!({"data": {"access_token": "abc", "n": 1}});
        assert_eq!(
            lookup_path(&body, "data.access_token"),
            Some(&json!("abc"))
        );
        assert_eq!(lookup_path(&body, "data.missing"), None);
    }

    #[test]
    fn test_extract_variables_from_json_body() {
        let parts = ResponseParts {
            status: 200,
            cookies: vec![("session".to_string(), "xyz".to_string())],
            text: r#"{"data":{"access_token":"abc"}}"#.to_string(),
            json: Some(json!({"data": {"access_token": "abc"}})),
        };
        let variables = extract_variables(
            &parts,
            &json!({"session": "1"}),
            &json!({"token": "data.access_token", "missing": "data.nope"}),
        );
        assert_eq!(variables.get("token"), Some(&json!("abc")));
        assert_eq!(variables.get("session"), Some(&json!("xyz")));
        assert!(!variables.contains_key("missing"));
    }

    #[test]
    fn test_opaque_body_is_whole_text_extraction() {
        let parts = ResponseParts {
            status: 200,
            cookies: vec![],
            text: "plain token".to_string(),
            json: None,
        };
        let variables = extract_variables(&parts, &Value::Null, &json!({"token": "anything"}));
        assert_eq!(variables.len(), 1);
        assert_eq!(variables.get("token"), Some(&json!("plain token")));
    }
}
