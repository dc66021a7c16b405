use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::warn;

use crate::channel::{Channel, ChannelManager};
use crate::config::Config;
use crate::control::CallControl;
use crate::email::EmailRegistry;
use crate::middleware::FlowUtils;
use crate::render::{merge_scope, RenderError, Renderer};

/// Per-channel retry bookkeeping for the HTTP-auth middleware.
#[derive(Debug, Clone, Default)]
pub struct AuthAttempt {
    pub last_node: Option<String>,
    pub count: u32,
}

/// The hot mutable shared state of the engine: bounded retry counters for
/// switch validation and middleware auth refresh. Owned once per process and
/// injected into every executor through [`NodeContext`] rather than living in statics.
#[derive(Debug, Default)]
pub struct SessionCounters {
    /// `(node id, channel uid)` → mismatches already made.
    pub validation_attempts: DashMap<(String, String), u32>,
    /// `channel uid` → auth-refresh attempts against the last 401ing node.
    pub http_attempts: DashMap<String, AuthAttempt>,
}

impl SessionCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Everything a node executor needs for one protocol event: the injected
/// collaborators plus the flow's default variables for scope building.
#[derive(Clone)]
pub struct NodeContext {
    pub config: Arc<Config>,
    pub control: Arc<dyn CallControl>,
    pub http: reqwest::Client,
    pub channels: Arc<ChannelManager>,
    pub flow_utils: Arc<FlowUtils>,
    pub emails: Arc<EmailRegistry>,
    pub counters: Arc<SessionCounters>,
    pub renderer: Arc<Renderer>,
    default_variables: Map<String, Value>,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        control: Arc<dyn CallControl>,
        http: reqwest::Client,
        channels: Arc<ChannelManager>,
        flow_utils: Arc<FlowUtils>,
        emails: Arc<EmailRegistry>,
        counters: Arc<SessionCounters>,
        renderer: Arc<Renderer>,
        default_variables: Map<String, Value>,
    ) -> Self {
        Self {
            config,
            control,
            http,
            channels,
            flow_utils,
            emails,
            counters,
            renderer,
            default_variables,
        }
    }

    pub fn scope(&self, channel: &Channel) -> Map<String, Value> {
        merge_scope(&self.default_variables, channel.variables())
    }

    /// Render with the log-and-continue-with-null policy: template problems
    /// are never fatal to the node, they evaluate to `Null`.
    pub fn render_data(&self, data: &Value, channel: &Channel) -> Value {
        match self.renderer.render(data, &self.scope(channel)) {
            Ok(value) => value,
            Err(e) => {
                warn!(channel = %channel.channel_uid, error = %e, "render failed, using null");
                Value::Null
            }
        }
    }

    /// Render, propagating template errors to the caller.
    pub fn try_render(&self, data: &Value, channel: &Channel) -> Result<Value, RenderError> {
        self.renderer.render(data, &self.scope(channel))
    }

    pub fn render_template(&self, template: &str, channel: &Channel) -> Value {
        self.render_data(&Value::String(template.to_string()), channel)
    }

    /// Render an optional `o_connection` template down to an edge id.
    pub fn render_edge(&self, template: Option<&str>, channel: &Channel) -> Option<String> {
        let rendered = self.render_template(template?, channel);
        edge_from_value(&rendered)
    }
}

/// Edges render to strings, but coercion can produce numbers or booleans
/// for numeric node ids; normalize those back to id text.
pub fn edge_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
