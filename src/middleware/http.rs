use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{apply_request_parts, extract_variables, parse_method, read_parts};

/// The `auth` section of an HTTP-auth middleware: how to refresh the token
/// and what to pull out of the refresh response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub token_path: String,
    #[serde(default = "AuthSection::default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub cookies: Value,
    #[serde(default)]
    pub headers: Value,
    #[serde(default)]
    pub query_params: Value,
    #[serde(default)]
    pub basic_auth: Value,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub json: Value,
}

impl AuthSection {
    fn default_attempts() -> u32 {
        2
    }
}

/// Wraps a protected HTTP node's token refresh. The protected call itself is
/// re-issued by the flow, not by the middleware; this adapter only refreshes
/// credentials and bounds how often that may happen per channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpAuthMiddleware {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub general: Value,
}

impl HttpAuthMiddleware {
    pub fn attempts(&self) -> u32 {
        self.auth.attempts
    }

    /// Issue the token-refresh request and store the extracted fields as
    /// channel variables. Transport problems and non-2xx responses extract
    /// nothing and are not errors; callers must tolerate a middleware
    /// producing nothing.
    pub async fn auth_request(&self, ctx: &NodeContext, channel: &mut Channel) {
        let base = ctx.render_template(&self.url, channel);
        let token_path = ctx.render_template(&self.auth.token_path, channel);
        let token_url = format!(
            "{}{}",
            base.as_str().unwrap_or_default(),
            token_path.as_str().unwrap_or_default()
        );

        let builder = ctx
            .http
            .request(parse_method(self.auth.method.as_deref()), &token_url)
            .timeout(Duration::from_secs(ctx.config.timeouts.middlewares));
        let builder = apply_request_parts(
            builder,
            &ctx.render_data(&self.auth.headers, channel),
            &ctx.render_data(&self.auth.query_params, channel),
            &ctx.render_data(&self.auth.basic_auth, channel),
            &ctx.render_data(&self.auth.data, channel),
            &ctx.render_data(&self.auth.json, channel),
        );

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(channel = %channel.channel_uid, middleware = %self.id, error = %e, "auth refresh failed");
                return;
            }
        };

        let parts = read_parts(response).await;
        debug!(
            channel = %channel.channel_uid,
            middleware = %self.id,
            url = %token_url,
            status = parts.status,
            "auth refresh response"
        );

        let variables = extract_variables(
            &parts,
            &ctx.render_data(&self.auth.cookies, channel),
            &self.auth.variables,
        );
        if !variables.is_empty() {
            let rendered: serde_json::Map<String, Value> = variables
                .into_iter()
                .map(|(k, v)| (k, ctx.render_data(&v, channel)))
                .collect();
            channel.set_variables(rendered);
            if let Err(e) = ctx.channels.persist(channel).await {
                warn!(channel = %channel.channel_uid, middleware = %self.id, error = %e, "could not persist refreshed token");
            }
        }
    }
}
