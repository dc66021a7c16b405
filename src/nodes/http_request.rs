use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::context::{AuthAttempt, NodeContext};
use crate::middleware::{
    apply_request_parts, extract_variables, parse_method, read_parts, HttpAuthMiddleware,
    Middleware,
};

use super::switch::case_key;
use super::{text_of, NodeError, Switch};

/// Issues one outbound HTTP call per execution; the response status drives
/// case selection and the configured `{variable: body-path}` map pulls
/// response fields into the channel scope. An attached HTTP-auth middleware
/// turns 401s into bounded token-refresh retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(flatten)]
    pub switch: Switch,
    #[serde(default)]
    pub method: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middleware: Option<String>,
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

impl HttpRequest {
    fn auth_middleware<'a>(&self, ctx: &'a NodeContext) -> Option<&'a HttpAuthMiddleware> {
        ctx.flow_utils
            .middleware(self.middleware.as_deref()?)
            .and_then(Middleware::as_http_auth)
    }

    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let status = self.make_request(ctx, channel).await?;
        info!(channel = %channel.channel_uid, node = %self.switch.id, status, "http_request completed");

        if let Some(auth) = self.auth_middleware(ctx).cloned() {
            self.track_auth_attempts(ctx, channel, &auth, status).await?;
        }
        Ok(())
    }

    async fn make_request(
        &self,
        ctx: &NodeContext,
        channel: &mut Channel,
    ) -> Result<u16, NodeError> {
        let url = text_of(&ctx.render_template(&self.url, channel));
        debug!(channel = %channel.channel_uid, node = %self.switch.id, url = %url, "issuing http request");

        let builder = ctx
            .http
            .request(parse_method(self.method.as_deref()), &url)
            .timeout(Duration::from_secs(ctx.config.timeouts.http_request));
        let builder = apply_request_parts(
            builder,
            &ctx.render_data(&self.headers, channel),
            &ctx.render_data(&self.query_params, channel),
            &ctx.render_data(&self.basic_auth, channel),
            &ctx.render_data(&self.data, channel),
            &ctx.render_data(&self.json, channel),
        );

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(channel = %channel.channel_uid, node = %self.switch.id, error = %e, "http request failed");
                let has_fallback = self
                    .switch
                    .cases
                    .iter()
                    .any(|c| matches!(case_key(&c.id).as_str(), "500" | "default"));
                if !has_fallback {
                    // no error-designated case: abort without advancing so
                    // the next protocol event retries this node
                    return Err(NodeError::Execution(format!("http request failed: {e}")));
                }
                let edge = self.switch.case_by_key("500", ctx, channel).await?;
                self.switch.advance_from(ctx, channel, edge).await?;
                return Ok(500);
            }
        };

        let parts = read_parts(response).await;

        if parts.status == 401 {
            if self.auth_middleware(ctx).is_none() && !self.switch.cases.is_empty() {
                let edge = self.switch.case_by_key("401", ctx, channel).await?;
                self.switch.advance_from(ctx, channel, edge).await?;
            }
            // With a middleware attached the channel stays at this node;
            // track_auth_attempts decides between refresh-and-retry and the
            // default case.
            return Ok(401);
        }

        let mut variables = extract_variables(
            &parts,
            &ctx.render_data(&self.cookies, channel),
            &self.variables,
        );
        for value in variables.values_mut() {
            *value = ctx.render_data(value, channel);
        }

        let case_edge = if self.switch.cases.is_empty() {
            None
        } else {
            self.switch
                .case_by_key(&parts.status.to_string(), ctx, channel)
                .await?
        };
        self.switch.advance_from(ctx, channel, case_edge).await?;

        if !variables.is_empty() {
            channel.set_variables(variables);
            ctx.channels.persist(channel).await?;
        }

        Ok(parts.status)
    }

    /// Bounded auth-refresh protocol: a 2xx clears the counter; a 401
    /// increments it and, once the middleware's bound is reached, forces the
    /// `default` case and resets.
    async fn track_auth_attempts(
        &self,
        ctx: &NodeContext,
        channel: &mut Channel,
        auth: &HttpAuthMiddleware,
        status: u16,
    ) -> Result<(), NodeError> {
        let uid = channel.channel_uid.clone();

        if (200..300).contains(&status) {
            ctx.counters.http_attempts.remove(&uid);
            return Ok(());
        }
        if status != 401 {
            return Ok(());
        }

        let count = ctx
            .counters
            .http_attempts
            .get(&uid)
            .filter(|a| a.last_node.as_deref() == Some(self.switch.id.as_str()))
            .map(|a| a.count)
            .unwrap_or(0)
            + 1;

        if count >= auth.attempts() {
            debug!(channel = %uid, node = %self.switch.id, "auth attempts limit reached, taking default case");
            ctx.counters.http_attempts.remove(&uid);
            let edge = self.switch.case_by_key("default", ctx, channel).await?;
            self.switch.advance_from(ctx, channel, edge).await?;
        } else {
            debug!(channel = %uid, node = %self.switch.id, attempt = count, "http auth attempt, refreshing token");
            ctx.counters.http_attempts.insert(
                uid,
                AuthAttempt {
                    last_node: Some(self.switch.id.clone()),
                    count,
                },
            );
            // Transient token expiry self-heals: refresh, then the flow
            // re-issues the protected call.
            auth.auth_request(ctx, channel).await;
        }
        Ok(())
    }
}
