use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{apply_request_parts, extract_variables, parse_method, read_parts};

/// Posts channel context to an external synthesizer and hands the produced
/// audio reference back to the calling node. Extracted response fields land
/// under this middleware's id in the channel scope, so a `sound_path` of
/// `{{ m1.file }}` resolves after the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsMiddleware {
    pub id: String,
    #[serde(default)]
    pub method: Option<String>,
    pub url: String,
    #[serde(default)]
    pub sound_path: Option<String>,
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

impl TtsMiddleware {
    /// Synthesize and return the audio path for the caller to stream.
    /// Failures extract nothing and yield `None`; the node falls back to
    /// its configured file.
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Option<String> {
        let url = ctx.render_template(&self.url, channel);
        let url = url.as_str()?;

        let builder = ctx
            .http
            .request(parse_method(self.method.as_deref()), url)
            .timeout(Duration::from_secs(ctx.config.timeouts.middlewares));
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
                warn!(channel = %channel.channel_uid, middleware = %self.id, error = %e, "tts request failed");
                return None;
            }
        };

        let parts = read_parts(response).await;
        debug!(
            channel = %channel.channel_uid,
            middleware = %self.id,
            url = %url,
            status = parts.status,
            "tts response"
        );

        let variables = extract_variables(
            &parts,
            &ctx.render_data(&self.cookies, channel),
            &self.variables,
        );
        if !variables.is_empty() {
            channel.set_variable(&self.id, Value::Object(variables));
            if let Err(e) = ctx.channels.persist(channel).await {
                warn!(channel = %channel.channel_uid, middleware = %self.id, error = %e, "could not persist tts variables");
            }
        }

        let sound_path = ctx.render_template(self.sound_path.as_deref()?, channel);
        sound_path.as_str().map(str::to_string).filter(|p| !p.is_empty())
    }
}
