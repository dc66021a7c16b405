use std::time::Duration;

use reqwest::multipart::Form;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::context::NodeContext;
use crate::nodes::NodeError;

use super::{parse_method, read_parts};

/// Records caller audio, posts it to an external recognizer and stores the
/// recognized result under this middleware's id in the channel scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrMiddleware {
    pub id: String,
    #[serde(default)]
    pub method: Option<String>,
    pub url: String,
    #[serde(default = "AsrMiddleware::default_record_format")]
    pub record_format: String,
    #[serde(default = "AsrMiddleware::default_escape_digits")]
    pub escape_digits: String,
    #[serde(default = "AsrMiddleware::default_timeout")]
    pub timeout: i64,
    #[serde(default = "AsrMiddleware::default_silence")]
    pub silence: i64,
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

impl AsrMiddleware {
    fn default_record_format() -> String {
        "wav".to_string()
    }
    fn default_escape_digits() -> String {
        "#".to_string()
    }
    fn default_timeout() -> i64 {
        10000
    }
    fn default_silence() -> i64 {
        2
    }

    /// Record the caller, then recognize. When a progress sound is
    /// configured it plays concurrently with the recognition request.
    pub async fn run(
        &self,
        ctx: &NodeContext,
        channel: &mut Channel,
        prompt_file: Option<&str>,
        progress_sound: Option<&str>,
    ) -> Result<Value, NodeError> {
        if let Some(prompt) = prompt_file {
            ctx.control.stream_file(prompt, "", 0).await?;
        }

        let recording = format!(
            "{}_{}",
            channel.channel_uid,
            uuid::Uuid::new_v4().simple()
        );
        ctx.control
            .record_file(
                &recording,
                &self.record_format,
                &self.escape_digits,
                self.timeout,
                self.silence,
                true,
                0,
            )
            .await?;

        channel.set_variable(
            "record_path_variable",
            json!(format!("{recording}.{}", self.record_format)),
        );
        channel.set_variable("asr_file_path", json!(recording));
        ctx.channels.persist(channel).await?;

        let url = ctx
            .render_template(&self.url, channel)
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.url.clone());
        let headers = ctx.render_data(&self.headers, channel);
        let query_params = ctx.render_data(&self.query_params, channel);
        let data = ctx.render_data(&self.data, channel);
        let body = ctx.render_data(&self.json, channel);

        let result = match progress_sound {
            Some(sound) => {
                let (_, result) = futures::join!(
                    ctx.control.stream_file(sound, "", 0),
                    self.recognize(ctx, &url, &headers, &query_params, &data, &body)
                );
                result
            }
            None => {
                self.recognize(ctx, &url, &headers, &query_params, &data, &body)
                    .await
            }
        };

        if !result.is_null() {
            channel.set_variable(&self.id, result.clone());
            ctx.channels.persist(channel).await?;
        }
        Ok(result)
    }

    /// Post the recording as multipart form data. Failures recognize
    /// nothing: the caller gets `Null` and decides what that means.
    async fn recognize(
        &self,
        ctx: &NodeContext,
        url: &str,
        headers: &Value,
        query_params: &Value,
        data: &Value,
        body: &Value,
    ) -> Value {
        let mut builder = ctx
            .http
            .request(parse_method(self.method.as_deref()), url)
            .timeout(Duration::from_secs(ctx.config.timeouts.middlewares));

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
        if let Value::Object(fields) = data {
            let mut form = Form::new();
            for (name, value) in fields {
                let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                form = form.text(name.clone(), text);
            }
            builder = builder.multipart(form);
        }
        if !body.is_null() {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(middleware = %self.id, error = %e, "asr request failed");
                return Value::Null;
            }
        };

        let parts = read_parts(response).await;
        debug!(middleware = %self.id, url = %url, status = parts.status, "asr response");
        parts.json.unwrap_or(Value::Null)
    }
}
