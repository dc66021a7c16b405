use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::channel::{Channel, ChannelState};
use crate::context::NodeContext;
use crate::middleware::Middleware;

use super::{int_of, text_of, NodeError, Switch};

/// One or several middleware ids (a TTS for the prompt, an ASR for the
/// capture, or both).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MiddlewareRef {
    One(String),
    Many(Vec<String>),
}

impl MiddlewareRef {
    fn ids(&self) -> Vec<&str> {
        match self {
            MiddlewareRef::One(id) => vec![id.as_str()],
            MiddlewareRef::Many(ids) => ids.iter().map(String::as_str).collect(),
        }
    }
}

/// The input-collection node: plays a prompt, captures DTMF digits (or runs
/// speech recognition when an ASR middleware is attached), binds the result
/// to a variable and routes through the switch engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetData {
    #[serde(flatten)]
    pub switch: Switch,
    #[serde(default)]
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_sound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middleware: Option<MiddlewareRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_digits: Option<Value>,
    pub variable: String,
}

impl GetData {
    fn attached<'a>(&self, ctx: &'a NodeContext) -> Vec<&'a Middleware> {
        self.middleware
            .as_ref()
            .map(|r| {
                r.ids()
                    .into_iter()
                    .filter_map(|id| ctx.flow_utils.middleware(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        info!(channel = %channel.channel_uid, node = %self.switch.id, "collecting caller input");

        // Mark the channel as waiting on input; a crash mid-collection
        // leaves it re-runnable at this node.
        channel.state = Some(ChannelState::Input);
        ctx.channels.persist(channel).await?;

        let mut sound = text_of(&ctx.render_template(&self.file, channel));
        let attached = self.attached(ctx);
        let tts = attached
            .iter()
            .find_map(|m| m.as_tts())
            .cloned();
        let asr = attached
            .iter()
            .find_map(|m| m.as_asr())
            .cloned();

        if let (Some(tts), Some(text)) = (&tts, &self.text) {
            let rendered = ctx.render_template(text, channel);
            channel.set_variable("tts_text", rendered);
            ctx.channels.persist(channel).await?;
            if let Some(path) = tts.run(ctx, channel).await {
                sound = path;
            }
        }

        let captured = match &asr {
            Some(asr) => {
                let prompt = (!sound.is_empty()).then_some(sound.as_str());
                let progress = self
                    .progress_sound
                    .as_deref()
                    .map(|t| text_of(&ctx.render_template(t, channel)));
                asr.run(ctx, channel, prompt, progress.as_deref()).await?
            }
            None => {
                let timeout = self
                    .timeout
                    .as_ref()
                    .map(|t| int_of(&ctx.render_data(t, channel), 5000))
                    .unwrap_or(5000);
                let max_digits = self
                    .max_digits
                    .as_ref()
                    .map(|m| int_of(&ctx.render_data(m, channel), 255))
                    .unwrap_or(255);

                let capture = ctx.control.get_data(&sound, timeout, max_digits).await?;
                if capture.timed_out && capture.value.is_empty() {
                    json!("timeout")
                } else {
                    Value::String(capture.value)
                }
            }
        };

        channel.set_variable(&self.variable, captured);
        ctx.channels.persist(channel).await?;

        let case_edge = self.switch.decide(ctx, channel).await?;
        self.switch.advance_from(ctx, channel, case_edge).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context_with, MockControl};

    fn node() -> GetData {
        serde_json::from_value(json!({
            "id": "ask",
            "file": "menu",
            "timeout": 5000,
            "max_digits": 1,
            "variable": "opt",
            "validation": "{{ opt }}",
            "cases": [
                {"id": 1, "o_connection": "m1"},
                {"id": "default", "o_connection": "m2"},
            ],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_digit_routes_to_matching_case() {
        let control = MockControl::new();
        control.script_digits("1", false);
        let (ctx, channels) = test_context_with(control.clone(), Default::default());
        let mut channel = channels.get_or_create("c1").await.unwrap();

        node().run(&ctx, &mut channel).await.unwrap();

        assert_eq!(control.calls(), vec!["get_data(menu, 5000, 1)"]);
        assert_eq!(channel.node_id, "m1");
        assert_eq!(channel.state, None);
        assert_eq!(channel.get_variable("opt"), Some(&json!("1")));
    }

    #[tokio::test]
    async fn test_timeout_records_sentinel_and_routes_default() {
        let control = MockControl::new();
        control.script_digits("", true);
        let (ctx, channels) = test_context_with(control.clone(), Default::default());
        let mut channel = channels.get_or_create("c2").await.unwrap();

        node().run(&ctx, &mut channel).await.unwrap();

        assert_eq!(channel.get_variable("opt"), Some(&json!("timeout")));
        assert_eq!(channel.node_id, "m2");
    }
}
