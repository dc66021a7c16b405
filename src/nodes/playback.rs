use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::Channel;
use crate::context::NodeContext;
use crate::middleware::Middleware;

use super::{advance_with_fall_through, text_of, NodeError};

/// Streams an audio file to the caller, optionally synthesizing it first
/// through a TTS middleware. Caller digits in `escape_digits` interrupt the
/// playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playback {
    pub id: String,
    #[serde(default)]
    pub file: String,
    /// Text handed to the TTS middleware instead of a pre-rendered file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middleware: Option<String>,
    #[serde(default)]
    pub escape_digits: String,
    #[serde(default)]
    pub sample_offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl Playback {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let mut sound = text_of(&ctx.render_template(&self.file, channel));

        if let Some(middleware_id) = &self.middleware {
            let tts = ctx
                .flow_utils
                .middleware(middleware_id)
                .and_then(Middleware::as_tts)
                .cloned();
            if let (Some(tts), Some(text)) = (tts, &self.text) {
                let rendered = ctx.render_template(text, channel);
                channel.set_variable("tts_text", rendered);
                ctx.channels.persist(channel).await?;
                if let Some(path) = tts.run(ctx, channel).await {
                    sound = path;
                }
            }
        }

        info!(channel = %channel.channel_uid, node = %self.id, file = %sound, "streaming file");
        ctx.control
            .stream_file(&sound, &self.escape_digits, self.sample_offset)
            .await?;

        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
