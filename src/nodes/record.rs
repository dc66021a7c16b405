use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, int_of, text_of, NodeError};

/// Captures caller audio to a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub file: String,
    #[serde(default = "Record::default_format")]
    pub format: String,
    #[serde(default)]
    pub escape_digits: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silence: Option<Value>,
    #[serde(default)]
    pub beep: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl Record {
    fn default_format() -> String {
        "wav".to_string()
    }

    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let file = text_of(&ctx.render_template(&self.file, channel));
        let timeout = self
            .timeout
            .as_ref()
            .map(|t| int_of(&ctx.render_data(t, channel), -1))
            .unwrap_or(-1);
        let silence = self
            .silence
            .as_ref()
            .map(|s| int_of(&ctx.render_data(s, channel), 0))
            .unwrap_or(0);
        let offset = self
            .offset
            .as_ref()
            .map(|o| int_of(&ctx.render_data(o, channel), 0))
            .unwrap_or(0);

        info!(channel = %channel.channel_uid, node = %self.id, file = %file, "recording caller audio");
        ctx.control
            .record_file(
                &file,
                &self.format,
                &self.escape_digits,
                timeout,
                silence,
                self.beep,
                offset,
            )
            .await?;

        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
