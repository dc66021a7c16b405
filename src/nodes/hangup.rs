use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::channel::{Channel, ChannelState};
use crate::context::NodeContext;

use super::{text_of, NodeError};

/// Hangs up the call. Always terminal: lifecycle goes to `end` no matter
/// what edge is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hangup {
    pub id: String,
    /// Optional named leg to hang up instead of the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chan: Option<String>,
}

impl Hangup {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let chan = self
            .chan
            .as_deref()
            .map(|t| text_of(&ctx.render_data(&Value::String(t.to_string()), channel)))
            .filter(|c| !c.is_empty());

        info!(channel = %channel.channel_uid, node = %self.id, leg = chan.as_deref().unwrap_or("self"), "hanging up");
        ctx.control.hangup(chan.as_deref()).await?;

        channel.update_position(None, Some(ChannelState::End));
        ctx.channels.persist(channel).await?;
        Ok(())
    }
}
