use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::{Channel, ChannelState};
use crate::context::NodeContext;

use super::{text_of, NodeError};

/// Points the dialplan at a target for when the flow exits. Terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GotoOnExit {
    pub id: String,
    #[serde(default = "GotoOnExit::default_context")]
    pub context: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default = "GotoOnExit::default_priority")]
    pub priority: String,
}

impl GotoOnExit {
    fn default_context() -> String {
        "Incoming".to_string()
    }
    fn default_priority() -> String {
        "1".to_string()
    }

    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let context = text_of(&ctx.render_template(&self.context, channel));
        let extension = text_of(&ctx.render_template(&self.extension, channel));
        let priority = text_of(&ctx.render_template(&self.priority, channel));

        info!(
            channel = %channel.channel_uid,
            node = %self.id,
            context = %context,
            extension = %extension,
            "setting exit target"
        );
        ctx.control
            .goto_on_exit(&context, &extension, &priority)
            .await?;

        channel.update_position(None, Some(ChannelState::End));
        ctx.channels.persist(channel).await?;
        Ok(())
    }
}
