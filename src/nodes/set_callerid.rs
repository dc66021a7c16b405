use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, text_of, NodeError};

/// Sets the outbound caller id on the leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCallerId {
    pub id: String,
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl SetCallerId {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let number = text_of(&ctx.render_template(&self.number, channel));
        info!(channel = %channel.channel_uid, node = %self.id, number = %number, "setting caller id");
        ctx.control.set_caller_id(&number).await?;
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
