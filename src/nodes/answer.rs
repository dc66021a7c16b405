use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, NodeError};

/// Answers the call leg if it is not already up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl Answer {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        info!(channel = %channel.channel_uid, node = %self.id, "answering call");
        ctx.control.answer().await?;
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
