use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, text_of, NodeError};

/// Does nothing except optionally log a rendered message. Handy while
/// authoring flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoOp {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl NoOp {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        if let Some(text) = &self.text {
            let message = text_of(&ctx.render_template(text, channel));
            info!(channel = %channel.channel_uid, node = %self.id, "{message}");
        }
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
