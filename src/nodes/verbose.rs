use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, int_of, text_of, NodeError};

/// Writes a rendered message to the call platform's verbose log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verbose {
    pub id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl Verbose {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let message = text_of(&ctx.render_template(&self.message, channel));
        let level = self
            .level
            .as_ref()
            .map(|l| int_of(&ctx.render_data(l, channel), 1))
            .unwrap_or(1);

        ctx.control.verbose(&message, level).await?;
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
