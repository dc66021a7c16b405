use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, text_of, NodeError};

/// Executes a dialplan application with rendered options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecApp {
    pub id: String,
    pub application: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl ExecApp {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let application = text_of(&ctx.render_template(&self.application, channel));
        let options = self
            .options
            .as_deref()
            .map(|t| text_of(&ctx.render_template(t, channel)))
            .unwrap_or_default();

        info!(channel = %channel.channel_uid, node = %self.id, application = %application, "exec application");
        ctx.control.exec_application(&application, &options).await?;
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
