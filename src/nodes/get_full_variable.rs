use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, text_of, NodeError};

/// Reads a map of call-platform channel variables into the flow scope:
/// `{flow_variable: channel_variable_expression}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFullVariable {
    pub id: String,
    #[serde(default)]
    pub variables: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl GetFullVariable {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        if let Value::Object(variables) = ctx.render_data(&self.variables, channel) {
            for (flow_variable, name) in variables {
                let value = ctx
                    .control
                    .get_channel_variable(&text_of(&name))
                    .await?;
                channel.set_variable(
                    &flow_variable,
                    value.map(Value::String).unwrap_or(Value::Null),
                );
            }
            info!(channel = %channel.channel_uid, node = %self.id, "channel variables imported");
            ctx.channels.persist(channel).await?;
        }
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
