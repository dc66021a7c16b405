use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, NodeError};

/// Merges a rendered map of variables into the channel scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVariable {
    pub id: String,
    #[serde(default)]
    pub variables: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl SetVariable {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        match ctx.render_data(&self.variables, channel) {
            Value::Object(variables) => {
                channel.set_variables(variables);
                ctx.channels.persist(channel).await?;
            }
            Value::Null => {
                warn!(channel = %channel.channel_uid, node = %self.id, "variables are empty, nothing to set");
            }
            other => {
                warn!(channel = %channel.channel_uid, node = %self.id, value = %other, "variables must render to a map");
            }
        }
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
