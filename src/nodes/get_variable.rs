use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, text_of, NodeError};

/// Reads one call-platform channel variable into the flow scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetVariable {
    pub id: String,
    pub name: String,
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl GetVariable {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let name = text_of(&ctx.render_template(&self.name, channel));
        let value = ctx.control.get_channel_variable(&name).await?;

        info!(
            channel = %channel.channel_uid,
            node = %self.id,
            variable = %name,
            value = %value.as_deref().unwrap_or(""),
            "read channel variable"
        );
        channel.set_variable(
            &self.variable,
            value.map(Value::String).unwrap_or(Value::Null),
        );
        ctx.channels.persist(channel).await?;

        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context_with, MockControl};
    use serde_json::json;

    #[tokio::test]
    async fn test_binds_channel_variable_to_flow_scope() {
        let control = MockControl::new();
        control.script_channel_var("CALLERID(num)", Some("5551234"));
        let (ctx, channels) = test_context_with(control.clone(), Default::default());
        let mut channel = channels.get_or_create("c1").await.unwrap();

        let node: GetVariable = serde_json::from_value(json!({
            "id": "who",
            "name": "CALLERID(num)",
            "variable": "caller_number",
            "o_connection": "next",
        }))
        .unwrap();
        node.run(&ctx, &mut channel).await.unwrap();

        assert_eq!(
            channel.get_variable("caller_number"),
            Some(&json!("5551234"))
        );
        assert_eq!(channel.node_id, "next");
    }
}
