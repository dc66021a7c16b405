use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, text_of, NodeError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VarsSpec {
    #[serde(default)]
    pub set: Value,
    #[serde(default)]
    pub unset: Vec<String>,
}

/// Sets and/or unsets channel variables in one step. Keys are dotted paths;
/// unsetting a path that does not exist is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVars {
    pub id: String,
    #[serde(default)]
    pub variables: VarsSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl SetVars {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        match ctx.render_data(&self.variables.set, channel) {
            Value::Object(variables) => channel.set_variables(variables),
            Value::Null => {}
            other => {
                warn!(channel = %channel.channel_uid, node = %self.id, value = %other, "`set` must render to a map");
            }
        }

        let unset: Vec<String> = self
            .variables
            .unset
            .iter()
            .map(|t| text_of(&ctx.render_template(t, channel)))
            .filter(|k| !k.is_empty())
            .collect();
        channel.del_variables(&unset);

        ctx.channels.persist(channel).await?;
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_unset_dotted_key() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c1").await.unwrap();

        let node: SetVars = serde_json::from_value(json!({
            "id": "vars",
            "variables": {"set": {"a.b": 1}},
            "o_connection": "next",
        }))
        .unwrap();
        node.run(&ctx, &mut channel).await.unwrap();
        assert_eq!(channel.get_variable("a.b"), Some(&json!(1)));

        let node: SetVars = serde_json::from_value(json!({
            "id": "vars2",
            "variables": {"unset": ["a.b"]},
            "o_connection": "next",
        }))
        .unwrap();
        node.run(&ctx, &mut channel).await.unwrap();
        assert_eq!(channel.get_variable("a.b"), None);
        assert_eq!(channel.node_id, "next");
    }

    #[tokio::test]
    async fn test_set_values_are_rendered() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c2").await.unwrap();
        channel.set_variable("caller", json!("alice"));

        let node: SetVars = serde_json::from_value(json!({
            "id": "vars",
            "variables": {"set": {"greeting": "hello {{ caller }}", "count": "3"}},
            "o_connection": "next",
        }))
        .unwrap();
        node.run(&ctx, &mut channel).await.unwrap();

        assert_eq!(channel.get_variable("greeting"), Some(&json!("hello alice")));
        assert_eq!(channel.get_variable("count"), Some(&json!(3)));
    }
}
