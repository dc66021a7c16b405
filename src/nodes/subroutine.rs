use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance, fall_through, text_of, NodeError};

/// Subroutine call/return across two protocol round-trips. First visit
/// pushes this node's id and enters `go_sub`; the visit that pops its own id
/// back off the stack is the return and advances past the call site. A
/// different id on top means a nested invocation: it stays on the stack and
/// this node's id goes on above it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subroutine {
    pub id: String,
    pub go_sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl Subroutine {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        info!(channel = %channel.channel_uid, node = %self.id, "entering subroutine node");

        let go_sub = text_of(&ctx.render_template(&self.go_sub, channel));
        if go_sub.is_empty() {
            warn!(channel = %channel.channel_uid, node = %self.id, "go_sub is empty, check the flow configuration");
            return Ok(());
        }

        let limit = ctx.config.stack_limit;

        let returning = match channel.pop_stack() {
            None => {
                channel.push_stack(self.id.clone(), limit)?;
                false
            }
            Some(top) if top != self.id => {
                // nested call: keep the caller's frame underneath ours
                channel.push_stack(top, limit)?;
                channel.push_stack(self.id.clone(), limit)?;
                false
            }
            Some(_) => true,
        };

        if returning {
            debug!(channel = %channel.channel_uid, node = %self.id, "subroutine returned");
            let own = ctx.render_edge(self.o_connection.as_deref(), channel);
            let edge = fall_through(own, false, channel);
            advance(ctx, channel, edge).await
        } else {
            debug!(channel = %channel.channel_uid, node = %self.id, go_sub = %go_sub, stack = ?channel.stack(), "descending into subroutine");
            advance(ctx, channel, Some(go_sub)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::testing::test_context;
    use serde_json::json;

    fn node(o_connection: Option<&str>) -> Subroutine {
        serde_json::from_value(json!({
            "id": "sub1",
            "go_sub": "sub_entry",
            "o_connection": o_connection,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_leaves_no_residual_stack() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c1").await.unwrap();
        let sub = node(Some("m2"));

        // entry: push own id, descend
        sub.run(&ctx, &mut channel).await.unwrap();
        assert_eq!(channel.node_id, "sub_entry");
        assert_eq!(channel.stack(), ["sub1"]);

        // return: pop own id, advance past the call site
        sub.run(&ctx, &mut channel).await.unwrap();
        assert_eq!(channel.node_id, "m2");
        assert!(channel.stack().is_empty());
    }

    #[tokio::test]
    async fn test_nested_call_preserves_caller_frame() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c2").await.unwrap();
        channel.push_stack("outer".to_string(), 8).unwrap();

        let sub = node(Some("m2"));
        sub.run(&ctx, &mut channel).await.unwrap();

        assert_eq!(channel.node_id, "sub_entry");
        assert_eq!(channel.stack(), ["outer", "sub1"]);
    }

    #[tokio::test]
    async fn test_return_without_edge_pops_caller() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c3").await.unwrap();
        channel.push_stack("outer".to_string(), 8).unwrap();
        channel.push_stack("sub1".to_string(), 8).unwrap();

        let sub = node(None);
        sub.run(&ctx, &mut channel).await.unwrap();

        assert_eq!(channel.node_id, "outer");
        assert!(channel.stack().is_empty());
    }

    #[tokio::test]
    async fn test_return_with_nothing_left_ends_flow() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c4").await.unwrap();
        channel.push_stack("sub1".to_string(), 8).unwrap();

        let sub = node(None);
        sub.run(&ctx, &mut channel).await.unwrap();

        assert_eq!(channel.state, Some(ChannelState::End));
    }
}
