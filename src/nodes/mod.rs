use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{Channel, ChannelError, ChannelState};
use crate::context::NodeContext;
use crate::control::ControlError;
use crate::render::RenderError;

pub mod answer;
pub mod database;
pub mod email;
pub mod exec_app;
pub mod get_data;
pub mod get_full_variable;
pub mod get_variable;
pub mod goto_on_exit;
pub mod hangup;
pub mod http_request;
pub mod no_op;
pub mod playback;
pub mod record;
pub mod set_callerid;
pub mod set_music;
pub mod set_variable;
pub mod set_vars;
pub mod subroutine;
pub mod switch;
pub mod verbose;

pub use switch::{Case, Switch};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("node execution failed: {0}")]
    Execution(String),
}

/// One typed step of a flow. Closed union: construction from a raw record is
/// a pure function of the `type` tag, and dispatch is an exhaustive match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Answer(answer::Answer),
    Playback(playback::Playback),
    Record(record::Record),
    Switch(switch::Switch),
    GetData(get_data::GetData),
    HttpRequest(http_request::HttpRequest),
    DatabaseGet(database::DatabaseGet),
    DatabasePut(database::DatabasePut),
    DatabaseDel(database::DatabaseDel),
    SetVariable(set_variable::SetVariable),
    SetVars(set_vars::SetVars),
    GetVariable(get_variable::GetVariable),
    GetFullVariable(get_full_variable::GetFullVariable),
    Verbose(verbose::Verbose),
    SetCallerid(set_callerid::SetCallerId),
    SetMusic(set_music::SetMusic),
    ExecApp(exec_app::ExecApp),
    Email(email::Email),
    Subroutine(subroutine::Subroutine),
    GotoOnExit(goto_on_exit::GotoOnExit),
    NoOp(no_op::NoOp),
    Hangup(hangup::Hangup),
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Answer(n) => &n.id,
            Node::Playback(n) => &n.id,
            Node::Record(n) => &n.id,
            Node::Switch(n) => &n.id,
            Node::GetData(n) => &n.switch.id,
            Node::HttpRequest(n) => &n.switch.id,
            Node::DatabaseGet(n) => &n.id,
            Node::DatabasePut(n) => &n.id,
            Node::DatabaseDel(n) => &n.id,
            Node::SetVariable(n) => &n.id,
            Node::SetVars(n) => &n.id,
            Node::GetVariable(n) => &n.id,
            Node::GetFullVariable(n) => &n.id,
            Node::Verbose(n) => &n.id,
            Node::SetCallerid(n) => &n.id,
            Node::SetMusic(n) => &n.id,
            Node::ExecApp(n) => &n.id,
            Node::Email(n) => &n.id,
            Node::Subroutine(n) => &n.id,
            Node::GotoOnExit(n) => &n.id,
            Node::NoOp(n) => &n.id,
            Node::Hangup(n) => &n.id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Node::Answer(_) => "answer",
            Node::Playback(_) => "playback",
            Node::Record(_) => "record",
            Node::Switch(_) => "switch",
            Node::GetData(_) => "get_data",
            Node::HttpRequest(_) => "http_request",
            Node::DatabaseGet(_) => "database_get",
            Node::DatabasePut(_) => "database_put",
            Node::DatabaseDel(_) => "database_del",
            Node::SetVariable(_) => "set_variable",
            Node::SetVars(_) => "set_vars",
            Node::GetVariable(_) => "get_variable",
            Node::GetFullVariable(_) => "get_full_variable",
            Node::Verbose(_) => "verbose",
            Node::SetCallerid(_) => "set_callerid",
            Node::SetMusic(_) => "set_music",
            Node::ExecApp(_) => "exec_app",
            Node::Email(_) => "email",
            Node::Subroutine(_) => "subroutine",
            Node::GotoOnExit(_) => "goto_on_exit",
            Node::NoOp(_) => "no_op",
            Node::Hangup(_) => "hangup",
        }
    }

    pub fn is_subroutine(&self) -> bool {
        matches!(self, Node::Subroutine(_))
    }

    #[tracing::instrument(
        name = "node_execute",
        skip(self, ctx, channel),
        fields(node = %self.id(), kind = %self.type_name(), channel = %channel.channel_uid)
    )]
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        match self {
            Node::Answer(n) => n.run(ctx, channel).await,
            Node::Playback(n) => n.run(ctx, channel).await,
            Node::Record(n) => n.run(ctx, channel).await,
            Node::Switch(n) => n.run(ctx, channel).await,
            Node::GetData(n) => n.run(ctx, channel).await,
            Node::HttpRequest(n) => n.run(ctx, channel).await,
            Node::DatabaseGet(n) => n.run(ctx, channel).await,
            Node::DatabasePut(n) => n.run(ctx, channel).await,
            Node::DatabaseDel(n) => n.run(ctx, channel).await,
            Node::SetVariable(n) => n.run(ctx, channel).await,
            Node::SetVars(n) => n.run(ctx, channel).await,
            Node::GetVariable(n) => n.run(ctx, channel).await,
            Node::GetFullVariable(n) => n.run(ctx, channel).await,
            Node::Verbose(n) => n.run(ctx, channel).await,
            Node::SetCallerid(n) => n.run(ctx, channel).await,
            Node::SetMusic(n) => n.run(ctx, channel).await,
            Node::ExecApp(n) => n.run(ctx, channel).await,
            Node::Email(n) => n.run(ctx, channel).await,
            Node::Subroutine(n) => n.run(ctx, channel).await,
            Node::GotoOnExit(n) => n.run(ctx, channel).await,
            Node::NoOp(n) => n.run(ctx, channel).await,
            Node::Hangup(n) => n.run(ctx, channel).await,
        }
    }
}

/// Rendered values feeding protocol commands are used as text.
pub(crate) fn text_of(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn int_of(value: &serde_json::Value, default: i64) -> i64 {
    match value {
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(default),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

/// The shared outgoing-edge rule. A rendered `o_connection` wins unless it
/// is empty or the `finish` sentinel; then the call stack is popped (except
/// for subroutine nodes, which manage the stack themselves); then the flow
/// ends.
pub(crate) fn fall_through(
    edge: Option<String>,
    is_subroutine: bool,
    channel: &mut Channel,
) -> Option<String> {
    match edge {
        Some(e) if !e.is_empty() && e != "finish" => Some(e),
        _ if !is_subroutine => channel.pop_stack(),
        _ => None,
    }
}

/// Persist the channel at its new position. Lifecycle goes to `End` exactly
/// when there is no edge.
pub(crate) async fn advance(
    ctx: &NodeContext,
    channel: &mut Channel,
    edge: Option<String>,
) -> Result<(), NodeError> {
    let state = if edge.is_none() {
        Some(ChannelState::End)
    } else {
        None
    };
    channel.update_position(edge, state);
    ctx.channels.persist(channel).await?;
    Ok(())
}

/// Render the configured edge, apply the shared fall-through rule, persist.
pub(crate) async fn advance_with_fall_through(
    ctx: &NodeContext,
    channel: &mut Channel,
    o_connection: Option<&str>,
    is_subroutine: bool,
) -> Result<(), NodeError> {
    let rendered = ctx.render_edge(o_connection, channel);
    let edge = fall_through(rendered, is_subroutine, channel);
    advance(ctx, channel, edge).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fall_through_prefers_configured_edge() {
        let mut channel = Channel::new("uid");
        channel.push_stack("caller".to_string(), 8).unwrap();
        let edge = fall_through(Some("menu".to_string()), false, &mut channel);
        assert_eq!(edge.as_deref(), Some("menu"));
        assert_eq!(channel.stack().len(), 1);
    }

    #[test]
    fn test_fall_through_pops_stack_on_empty_edge() {
        let mut channel = Channel::new("uid");
        channel.push_stack("caller".to_string(), 8).unwrap();
        assert_eq!(
            fall_through(None, false, &mut channel).as_deref(),
            Some("caller")
        );
        assert!(channel.stack().is_empty());
    }

    #[test]
    fn test_finish_sentinel_behaves_like_empty() {
        let mut channel = Channel::new("uid");
        assert_eq!(fall_through(Some("finish".to_string()), false, &mut channel), None);
    }

    #[test]
    fn test_subroutine_skips_stack_consultation() {
        let mut channel = Channel::new("uid");
        channel.push_stack("caller".to_string(), 8).unwrap();
        assert_eq!(fall_through(None, true, &mut channel), None);
        assert_eq!(channel.stack().len(), 1);
    }

    #[test]
    fn test_node_deserializes_by_type_tag() {
        let node: Node = serde_json::from_value(json!({
            "type": "playback",
            "id": "p1",
            "file": "tt-monkeys",
            "o_connection": "m2",
        }))
        .unwrap();
        assert_eq!(node.id(), "p1");
        assert_eq!(node.type_name(), "playback");
        assert!(!node.is_subroutine());
    }

    #[test]
    fn test_unknown_type_tag_fails_construction() {
        assert!(serde_json::from_value::<Node>(json!({"type": "teleport", "id": "x"})).is_err());
    }
}
