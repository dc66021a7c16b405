use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, text_of, NodeError};

/// Starts or stops hold music on the leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetMusic {
    pub id: String,
    #[serde(default, alias = "class")]
    pub music_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toggle: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl SetMusic {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let class = text_of(&ctx.render_template(&self.music_class, channel));
        let toggle = match self.toggle.as_ref().map(|t| ctx.render_data(t, channel)) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => !s.eq_ignore_ascii_case("off"),
            _ => true,
        };

        ctx.control.set_music(&class, toggle).await?;
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
