use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::context::NodeContext;
use crate::email::EmailMessage;

use super::{advance_with_fall_through, text_of, NodeError};

/// Fire-and-forget email dispatch through the client registered for
/// `server_id`. Delivery never blocks flow advancement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    pub id: String,
    pub server_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub recipients: Value,
    #[serde(default)]
    pub attachments: Value,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub encode_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

fn string_list(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(text_of).filter(|s| !s.is_empty()).collect(),
        Value::String(s) if !s.is_empty() => vec![s],
        _ => Vec::new(),
    }
}

impl Email {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let server_id = text_of(&ctx.render_template(&self.server_id, channel));

        match ctx.emails.get(&server_id) {
            Some(client) => {
                let message = EmailMessage {
                    subject: text_of(&ctx.render_template(&self.subject, channel)),
                    text: text_of(&ctx.render_template(&self.text, channel)),
                    recipients: string_list(ctx.render_data(&self.recipients, channel)),
                    attachments: string_list(ctx.render_data(&self.attachments, channel)),
                    format: self.format.clone(),
                    encode_type: self.encode_type.clone(),
                };
                info!(
                    channel = %channel.channel_uid,
                    node = %self.id,
                    server_id = %server_id,
                    recipients = message.recipients.len(),
                    "dispatching email"
                );
                tokio::spawn(async move {
                    if let Err(e) = client.send_email(message).await {
                        warn!(error = %e, "email delivery failed");
                    }
                });
            }
            None => {
                warn!(channel = %channel.channel_uid, node = %self.id, server_id = %server_id, "no email client for server id");
            }
        }

        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}
