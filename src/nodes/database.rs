use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance_with_fall_through, text_of, NodeError};

/// Splits a `/family/key/path` entry on its last slash: the final segment is
/// the key, the remainder (slashes trimmed) the family.
pub(crate) fn split_entry(entry: &str) -> Option<(String, String)> {
    let (family, key) = entry.rsplit_once('/')?;
    Some((
        family.trim_matches('/').to_string(),
        key.trim_matches('/').to_string(),
    ))
}

/// Reads one value from the call platform's key-value store into a flow
/// variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseGet {
    pub id: String,
    pub family: String,
    pub key: String,
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl DatabaseGet {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let family = text_of(&ctx.render_template(&self.family, channel));
        let key = text_of(&ctx.render_template(&self.key, channel));

        info!(channel = %channel.channel_uid, node = %self.id, family = %family, key = %key, "database get");
        let value = ctx.control.db_get(&family, &key).await?;

        channel.set_variable(
            &self.variable,
            value.map(Value::String).unwrap_or(Value::Null),
        );
        ctx.channels.persist(channel).await?;

        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}

/// Writes entries to the key-value store: `{"/family/key": value}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasePut {
    pub id: String,
    #[serde(default)]
    pub entries: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl DatabasePut {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        if let Value::Object(entries) = ctx.render_data(&self.entries, channel) {
            for (entry, value) in entries {
                let Some((family, key)) = split_entry(&entry) else {
                    info!(channel = %channel.channel_uid, node = %self.id, entry = %entry, "entry has no family/key split");
                    continue;
                };
                ctx.control.db_put(&family, &key, &text_of(&value)).await?;
            }
        }
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}

/// Deletes a list of `/family/key` entries from the key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDel {
    pub id: String,
    #[serde(default)]
    pub entries: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

impl DatabaseDel {
    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        if let Value::Array(entries) = ctx.render_data(&self.entries, channel) {
            for entry in entries {
                let entry = text_of(&entry);
                let Some((family, key)) = split_entry(&entry) else {
                    info!(channel = %channel.channel_uid, node = %self.id, entry = %entry, "entry has no family/key split");
                    continue;
                };
                ctx.control.db_del(&family, &key).await?;
            }
        }
        advance_with_fall_through(ctx, channel, self.o_connection.as_deref(), false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, test_context_with, MockControl};
    use serde_json::json;

    #[test]
    fn test_split_entry_last_segment_is_key() {
        assert_eq!(
            split_entry("/Exten/Sequence/196"),
            Some(("Exten/Sequence".to_string(), "196".to_string()))
        );
        assert_eq!(
            split_entry("family/key"),
            Some(("family".to_string(), "key".to_string()))
        );
        assert_eq!(split_entry("nokey"), None);
    }

    #[tokio::test]
    async fn test_database_del_issues_one_call_per_entry() {
        let control = MockControl::new();
        let (ctx, channels) = test_context_with(control.clone(), Default::default());
        let mut channel = channels.get_or_create("c1").await.unwrap();

        let node: DatabaseDel = serde_json::from_value(json!({
            "id": "cleanup",
            "entries": ["/Exten/Sequence/196"],
            "o_connection": "done",
        }))
        .unwrap();
        node.run(&ctx, &mut channel).await.unwrap();

        assert_eq!(control.calls(), vec!["db_del(Exten/Sequence, 196)"]);
        assert_eq!(channel.node_id, "done");
    }

    #[tokio::test]
    async fn test_database_get_binds_variable() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c2").await.unwrap();

        let node: DatabaseGet = serde_json::from_value(json!({
            "id": "lookup",
            "family": "Accounts",
            "key": "{{ account }}",
            "variable": "balance",
        }))
        .unwrap();
        channel.set_variable("account", json!("42"));
        node.run(&ctx, &mut channel).await.unwrap();

        // Nothing stored in the mock: the variable binds to null.
        assert_eq!(channel.get_variable("balance"), Some(&json!(null)));
    }
}
