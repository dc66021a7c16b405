use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::context::NodeContext;

use super::{advance, fall_through, NodeError};

/// One outgoing case of a switch. `id` is the match key (`default` and
/// `attempt_exceeded` are sentinels); `case` is an optional boolean
/// expression used when the switch has no `validation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
}

/// Routes a rendered value (or the first true case expression) to an
/// outgoing edge, with a bounded retry ceiling so callers cannot loop
/// forever on invalid input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Switch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_attempts: Option<u32>,
    #[serde(default)]
    pub cases: Vec<Case>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o_connection: Option<String>,
}

/// Case ids arrive as YAML scalars; normalize them to one canonical key so
/// `1`, `"1"` and a rendered digit capture all land on the same case.
pub(crate) fn case_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl Switch {
    fn counter_key(&self, channel: &Channel) -> (String, String) {
        (self.id.clone(), channel.channel_uid.clone())
    }

    fn clear_attempts(&self, ctx: &NodeContext, channel: &Channel) {
        ctx.counters
            .validation_attempts
            .remove(&self.counter_key(channel));
    }

    async fn apply_case_variables(
        &self,
        ctx: &NodeContext,
        channel: &mut Channel,
        case: &Case,
    ) -> Result<(), NodeError> {
        let Some(variables) = &case.variables else {
            return Ok(());
        };
        for (variable_id, template) in variables {
            let value = ctx.render_data(template, channel);
            channel.set_variable(variable_id, value);
        }
        ctx.channels.persist(channel).await?;
        Ok(())
    }

    /// Pick the outgoing edge for this channel. `None` means "no case edge";
    /// the caller chains the node's own `o_connection` and the stack rule.
    pub async fn decide(
        &self,
        ctx: &NodeContext,
        channel: &mut Channel,
    ) -> Result<Option<String>, NodeError> {
        let validation_key = match &self.validation {
            Some(expr) => match ctx.try_render(&Value::String(expr.clone()), channel) {
                Ok(Value::Null) => None,
                Ok(Value::String(s)) if s.trim().is_empty() => None,
                Ok(value) => Some(case_key(&value)),
                Err(e) => {
                    warn!(node = %self.id, error = %e, "validation failed to render");
                    Some("except".to_string())
                }
            },
            None => None,
        };

        match validation_key {
            Some(key) => self.case_by_key(&key, ctx, channel).await,
            None => self.validate_cases(ctx, channel).await,
        }
    }

    /// Look a case up by its normalized id.
    pub async fn case_by_key(
        &self,
        key: &str,
        ctx: &NodeContext,
        channel: &mut Channel,
    ) -> Result<Option<String>, NodeError> {
        let Some(case) = self.cases.iter().find(|c| case_key(&c.id) == key) else {
            debug!(node = %self.id, case = %key, "case not found, seeking fallback");
            return self.select_miss_case(ctx, channel).await;
        };

        self.apply_case_variables(ctx, channel, case).await?;
        self.clear_attempts(ctx, channel);
        Ok(ctx.render_edge(case.o_connection.as_deref(), channel))
    }

    /// No `validation` expression: evaluate each case's boolean expression
    /// in declaration order, first true wins.
    async fn validate_cases(
        &self,
        ctx: &NodeContext,
        channel: &mut Channel,
    ) -> Result<Option<String>, NodeError> {
        for case in &self.cases {
            let Some(expr) = &case.case else {
                if !case_key(&case.id).is_empty() {
                    debug!(node = %self.id, "case with id but no expression; use `validation` for id matching");
                }
                continue;
            };
            let verdict = ctx.render_data(&Value::String(expr.clone()), channel);
            match verdict {
                Value::Bool(true) => {}
                Value::Bool(false) | Value::Null => continue,
                other => {
                    warn!(node = %self.id, value = %other, "case expression should render a boolean");
                    continue;
                }
            }

            self.apply_case_variables(ctx, channel, case).await?;
            self.clear_attempts(ctx, channel);
            return Ok(ctx.render_edge(case.o_connection.as_deref(), channel));
        }
        self.select_miss_case(ctx, channel).await
    }

    /// Nothing matched: pick `default` until the attempt ceiling is hit,
    /// then `attempt_exceeded` once, clearing the counter.
    async fn select_miss_case(
        &self,
        ctx: &NodeContext,
        channel: &mut Channel,
    ) -> Result<Option<String>, NodeError> {
        let key = self.counter_key(channel);
        let attempts_made = ctx
            .counters
            .validation_attempts
            .get(&key)
            .map(|v| *v)
            .unwrap_or(0);

        let case_id = match self.validation_attempts {
            Some(limit) if attempts_made >= limit => {
                ctx.counters.validation_attempts.remove(&key);
                "attempt_exceeded"
            }
            Some(limit) => {
                debug!(
                    node = %self.id,
                    channel = %channel.channel_uid,
                    attempts = attempts_made + 1,
                    limit,
                    "validation attempt"
                );
                ctx.counters
                    .validation_attempts
                    .insert(key, attempts_made + 1);
                "default"
            }
            None => "default",
        };

        let case = self.cases.iter().find(|c| case_key(&c.id) == case_id);
        if let Some(case) = case {
            self.apply_case_variables(ctx, channel, case).await?;
        }
        debug!(node = %self.id, fallback = case_id, "selected miss case");

        Ok(match case {
            Some(c) => ctx.render_edge(c.o_connection.as_deref(), channel),
            // An unconfigured fallback restarts the flow rather than
            // dead-ending the call.
            None => Some("start".to_string()),
        })
    }

    /// Chain: case edge, then the node's own `o_connection`, then the
    /// shared stack rule; persist the outcome.
    pub async fn advance_from(
        &self,
        ctx: &NodeContext,
        channel: &mut Channel,
        case_edge: Option<String>,
    ) -> Result<(), NodeError> {
        let edge = match case_edge {
            Some(e) if !e.is_empty() && e != "finish" => Some(e),
            _ => {
                let own = ctx.render_edge(self.o_connection.as_deref(), channel);
                fall_through(own, false, channel)
            }
        };
        advance(ctx, channel, edge).await
    }

    pub async fn run(&self, ctx: &NodeContext, channel: &mut Channel) -> Result<(), NodeError> {
        let case_edge = self.decide(ctx, channel).await?;
        self.advance_from(ctx, channel, case_edge).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::testing::test_context;
    use serde_json::json;

    fn switch_with_limit(limit: Option<u32>) -> Switch {
        serde_json::from_value(json!({
            "id": "ask",
            "validation": "{{ opt }}",
            "validation_attempts": limit,
            "cases": [
                {"id": "1", "o_connection": "m1", "variables": {"picked": "one"}},
                {"id": "default", "o_connection": "retry"},
                {"id": "attempt_exceeded", "o_connection": "bye"},
            ],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_matched_case_applies_variables_and_edge() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c1").await.unwrap();
        channel.set_variable("opt", json!("1"));

        let node = switch_with_limit(Some(3));
        let edge = node.decide(&ctx, &mut channel).await.unwrap();
        assert_eq!(edge.as_deref(), Some("m1"));
        assert_eq!(channel.get_variable("picked"), Some(&json!("one")));
    }

    #[tokio::test]
    async fn test_attempt_ceiling_and_counter_reset() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c2").await.unwrap();
        channel.set_variable("opt", json!("9"));

        let node = switch_with_limit(Some(2));
        let key = ("ask".to_string(), "c2".to_string());

        // N mismatches with attempt_limit = N select default…
        for _ in 0..2 {
            let edge = node.decide(&ctx, &mut channel).await.unwrap();
            assert_eq!(edge.as_deref(), Some("retry"));
        }
        assert_eq!(ctx.counters.validation_attempts.get(&key).map(|v| *v), Some(2));

        // …and the next mismatch selects attempt_exceeded, clearing the counter.
        let edge = node.decide(&ctx, &mut channel).await.unwrap();
        assert_eq!(edge.as_deref(), Some("bye"));
        assert!(ctx.counters.validation_attempts.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_match_after_mismatch_clears_counter() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c3").await.unwrap();
        channel.set_variable("opt", json!("nope"));

        let node = switch_with_limit(Some(5));
        node.decide(&ctx, &mut channel).await.unwrap();
        let key = ("ask".to_string(), "c3".to_string());
        assert!(ctx.counters.validation_attempts.get(&key).is_some());

        channel.set_variable("opt", json!("1"));
        node.decide(&ctx, &mut channel).await.unwrap();
        assert!(ctx.counters.validation_attempts.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_no_limit_always_selects_default() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c4").await.unwrap();
        channel.set_variable("opt", json!("9"));

        let node = switch_with_limit(None);
        for _ in 0..4 {
            let edge = node.decide(&ctx, &mut channel).await.unwrap();
            assert_eq!(edge.as_deref(), Some("retry"));
        }
        let key = ("ask".to_string(), "c4".to_string());
        assert!(ctx.counters.validation_attempts.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_miss_without_default_case_restarts() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c5").await.unwrap();
        channel.set_variable("opt", json!("9"));

        let node: Switch = serde_json::from_value(json!({
            "id": "ask",
            "validation": "{{ opt }}",
            "cases": [{"id": "1", "o_connection": "m1"}],
        }))
        .unwrap();

        let edge = node.decide(&ctx, &mut channel).await.unwrap();
        assert_eq!(edge.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn test_case_expressions_first_true_wins() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c6").await.unwrap();
        channel.set_variable("n", json!(7));

        let node: Switch = serde_json::from_value(json!({
            "id": "branch",
            "cases": [
                {"id": "small", "case": "{{ match \"^[0-4]$\" n }}", "o_connection": "low"},
                {"id": "big", "case": "{{ match \"^[5-9]$\" n }}", "o_connection": "high"},
                {"id": "default", "o_connection": "other"},
            ],
        }))
        .unwrap();

        let edge = node.decide(&ctx, &mut channel).await.unwrap();
        assert_eq!(edge.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn test_run_ends_flow_when_nothing_resolves() {
        let (ctx, channels) = test_context();
        let mut channel = channels.get_or_create("c7").await.unwrap();
        channel.set_variable("opt", json!("9"));

        let node: Switch = serde_json::from_value(json!({
            "id": "ask",
            "validation": "{{ opt }}",
            "cases": [
                {"id": "1", "o_connection": "m1"},
                {"id": "default"},
            ],
        }))
        .unwrap();

        node.run(&ctx, &mut channel).await.unwrap();
        assert_eq!(channel.state, Some(ChannelState::End));
        assert_eq!(channel.node_id, "");
    }
}
