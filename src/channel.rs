use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("channel uid already exists")]
    Conflict,
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("call stack overflow (limit {0})")]
    StackOverflow(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coarse per-call lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Start,
    Input,
    End,
}

/// One persisted record per call session, keyed by the protocol-assigned
/// unique call identifier. Exclusively owned by the session driver for the
/// duration of one protocol event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub id: i64,
    pub channel_uid: String,
    pub node_id: String,
    #[serde(default)]
    pub state: Option<ChannelState>,
    #[serde(default)]
    variables: Map<String, Value>,
    #[serde(default)]
    stack: Vec<String>,
}

impl Channel {
    pub fn new(channel_uid: impl Into<String>) -> Self {
        Self {
            id: 0,
            channel_uid: channel_uid.into(),
            node_id: "start".to_string(),
            state: None,
            variables: Map::new(),
            stack: Vec::new(),
        }
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// Look up a variable by dotted path (`a.b.c`).
    pub fn get_variable(&self, variable_id: &str) -> Option<&Value> {
        let mut current = self.variables.get(variable_id.split('.').next()?)?;
        for segment in variable_id.split('.').skip(1) {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Set a variable by dotted path, creating intermediate objects as
    /// needed. A non-object in the middle of the path is left untouched.
    pub fn set_variable(&mut self, variable_id: &str, value: Value) {
        if variable_id.is_empty() {
            return;
        }
        debug!(channel = %self.channel_uid, variable = %variable_id, "setting variable");

        let segments: Vec<&str> = variable_id.split('.').collect();
        let (last, path) = segments.split_last().expect("split on non-empty id");

        let mut current = &mut self.variables;
        for segment in path {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match entry.as_object_mut() {
                Some(map) => current = map,
                None => {
                    warn!(
                        channel = %self.channel_uid,
                        variable = %variable_id,
                        "cannot assign through non-object segment `{segment}`"
                    );
                    return;
                }
            }
        }
        current.insert(last.to_string(), value);
    }

    pub fn set_variables(&mut self, variables: Map<String, Value>) {
        for (variable_id, value) in variables {
            self.set_variable(&variable_id, value);
        }
    }

    /// Delete a variable by dotted path. Missing paths are a no-op.
    pub fn del_variable(&mut self, variable_id: &str) {
        if variable_id.is_empty() || self.variables.is_empty() {
            return;
        }
        let segments: Vec<&str> = variable_id.split('.').collect();
        let (last, path) = segments.split_last().expect("split on non-empty id");

        let mut current = &mut self.variables;
        for segment in path {
            match current.get_mut(*segment).and_then(Value::as_object_mut) {
                Some(map) => current = map,
                None => {
                    debug!(channel = %self.channel_uid, variable = %variable_id, "variable does not exist");
                    return;
                }
            }
        }
        current.remove(*last);
    }

    pub fn del_variables(&mut self, variables: &[String]) {
        for variable_id in variables {
            self.del_variable(variable_id);
        }
    }

    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    pub fn push_stack(&mut self, node_id: String, limit: usize) -> Result<(), ChannelError> {
        if self.stack.len() >= limit {
            return Err(ChannelError::StackOverflow(limit));
        }
        self.stack.push(node_id);
        Ok(())
    }

    pub fn pop_stack(&mut self) -> Option<String> {
        self.stack.pop()
    }

    /// Logical reset at flow end: the record survives so the same call
    /// identifier can restart a flow.
    pub fn reset(&mut self) {
        self.variables = Map::new();
        self.stack.clear();
        self.node_id = "start".to_string();
        self.state = None;
    }

    pub fn update_position(&mut self, node_id: Option<String>, state: Option<ChannelState>) {
        debug!(
            channel = %self.channel_uid,
            from = %self.node_id,
            to = %node_id.as_deref().unwrap_or(""),
            ?state,
            "channel position update"
        );
        self.node_id = node_id.unwrap_or_default();
        self.state = state;
    }
}

/// Row-level CRUD against the channel table. The real driver lives outside
/// this crate; `MemoryChannelStore` backs tests and single-process setups.
#[async_trait]
pub trait ChannelStore: Send + Sync + Debug {
    /// Insert a new record. Fails with [`StoreError::Conflict`] when the
    /// unique constraint on `channel_uid` is violated.
    async fn insert(&self, channel: &Channel) -> Result<i64, StoreError>;
    async fn update(&self, channel: &Channel) -> Result<(), StoreError>;
    async fn get_by_uid(&self, channel_uid: &str) -> Result<Option<Channel>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryChannelStore {
    rows: DashMap<String, Channel>,
    next_id: AtomicI64,
}

impl MemoryChannelStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: DashMap::new(),
            next_id: AtomicI64::new(1),
        })
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn insert(&self, channel: &Channel) -> Result<i64, StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.rows.entry(channel.channel_uid.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut row = channel.clone();
                row.id = id;
                slot.insert(row);
                Ok(id)
            }
        }
    }

    async fn update(&self, channel: &Channel) -> Result<(), StoreError> {
        match self.rows.get_mut(&channel.channel_uid) {
            Some(mut row) => {
                *row = channel.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "no channel row for uid {}",
                channel.channel_uid
            ))),
        }
    }

    async fn get_by_uid(&self, channel_uid: &str) -> Result<Option<Channel>, StoreError> {
        Ok(self.rows.get(channel_uid).map(|row| row.clone()))
    }
}

/// Loads and persists channels, with a process-wide identity cache keyed by
/// `channel_uid`. The cache is an optimization for bursts of requests on the
/// same call; storage stays authoritative and entries are evicted explicitly
/// when a flow terminates.
pub struct ChannelManager {
    store: Arc<dyn ChannelStore>,
    cache: Cache<String, Channel>,
}

impl ChannelManager {
    pub fn new(store: Arc<dyn ChannelStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache: Cache::builder().build(),
        })
    }

    /// Fetch the channel for a call, creating it at `start` on first
    /// contact. Creation is idempotent under races: insert, on conflict
    /// re-read.
    pub async fn get_or_create(&self, channel_uid: &str) -> Result<Channel, ChannelError> {
        if let Some(channel) = self.cache.get(channel_uid).await {
            return Ok(channel);
        }

        if let Some(channel) = self.store.get_by_uid(channel_uid).await? {
            self.cache.insert(channel_uid.to_string(), channel.clone()).await;
            return Ok(channel);
        }

        let fresh = Channel::new(channel_uid);
        let channel = match self.store.insert(&fresh).await {
            Ok(id) => {
                let mut created = fresh;
                created.id = id;
                created
            }
            Err(StoreError::Conflict) => self
                .store
                .get_by_uid(channel_uid)
                .await?
                .ok_or_else(|| StoreError::Backend("row vanished after conflict".to_string()))?,
            Err(e) => return Err(e.into()),
        };
        self.cache.insert(channel_uid.to_string(), channel.clone()).await;
        Ok(channel)
    }

    pub async fn persist(&self, channel: &Channel) -> Result<(), ChannelError> {
        self.store.update(channel).await?;
        self.cache
            .insert(channel.channel_uid.clone(), channel.clone())
            .await;
        Ok(())
    }

    pub async fn evict(&self, channel_uid: &str) {
        self.cache.invalidate(channel_uid).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dotted_set_creates_nesting() {
        let mut channel = Channel::new("uid-1");
        channel.set_variable("a.b", json!(1));
        assert_eq!(channel.get_variable("a.b"), Some(&json!(1)));
        assert!(channel.get_variable("a").unwrap().is_object());
    }

    #[test]
    fn test_set_then_unset_leaves_no_key() {
        let mut channel = Channel::new("uid-1");
        channel.set_variable("a.b", json!(1));
        channel.del_variables(&["a.b".to_string()]);
        assert_eq!(channel.get_variable("a.b"), None);
        // deleting again must not panic
        channel.del_variable("a.b");
        channel.del_variable("never.existed");
    }

    #[test]
    fn test_set_through_non_object_is_refused() {
        let mut channel = Channel::new("uid-1");
        channel.set_variable("a", json!("scalar"));
        channel.set_variable("a.b", json!(1));
        assert_eq!(channel.get_variable("a"), Some(&json!("scalar")));
    }

    #[test]
    fn test_stack_overflow_is_fatal() {
        let mut channel = Channel::new("uid-1");
        channel.push_stack("s1".to_string(), 2).unwrap();
        channel.push_stack("s2".to_string(), 2).unwrap();
        assert!(matches!(
            channel.push_stack("s3".to_string(), 2),
            Err(ChannelError::StackOverflow(2))
        ));
    }

    #[tokio::test]
    async fn test_creation_is_idempotent_under_conflict() {
        let store = MemoryChannelStore::new();
        let manager = ChannelManager::new(store.clone());

        // Simulate a racing insert from another event.
        store.insert(&Channel::new("race-uid")).await.unwrap();

        let channel = manager.get_or_create("race-uid").await.unwrap();
        assert_eq!(channel.channel_uid, "race-uid");
        assert_eq!(channel.node_id, "start");
    }

    #[tokio::test]
    async fn test_persist_refreshes_cache() {
        let manager = ChannelManager::new(MemoryChannelStore::new());
        let mut channel = manager.get_or_create("uid-2").await.unwrap();

        channel.node_id = "menu".to_string();
        channel.set_variable("opt", json!("1"));
        manager.persist(&channel).await.unwrap();

        let reloaded = manager.get_or_create("uid-2").await.unwrap();
        assert_eq!(reloaded.node_id, "menu");
        assert_eq!(reloaded.get_variable("opt"), Some(&json!("1")));
    }

    #[tokio::test]
    async fn test_evict_falls_back_to_store() {
        let store = MemoryChannelStore::new();
        let manager = ChannelManager::new(store.clone());
        let mut channel = manager.get_or_create("uid-3").await.unwrap();

        channel.reset();
        manager.persist(&channel).await.unwrap();
        manager.evict("uid-3").await;

        let reloaded = manager.get_or_create("uid-3").await.unwrap();
        assert_eq!(reloaded.node_id, "start");
        assert!(reloaded.variables().is_empty());
    }
}
