use std::{fs, path::{Path, PathBuf}, sync::Arc};

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::nodes::Node;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow `{0}` not found")]
    NotFound(String),
    #[error("I/O error reading flow: {0}")]
    Io(#[from] std::io::Error),
    #[error("flow parse error: {0}")]
    Parse(#[from] serde_yaml_bw::Error),
}

/// A named graph of nodes plus flow-scoped default variables. Immutable once
/// loaded; the id index fills lazily on first lookup of each id.
#[derive(Debug)]
pub struct Flow {
    name: String,
    flow_variables: Map<String, Value>,
    nodes: Vec<Node>,
    by_id: DashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct RawFlow {
    #[serde(default)]
    flow_variables: Map<String, Value>,
    #[serde(default)]
    nodes: Vec<Value>,
}

impl Flow {
    pub fn new(name: impl Into<String>, flow_variables: Map<String, Value>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            flow_variables,
            nodes,
            by_id: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flow_variables(&self) -> &Map<String, Value> {
        &self.flow_variables
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Parse a flow document. Nodes with an unknown `type` are logged and
    /// skipped; they never fail the whole flow.
    pub fn from_yaml(name: &str, raw: &str) -> Result<Self, FlowError> {
        let parsed: RawFlow = serde_yaml_bw::from_str(raw)?;
        let mut nodes = Vec::with_capacity(parsed.nodes.len());
        for raw_node in parsed.nodes {
            let kind = raw_node
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("<missing>")
                .to_string();
            match serde_json::from_value::<Node>(raw_node) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(flow = name, node_type = %kind, error = %e, "skipping node"),
            }
        }
        Ok(Self::new(name, parsed.flow_variables, nodes))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, FlowError> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let raw = fs::read_to_string(path)?;
        Self::from_yaml(&name, &raw)
    }

    /// Resolve a node by id: cache, then one linear scan that fills the
    /// cache. `None` is not an error; the driver treats it as "reset the
    /// channel to start".
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        if let Some(index) = self.by_id.get(node_id) {
            return self.nodes.get(*index);
        }
        let index = self.nodes.iter().position(|n| n.id() == node_id)?;
        self.by_id.insert(node_id.to_string(), index);
        self.nodes.get(index)
    }
}

/// Process-wide flow registry. A flow is loaded from disk once per name and
/// cached for the process lifetime; edits require a restart.
pub struct FlowManager {
    flows_dir: PathBuf,
    flows: DashMap<String, Arc<Flow>>,
}

impl FlowManager {
    pub fn new(flows_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            flows_dir,
            flows: DashMap::new(),
        })
    }

    pub fn register(&self, flow: Flow) {
        info!(flow = flow.name(), nodes = flow.nodes().len(), "registered flow");
        self.flows.insert(flow.name().to_string(), Arc::new(flow));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Flow>, FlowError> {
        if let Some(flow) = self.flows.get(name) {
            return Ok(flow.clone());
        }
        let path = self.flows_dir.join(format!("{name}.yaml"));
        if !path.exists() {
            return Err(FlowError::NotFound(name.to_string()));
        }
        let flow = Arc::new(Flow::load_from_file(&path)?);
        self.flows.insert(name.to_string(), flow.clone());
        Ok(flow)
    }

    /// Eagerly load every flow in the directory, reporting failures without
    /// aborting startup.
    pub fn load_all(&self) -> usize {
        let mut loaded = 0;
        let entries = match fs::read_dir(&self.flows_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(dir = %self.flows_dir.display(), error = %e, "cannot read flows dir");
                return 0;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            match Flow::load_from_file(&path) {
                Ok(flow) => {
                    self.register(flow);
                    loaded += 1;
                }
                Err(e) => error!(path = %path.display(), error = %e, "failed to load flow"),
            }
        }
        loaded
    }
}
