//! Execution tree store.
//!
//! A tree is a keyed set of `ExecutionNode`s anchored by a pre-completed
//! root. `ExecutionTreeStore` is the persistence seam; `LocalTreeStore` is the
//! in-process implementation, optionally mirroring every tree to a JSON file
//! so trees survive restarts.
//!
//! Dependency cycles are rejected when nodes are added, using petgraph the
//! same way the plan validator does.

use async_trait::async_trait;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::node::{ExecutionNode, NodeStatus, Payload, ROOT_NODE_ID};
use crate::error::{Error, Result};
use crate::{tlog_debug, tlog_trace, tlog_warn};

/// A consistent copy of a whole tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub tree_id: String,
    pub root_node_id: String,
    #[serde(default)]
    pub metadata: Payload,
    pub nodes: BTreeMap<String, ExecutionNode>,
}

impl TreeSnapshot {
    /// Nodes other than the root.
    pub fn work_nodes(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.nodes.values().filter(|n| !n.is_root())
    }
}

/// Node counts for a tree.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TreeMetrics {
    pub total_nodes: usize,
    pub status_counts: BTreeMap<NodeStatus, usize>,
}

impl TreeMetrics {
    pub fn count(&self, status: NodeStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }
}

/// Durable, concurrency-safe CRUD over the nodes of many trees.
///
/// Implementations must apply each node update atomically: readers never
/// observe a half-applied update, and `get_ready_nodes` is computed from one
/// consistent view of the tree.
#[async_trait]
pub trait ExecutionTreeStore: Send + Sync {
    /// Create a tree whose root node is already COMPLETED.
    ///
    /// The tree is keyed by `root_name`; the returned id equals it.
    async fn create_tree(&self, root_name: &str, metadata: Payload) -> Result<String>;

    /// Insert a node. Returns false if the tree is unknown or the id is taken.
    ///
    /// # Errors
    /// `CycleDetected` if the node depends on itself or closes a cycle.
    async fn add_node(&self, tree_id: &str, node: ExecutionNode) -> Result<bool>;

    async fn get_node(&self, tree_id: &str, node_id: &str) -> Result<Option<ExecutionNode>>;

    /// Atomically set a node's status and payloads. Returns false if the node
    /// does not exist.
    async fn update_node_status(
        &self,
        tree_id: &str,
        node_id: &str,
        status: NodeStatus,
        result_data: Option<Payload>,
        error_data: Option<Payload>,
    ) -> Result<bool>;

    /// Record how many retries a node has consumed.
    async fn set_retry_count(&self, tree_id: &str, node_id: &str, retry_count: u32)
        -> Result<bool>;

    /// PENDING non-root nodes whose dependencies are all COMPLETED.
    async fn get_ready_nodes(&self, tree_id: &str) -> Result<Vec<ExecutionNode>>;

    async fn get_tree_snapshot(&self, tree_id: &str) -> Result<Option<TreeSnapshot>>;

    async fn get_tree_metrics(&self, tree_id: &str) -> Result<Option<TreeMetrics>>;

    async fn delete_tree(&self, tree_id: &str) -> Result<bool>;

    async fn health_check(&self) -> bool;
}

/// Order node ids so every node comes after its dependencies.
///
/// Each entry is `(id, dependencies)`. Dependencies naming ids that are not
/// in `entries` are ignored here; callers that need them to exist check
/// separately.
///
/// # Errors
/// `CycleDetected` naming a node on the cycle (self-dependencies included).
pub fn topological_order<'a, I, D>(entries: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = (&'a str, D)>,
    D: IntoIterator<Item = &'a String>,
{
    let mut graph: DiGraph<&'a str, ()> = DiGraph::new();
    let mut index: HashMap<&'a str, NodeIndex> = HashMap::new();
    let mut edges: Vec<(&'a str, &'a str)> = Vec::new();

    for (id, deps) in entries {
        let idx = graph.add_node(id);
        index.insert(id, idx);
        for dep in deps {
            edges.push((dep.as_str(), id));
        }
    }

    for (from, to) in edges {
        if let (Some(&a), Some(&b)) = (index.get(from), index.get(to)) {
            graph.add_edge(a, b, ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let id = graph
            .node_weight(cycle.node_id())
            .copied()
            .unwrap_or("unknown");
        Error::CycleDetected(format!("cycle through node {}", id))
    })?;

    Ok(sorted
        .into_iter()
        .filter_map(|idx| graph.node_weight(idx).map(|id| id.to_string()))
        .collect())
}

struct TreeEntry {
    root_node_id: String,
    metadata: Payload,
    nodes: RwLock<BTreeMap<String, ExecutionNode>>,
    /// Orders file writes so the last write always carries the latest state.
    persist_lock: tokio::sync::Mutex<()>,
    /// Set under `persist_lock` once the tree is deleted; no file is written after.
    deleted: AtomicBool,
}

impl TreeEntry {
    fn new(root: ExecutionNode, metadata: Payload) -> Self {
        let root_node_id = root.id.clone();
        let mut nodes = BTreeMap::new();
        nodes.insert(root.id.clone(), root);
        Self {
            root_node_id,
            metadata,
            nodes: RwLock::new(nodes),
            persist_lock: tokio::sync::Mutex::new(()),
            deleted: AtomicBool::new(false),
        }
    }

    fn from_snapshot(snapshot: TreeSnapshot) -> Self {
        Self {
            root_node_id: snapshot.root_node_id,
            metadata: snapshot.metadata,
            nodes: RwLock::new(snapshot.nodes),
            persist_lock: tokio::sync::Mutex::new(()),
            deleted: AtomicBool::new(false),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, ExecutionNode>>> {
        self.nodes.read().map_err(|e| Error::Store(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, ExecutionNode>>> {
        self.nodes.write().map_err(|e| Error::Store(e.to_string()))
    }

    fn snapshot(&self, tree_id: &str) -> Result<TreeSnapshot> {
        Ok(TreeSnapshot {
            tree_id: tree_id.to_string(),
            root_node_id: self.root_node_id.clone(),
            metadata: self.metadata.clone(),
            nodes: self.read()?.clone(),
        })
    }
}

/// In-process tree store with optional JSON persistence.
///
/// Each tree has its own lock, held only for the in-memory mutation, so
/// updates to different trees never contend and no lock is held across an
/// await. When persistent, each mutation is followed by a rewrite of
/// `<dir>/<tree_id>.json`.
pub struct LocalTreeStore {
    trees: RwLock<HashMap<String, Arc<TreeEntry>>>,
    persist_dir: Option<PathBuf>,
}

impl LocalTreeStore {
    /// Create a purely in-memory store.
    pub fn new() -> Self {
        Self {
            trees: RwLock::new(HashMap::new()),
            persist_dir: None,
        }
    }

    /// Create an empty store that persists trees under `dir`.
    pub fn persistent(dir: &Path) -> Self {
        Self {
            trees: RwLock::new(HashMap::new()),
            persist_dir: Some(dir.to_path_buf()),
        }
    }

    /// Open a persistent store, loading every tree previously written to `dir`.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let store = Self::persistent(dir);

        let mut loaded = HashMap::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<TreeSnapshot>(&bytes) {
                Ok(snapshot) => {
                    tlog_debug!(
                        "LocalTreeStore::open loaded tree {} ({} nodes)",
                        snapshot.tree_id,
                        snapshot.nodes.len()
                    );
                    loaded.insert(
                        snapshot.tree_id.clone(),
                        Arc::new(TreeEntry::from_snapshot(snapshot)),
                    );
                }
                Err(e) => {
                    tlog_warn!("Skipping unreadable tree file {}: {}", path.display(), e);
                }
            }
        }

        *store.trees_write()? = loaded;
        Ok(store)
    }

    /// Number of trees currently held.
    pub fn tree_count(&self) -> usize {
        self.trees.read().map(|t| t.len()).unwrap_or(0)
    }

    fn trees_read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Arc<TreeEntry>>>> {
        self.trees.read().map_err(|e| Error::Store(e.to_string()))
    }

    fn trees_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Arc<TreeEntry>>>> {
        self.trees.write().map_err(|e| Error::Store(e.to_string()))
    }

    fn entry(&self, tree_id: &str) -> Result<Option<Arc<TreeEntry>>> {
        Ok(self.trees_read()?.get(tree_id).cloned())
    }

    fn tree_path(&self, tree_id: &str) -> Option<PathBuf> {
        self.persist_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", tree_id)))
    }

    async fn persist(&self, tree_id: &str, entry: &TreeEntry) -> Result<()> {
        let Some(path) = self.tree_path(tree_id) else {
            return Ok(());
        };

        let _guard = entry.persist_lock.lock().await;
        if entry.deleted.load(Ordering::SeqCst) {
            tlog_trace!("Tree {} deleted, not persisting", tree_id);
            return Ok(());
        }
        let snapshot = entry.snapshot(tree_id)?;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tlog_trace!("Persisted tree {} to {}", tree_id, path.display());
        Ok(())
    }
}

impl Default for LocalTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_tree_id(tree_id: &str) -> Result<()> {
    let valid = !tree_id.is_empty()
        && tree_id != "."
        && tree_id != ".."
        && tree_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid tree id: {:?}", tree_id)))
    }
}

#[async_trait]
impl ExecutionTreeStore for LocalTreeStore {
    async fn create_tree(&self, root_name: &str, metadata: Payload) -> Result<String> {
        validate_tree_id(root_name)?;
        let entry = {
            let mut trees = self.trees_write()?;
            if trees.contains_key(root_name) {
                return Err(Error::TreeExists(root_name.to_string()));
            }
            let entry = Arc::new(TreeEntry::new(ExecutionNode::root(root_name), metadata));
            trees.insert(root_name.to_string(), Arc::clone(&entry));
            entry
        };
        tlog_debug!("Created tree {}", root_name);
        self.persist(root_name, &entry).await?;
        Ok(root_name.to_string())
    }

    async fn add_node(&self, tree_id: &str, node: ExecutionNode) -> Result<bool> {
        let Some(entry) = self.entry(tree_id)? else {
            return Ok(false);
        };

        {
            let mut nodes = entry.write()?;
            if nodes.contains_key(&node.id) {
                return Ok(false);
            }
            if node.dependencies.contains(&node.id) {
                return Err(Error::CycleDetected(format!(
                    "node {} depends on itself",
                    node.id
                )));
            }

            let candidate = nodes
                .values()
                .map(|n| (n.id.as_str(), &n.dependencies))
                .chain(std::iter::once((node.id.as_str(), &node.dependencies)));
            topological_order(candidate)?;

            tlog_trace!("Tree {}: add node {}", tree_id, node.id);
            nodes.insert(node.id.clone(), node);
        }

        self.persist(tree_id, &entry).await?;
        Ok(true)
    }

    async fn get_node(&self, tree_id: &str, node_id: &str) -> Result<Option<ExecutionNode>> {
        let Some(entry) = self.entry(tree_id)? else {
            return Ok(None);
        };
        let nodes = entry.read()?;
        Ok(nodes.get(node_id).cloned())
    }

    async fn update_node_status(
        &self,
        tree_id: &str,
        node_id: &str,
        status: NodeStatus,
        result_data: Option<Payload>,
        error_data: Option<Payload>,
    ) -> Result<bool> {
        let Some(entry) = self.entry(tree_id)? else {
            return Ok(false);
        };

        {
            let mut nodes = entry.write()?;
            let Some(node) = nodes.get_mut(node_id) else {
                return Ok(false);
            };
            tlog_trace!(
                "Tree {}: node {} {} -> {}",
                tree_id,
                node_id,
                node.status,
                status
            );
            node.apply_status(status, result_data, error_data);
        }

        self.persist(tree_id, &entry).await?;
        Ok(true)
    }

    async fn set_retry_count(
        &self,
        tree_id: &str,
        node_id: &str,
        retry_count: u32,
    ) -> Result<bool> {
        let Some(entry) = self.entry(tree_id)? else {
            return Ok(false);
        };

        {
            let mut nodes = entry.write()?;
            let Some(node) = nodes.get_mut(node_id) else {
                return Ok(false);
            };
            node.retry_count = retry_count;
        }

        self.persist(tree_id, &entry).await?;
        Ok(true)
    }

    async fn get_ready_nodes(&self, tree_id: &str) -> Result<Vec<ExecutionNode>> {
        let Some(entry) = self.entry(tree_id)? else {
            return Ok(Vec::new());
        };

        let nodes = entry.read()?;
        Ok(nodes
            .values()
            .filter(|node| !node.is_root() && node.status == NodeStatus::Pending)
            .filter(|node| {
                node.dependencies.iter().all(|dep| {
                    nodes
                        .get(dep)
                        .map(|d| d.status == NodeStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect())
    }

    async fn get_tree_snapshot(&self, tree_id: &str) -> Result<Option<TreeSnapshot>> {
        match self.entry(tree_id)? {
            Some(entry) => Ok(Some(entry.snapshot(tree_id)?)),
            None => Ok(None),
        }
    }

    async fn get_tree_metrics(&self, tree_id: &str) -> Result<Option<TreeMetrics>> {
        let Some(entry) = self.entry(tree_id)? else {
            return Ok(None);
        };

        let nodes = entry.read()?;
        let mut metrics = TreeMetrics {
            total_nodes: nodes.len(),
            status_counts: BTreeMap::new(),
        };
        for node in nodes.values() {
            *metrics.status_counts.entry(node.status).or_insert(0) += 1;
        }
        Ok(Some(metrics))
    }

    async fn delete_tree(&self, tree_id: &str) -> Result<bool> {
        let removed = self.trees_write()?.remove(tree_id);
        let Some(entry) = removed else {
            return Ok(false);
        };

        // Wait out any in-flight write of this tree before removing its file.
        let _guard = entry.persist_lock.lock().await;
        entry.deleted.store(true, Ordering::SeqCst);
        if let Some(path) = self.tree_path(tree_id) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tlog_debug!("Deleted tree {}", tree_id);
        Ok(true)
    }

    async fn health_check(&self) -> bool {
        let readable = self.trees.read().is_ok();
        if !readable {
            return false;
        }
        match &self.persist_dir {
            Some(dir) => tokio::fs::create_dir_all(dir).await.is_ok(),
            None => true,
        }
    }
}
