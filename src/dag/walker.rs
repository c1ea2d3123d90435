use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use petgraph::graph::NodeIndex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::executor::engine::ResourceAction;

use super::resource_graph::{DeploymentGraph, GraphNode};

/// Status of a node during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
    /// Never started because a transitive dependency failed.
    Skipped { failed_dependency: String },
    /// Never started because the caller cancelled the walk.
    Cancelled,
}

/// What a node executor produced on success.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub action: ResourceAction,
    pub state: serde_json::Value,
}

/// Result of executing a single node.
#[derive(Debug)]
pub struct NodeResult {
    pub node_index: NodeIndex,
    pub name: String,
    pub status: NodeStatus,
    pub output: Option<NodeOutput>,
}

/// Message sent back from worker tasks to the walker.
enum WalkerMessage {
    NodeCompleted(NodeResult),
}

/// Callback signature for node execution.
pub type NodeExecutor = Box<
    dyn Fn(
            NodeIndex,
            GraphNode,
        ) -> futures::future::BoxFuture<'static, Result<NodeOutput, EngineError>>
        + Send
        + Sync,
>;

/// Cooperative cancellation for a walk in progress. Cancelling stops the
/// walker from scheduling any further nodes; in-flight provider calls run to
/// completion so state is only ever recorded for confirmed operations.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Event-driven DAG walker that executes nodes as their dependencies reach
/// terminal success, with bounded parallelism.
pub struct DagWalker {
    max_parallelism: usize,
    cancel: CancelHandle,
}

impl DagWalker {
    pub fn new(max_parallelism: usize, cancel: CancelHandle) -> Self {
        Self {
            max_parallelism: max_parallelism.max(1),
            cancel,
        }
    }

    /// Walk the graph, executing every node via the provided executor.
    ///
    /// A node is spawned only once all of its dependencies succeeded; on a
    /// node failure every transitive dependent is marked skipped without
    /// starting. Ready nodes are spawned in declaration order so runs are
    /// deterministic where the graph does not impose an order.
    pub async fn walk(
        &self,
        graph: &DeploymentGraph,
        executor: Arc<NodeExecutor>,
    ) -> Vec<NodeResult> {
        let node_count = graph.node_count();
        if node_count == 0 {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let statuses: Arc<DashMap<NodeIndex, NodeStatus>> = Arc::new(DashMap::new());
        let start_times: Arc<DashMap<NodeIndex, Instant>> = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::channel::<WalkerMessage>(node_count);

        // Dependency bookkeeping.
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        let mut dependencies: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();

        for idx in graph.node_indices() {
            in_degree.insert(idx, 0);
            dependents.insert(idx, Vec::new());
            dependencies.insert(idx, Vec::new());
            statuses.insert(idx, NodeStatus::Pending);
        }
        for edge in graph.edge_indices() {
            if let Some((from, to)) = graph.edge_endpoints(edge) {
                *in_degree.entry(to).or_insert(0) += 1;
                dependents.entry(from).or_default().push(to);
                dependencies.entry(to).or_default().push(from);
            }
        }

        let mut completed_count = 0;
        let mut results: Vec<NodeResult> = Vec::new();

        if self.cancel.is_cancelled() {
            return self.cancel_pending(graph, &statuses, &mut completed_count);
        }

        // Spawn the initially ready nodes in declaration order.
        let mut ready: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&idx, _)| idx)
            .collect();
        ready.sort_by_key(|&idx| graph[idx].declaration_index);
        for idx in ready {
            spawn_node(idx, graph, &executor, &semaphore, &statuses, &start_times, &tx);
        }

        while completed_count < node_count {
            let Some(WalkerMessage::NodeCompleted(result)) = rx.recv().await else {
                break;
            };
            let node_idx = result.node_index;
            let succeeded = result.status == NodeStatus::Succeeded;
            let elapsed = start_times
                .get(&node_idx)
                .map(|t| t.elapsed())
                .unwrap_or_default();
            start_times.remove(&node_idx);

            statuses.insert(node_idx, result.status.clone());
            completed_count += 1;

            match &result.status {
                NodeStatus::Succeeded => {
                    info!(
                        name = %result.name,
                        action = ?result.output.as_ref().map(|o| o.action),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "node converged"
                    );
                }
                NodeStatus::Failed(err) => {
                    warn!(
                        name = %result.name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %err,
                        "node failed"
                    );
                }
                _ => {}
            }

            if succeeded && !self.cancel.is_cancelled() {
                // Spawn any dependents whose dependencies are now all met,
                // in declaration order.
                let mut newly_ready: Vec<NodeIndex> = Vec::new();
                if let Some(deps) = dependents.get(&node_idx) {
                    for &dependent_idx in deps {
                        let already_seen = statuses
                            .get(&dependent_idx)
                            .map(|s| *s != NodeStatus::Pending)
                            .unwrap_or(true);
                        if already_seen {
                            continue;
                        }
                        let all_deps_met = dependencies
                            .get(&dependent_idx)
                            .map(|dep_list| {
                                dep_list.iter().all(|dep_idx| {
                                    statuses
                                        .get(dep_idx)
                                        .map(|s| *s == NodeStatus::Succeeded)
                                        .unwrap_or(false)
                                })
                            })
                            .unwrap_or(true);
                        if all_deps_met && !newly_ready.contains(&dependent_idx) {
                            newly_ready.push(dependent_idx);
                        }
                    }
                }
                newly_ready.sort_by_key(|&idx| graph[idx].declaration_index);
                for idx in newly_ready {
                    spawn_node(idx, graph, &executor, &semaphore, &statuses, &start_times, &tx);
                }
            } else if !succeeded {
                // Cascade skip to transitive dependents that have not run.
                for skip_idx in collect_transitive_dependents(node_idx, &dependents) {
                    let pending = statuses
                        .get(&skip_idx)
                        .map(|s| *s == NodeStatus::Pending)
                        .unwrap_or(false);
                    if !pending {
                        continue;
                    }
                    let status = NodeStatus::Skipped {
                        failed_dependency: result.name.clone(),
                    };
                    statuses.insert(skip_idx, status.clone());
                    completed_count += 1;
                    debug!(
                        name = %graph[skip_idx].name,
                        failed_dependency = %result.name,
                        "node skipped"
                    );
                    results.push(NodeResult {
                        node_index: skip_idx,
                        name: graph[skip_idx].name.clone(),
                        status,
                        output: None,
                    });
                }
            }

            results.push(result);

            if self.cancel.is_cancelled() {
                results.extend(self.cancel_pending(graph, &statuses, &mut completed_count));
            }
        }

        results
    }

    /// Mark every still-pending node cancelled. Running nodes are left to
    /// finish and report through the channel.
    fn cancel_pending(
        &self,
        graph: &DeploymentGraph,
        statuses: &DashMap<NodeIndex, NodeStatus>,
        completed_count: &mut usize,
    ) -> Vec<NodeResult> {
        let mut cancelled = Vec::new();
        for idx in graph.node_indices() {
            let pending = statuses
                .get(&idx)
                .map(|s| *s == NodeStatus::Pending)
                .unwrap_or(false);
            if pending {
                statuses.insert(idx, NodeStatus::Cancelled);
                *completed_count += 1;
                cancelled.push(NodeResult {
                    node_index: idx,
                    name: graph[idx].name.clone(),
                    status: NodeStatus::Cancelled,
                    output: None,
                });
            }
        }
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "cancelled pending nodes");
        }
        cancelled
    }
}

/// Spawn execution of a single node.
fn spawn_node(
    idx: NodeIndex,
    graph: &DeploymentGraph,
    executor: &Arc<NodeExecutor>,
    semaphore: &Arc<Semaphore>,
    statuses: &Arc<DashMap<NodeIndex, NodeStatus>>,
    start_times: &Arc<DashMap<NodeIndex, Instant>>,
    tx: &mpsc::Sender<WalkerMessage>,
) {
    let node = graph[idx].clone();
    let name = node.name.clone();
    let executor = Arc::clone(executor);
    let semaphore = Arc::clone(semaphore);
    let tx = tx.clone();

    statuses.insert(idx, NodeStatus::Running);
    start_times.insert(idx, Instant::now());
    debug!(name = %name, "node scheduled");

    tokio::spawn(async move {
        let _permit = semaphore.acquire().await.expect("semaphore open for walk");

        // A panicking executor must still produce a completion message, or
        // the walk never terminates.
        let result = AssertUnwindSafe(executor(idx, node)).catch_unwind().await;

        let node_result = match result {
            Ok(Ok(output)) => NodeResult {
                node_index: idx,
                name,
                status: NodeStatus::Succeeded,
                output: Some(output),
            },
            Ok(Err(e)) => NodeResult {
                node_index: idx,
                name,
                status: NodeStatus::Failed(e.to_string()),
                output: None,
            },
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "node task panicked".to_string());
                error!(name = %name, message = %message, "node panicked");
                NodeResult {
                    node_index: idx,
                    name,
                    status: NodeStatus::Failed(format!("panic: {message}")),
                    output: None,
                }
            }
        };

        let _ = tx.send(WalkerMessage::NodeCompleted(node_result)).await;
    });
}

/// Collect all transitive dependents of a node (for cascade skip on failure).
fn collect_transitive_dependents(
    start: NodeIndex,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
) -> Vec<NodeIndex> {
    let mut visited = HashSet::new();
    let mut stack = vec![start];

    while let Some(node) = stack.pop() {
        if let Some(deps) = dependents.get(&node) {
            for &dep in deps {
                if visited.insert(dep) {
                    stack.push(dep);
                }
            }
        }
    }

    visited.into_iter().collect()
}
