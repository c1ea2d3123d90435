use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::resolve::{self, ResolvedValues};
use crate::template::types::Template;

use super::resource_graph::{DeploymentGraph, GraphNode};

/// The graph after condition evaluation and variant selection: disabled
/// nodes removed, every slot collapsed to its single active member.
#[derive(Debug)]
pub struct SelectedGraph {
    pub graph: DeploymentGraph,
    pub node_map: HashMap<String, NodeIndex>,
    /// Slot role -> name of the selected member. References through
    /// `slot.<role>` are resolved against this map from here on.
    pub slot_aliases: BTreeMap<String, String>,
    /// Names removed because their condition evaluated false.
    pub disabled: Vec<String>,
    /// Names removed because every one of their dependencies was disabled.
    pub unreachable: Vec<String>,
}

/// Evaluate each node's condition against resolved values and prune the
/// graph.
///
/// Slot members must partition the input space: for any given parameter
/// binding exactly one member of each slot is active, otherwise the template
/// is inconsistent and selection fails before any provider call.
///
/// A node whose dependencies were all disabled has nothing left to build on
/// and is pruned as well; nodes with at least one surviving dependency (or
/// none at all) stay.
pub fn select_variants(
    template: &Template,
    raw: &DeploymentGraph,
    values: &ResolvedValues,
) -> Result<SelectedGraph> {
    let ctx = values.eval_context();

    // Condition pass.
    let mut removed: HashSet<NodeIndex> = HashSet::new();
    let mut disabled = Vec::new();
    for idx in raw.node_indices() {
        let node = &raw[idx];
        if let Some(cond) = &node.decl.condition {
            if !resolve::truthy(&resolve::evaluate(cond, &ctx)?) {
                removed.insert(idx);
                disabled.push(node.name.clone());
            }
        }
    }

    // Slot collapse: exactly one active member per role.
    let mut slot_aliases = BTreeMap::new();
    for role in template.slot_roles() {
        let active: Vec<&GraphNode> = raw
            .node_indices()
            .filter(|idx| !removed.contains(idx))
            .map(|idx| &raw[idx])
            .filter(|n| n.decl.slot.as_deref() == Some(role))
            .collect();
        if active.len() != 1 {
            return Err(EngineError::VariantSelection {
                slot: role.to_string(),
                active: active.len(),
            });
        }
        debug!(slot = role, selected = %active[0].name, "variant selected");
        slot_aliases.insert(role.to_string(), active[0].name.clone());
    }

    // Cascade: a node all of whose dependencies were removed cannot be
    // satisfied and is never scheduled.
    let mut unreachable = Vec::new();
    loop {
        let mut changed = false;
        for idx in raw.node_indices() {
            if removed.contains(&idx) {
                continue;
            }
            let deps: Vec<NodeIndex> = raw.neighbors_directed(idx, Direction::Incoming).collect();
            if !deps.is_empty() && deps.iter().all(|dep| removed.contains(dep)) {
                removed.insert(idx);
                unreachable.push(raw[idx].name.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Rebuild the graph without removed nodes; edges touching a removed
    // node are dropped, never followed.
    let mut graph = DiGraph::new();
    let mut node_map = HashMap::new();
    let mut idx_map: HashMap<NodeIndex, NodeIndex> = HashMap::new();

    for idx in raw.node_indices() {
        if removed.contains(&idx) {
            continue;
        }
        let new_idx = graph.add_node(raw[idx].clone());
        node_map.insert(raw[idx].name.clone(), new_idx);
        idx_map.insert(idx, new_idx);
    }
    for edge in raw.edge_indices() {
        if let Some((from, to)) = raw.edge_endpoints(edge) {
            if let (Some(&new_from), Some(&new_to)) = (idx_map.get(&from), idx_map.get(&to)) {
                graph.add_edge(new_from, new_to, raw[edge].clone());
            }
        }
    }

    Ok(SelectedGraph {
        graph,
        node_map,
        slot_aliases,
        disabled,
        unreachable,
    })
}
