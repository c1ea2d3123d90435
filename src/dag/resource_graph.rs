use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{EngineError, Result};
use crate::template::types::{ResourceDecl, Template};

/// A node in the resource-level dependency graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub name: String,
    pub resource_type: String,
    pub decl: ResourceDecl,
    /// Position in the template's resource list; used for deterministic
    /// tie-breaking wherever order otherwise would not be defined.
    pub declaration_index: usize,
}

/// The type of dependency between nodes.
#[derive(Debug, Clone)]
pub enum DependencyEdge {
    /// Explicitly declared via `dependsOn`.
    Explicit,
    /// Inferred from a symbolic property reference, tagged with the
    /// requested attribute path (e.g. `["loginServer"]`).
    Reference { attribute_path: Vec<String> },
}

/// The resource-level dependency graph. An edge A -> B means B depends on A
/// (A must converge first).
pub type DeploymentGraph = DiGraph<GraphNode, DependencyEdge>;

/// Build the raw dependency graph from a template: one node per resource
/// declaration, explicit edges from `dependsOn`, implicit edges rewritten
/// from symbolic references inside property trees.
///
/// References to a slot role fan out to every member of that slot; variant
/// selection later prunes all but the active member.
pub fn build_graph(template: &Template) -> Result<(DeploymentGraph, HashMap<String, NodeIndex>)> {
    let mut graph = DiGraph::new();
    let mut node_map: HashMap<String, NodeIndex> = HashMap::new();
    let mut slot_members: HashMap<&str, Vec<NodeIndex>> = HashMap::new();

    for (i, resource) in template.resources.iter().enumerate() {
        let idx = graph.add_node(GraphNode {
            name: resource.name.clone(),
            resource_type: resource.resource_type.clone(),
            decl: resource.clone(),
            declaration_index: i,
        });
        node_map.insert(resource.name.clone(), idx);
        if let Some(slot) = resource.slot.as_deref() {
            slot_members.entry(slot).or_default().push(idx);
        }
    }

    for resource in &template.resources {
        let to_idx = node_map[&resource.name];

        // Explicit dependsOn (a resource name or a slot role).
        for dep in &resource.depends_on {
            let from_indices = resolve_target(dep, &node_map, &slot_members);
            if from_indices.is_empty() {
                return Err(EngineError::DanglingReference {
                    referrer: resource.name.clone(),
                    target: dep.clone(),
                });
            }
            for from_idx in from_indices {
                if from_idx != to_idx {
                    graph.add_edge(from_idx, to_idx, DependencyEdge::Explicit);
                }
            }
        }

        // Implicit edges from symbolic property references.
        for (target, attribute_path) in resource_references(resource) {
            let from_indices = resolve_target(&target, &node_map, &slot_members);
            if from_indices.is_empty() {
                return Err(EngineError::DanglingReference {
                    referrer: resource.name.clone(),
                    target,
                });
            }
            for from_idx in from_indices {
                if from_idx != to_idx {
                    graph.add_edge(
                        from_idx,
                        to_idx,
                        DependencyEdge::Reference {
                            attribute_path: attribute_path.clone(),
                        },
                    );
                }
            }
        }
    }

    if petgraph::algo::is_cyclic_directed(&graph) {
        let name = find_cycle_member(&graph);
        return Err(EngineError::CyclicDefinition { name });
    }

    Ok((graph, node_map))
}

/// Resolve a dependency target to node indices: exact resource name first,
/// then slot role (all members).
fn resolve_target(
    target: &str,
    node_map: &HashMap<String, NodeIndex>,
    slot_members: &HashMap<&str, Vec<NodeIndex>>,
) -> Vec<NodeIndex> {
    if let Some(&idx) = node_map.get(target) {
        return vec![idx];
    }
    slot_members.get(target).cloned().unwrap_or_default()
}

/// Extract `(target, attribute_path)` pairs for every symbolic resource
/// reference in a declaration's properties. Scalar references
/// (`parameters.*`, `variables.*`) carry no graph edge.
fn resource_references(resource: &ResourceDecl) -> Vec<(String, Vec<String>)> {
    let mut refs = Vec::new();
    for path in resource.properties.references() {
        match path.first().map(String::as_str) {
            Some("parameters") | Some("variables") => {}
            Some("slot") => {
                if let Some(role) = path.get(1) {
                    refs.push((role.clone(), path[2..].to_vec()));
                }
            }
            Some("resources") => {
                if let Some(name) = path.get(1) {
                    refs.push((name.clone(), path[2..].to_vec()));
                }
            }
            Some(name) => refs.push((name.to_string(), path[1..].to_vec())),
            None => {}
        }
    }
    refs
}

fn find_cycle_member(graph: &DeploymentGraph) -> String {
    match petgraph::algo::toposort(graph, None) {
        Err(cycle) => graph[cycle.node_id()].name.clone(),
        Ok(_) => String::new(),
    }
}

/// Deterministic topological order: Kahn's algorithm with ties broken by
/// declaration order.
pub fn topological_order(graph: &DeploymentGraph) -> Vec<NodeIndex> {
    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in graph.node_indices() {
        in_degree.insert(idx, 0);
    }
    for edge in graph.edge_indices() {
        if let Some((_, to)) = graph.edge_endpoints(edge) {
            *in_degree.entry(to).or_insert(0) += 1;
        }
    }

    let mut ready: Vec<NodeIndex> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&idx, _)| idx)
        .collect();
    ready.sort_by_key(|&idx| graph[idx].declaration_index);

    let mut order = Vec::with_capacity(graph.node_count());
    while !ready.is_empty() {
        let idx = ready.remove(0);
        order.push(idx);
        for neighbor in graph.neighbors(idx) {
            let deg = in_degree.get_mut(&neighbor).expect("neighbor tracked");
            *deg -= 1;
            if *deg == 0 {
                ready.push(neighbor);
            }
        }
        ready.sort_by_key(|&idx| graph[idx].declaration_index);
    }
    order
}

/// Generate a DOT representation of the graph. Property values are never
/// rendered, so secure markers cannot leak through visualization either.
pub fn to_dot(graph: &DeploymentGraph) -> String {
    let mut dot = String::from("digraph deployment {\n");
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [shape=box, style=filled];\n\n");

    for idx in graph.node_indices() {
        let node = &graph[idx];
        let color = if node.decl.existing {
            "#a8c8d8"
        } else if node.decl.slot.is_some() {
            "#d8c8a8"
        } else {
            "#a8d8a8"
        };
        dot.push_str(&format!(
            "  n{} [label=\"{}\\n{}\", fillcolor=\"{}\"];\n",
            idx.index(),
            node.name,
            node.resource_type,
            color
        ));
    }

    dot.push('\n');

    for edge in graph.edge_indices() {
        if let Some((from, to)) = graph.edge_endpoints(edge) {
            match &graph[edge] {
                DependencyEdge::Explicit => {
                    dot.push_str(&format!("  n{} -> n{};\n", from.index(), to.index()));
                }
                DependencyEdge::Reference { attribute_path } => {
                    dot.push_str(&format!(
                        "  n{} -> n{} [style=dashed, label=\"{}\"];\n",
                        from.index(),
                        to.index(),
                        attribute_path.join(".")
                    ));
                }
            }
        }
    }

    dot.push_str("}\n");
    dot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parser::parse_template;

    fn template(src: &str) -> Template {
        parse_template(src).unwrap()
    }

    #[test]
    fn builds_explicit_and_reference_edges() {
        let t = template(
            r#"{
                "resources": [
                    {"name": "net", "type": "network/vnets", "apiVersion": "1", "properties": {}},
                    {"name": "pg", "type": "db/servers", "apiVersion": "1",
                     "dependsOn": ["net"], "properties": {}},
                    {"name": "app", "type": "app/apps", "apiVersion": "1",
                     "properties": {"dbHost": "${pg.fqdn}"}}
                ]
            }"#,
        );
        let (graph, node_map) = build_graph(&t).unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);

        let order = topological_order(&graph);
        let names: Vec<&str> = order.iter().map(|&i| graph[i].name.as_str()).collect();
        assert_eq!(names, vec!["net", "pg", "app"]);
        assert!(node_map.contains_key("app"));
    }

    #[test]
    fn slot_reference_fans_out_to_all_members() {
        let t = template(
            r#"{
                "parameters": {"flag": {"type": "bool", "defaultValue": true}},
                "resources": [
                    {"name": "a", "type": "t/a", "apiVersion": "1", "slot": "reg",
                     "condition": "${parameters.flag}", "properties": {}},
                    {"name": "b", "type": "t/b", "apiVersion": "1", "slot": "reg",
                     "condition": "${!parameters.flag}", "properties": {}},
                    {"name": "app", "type": "t/app", "apiVersion": "1",
                     "properties": {"image": "${slot.reg.loginServer}"}}
                ]
            }"#,
        );
        let (graph, _) = build_graph(&t).unwrap();
        // One edge from each slot member into the consumer.
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn rejects_reference_to_unknown_resource() {
        let t = template(
            r#"{
                "resources": [
                    {"name": "app", "type": "t/app", "apiVersion": "1",
                     "properties": {"dbHost": "${missing.fqdn}"}}
                ]
            }"#,
        );
        let err = build_graph(&t).unwrap_err();
        assert!(matches!(err, EngineError::DanglingReference { ref target, .. } if target == "missing"));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let t = template(
            r#"{
                "resources": [
                    {"name": "a", "type": "t/a", "apiVersion": "1", "properties": {"x": "${b.id}"}},
                    {"name": "b", "type": "t/b", "apiVersion": "1", "properties": {"x": "${a.id}"}}
                ]
            }"#,
        );
        assert!(matches!(
            build_graph(&t).unwrap_err(),
            EngineError::CyclicDefinition { .. }
        ));
    }

    #[test]
    fn dot_export_names_nodes_but_not_property_values() {
        let t = template(
            r#"{
                "resources": [
                    {"name": "pg", "type": "db/servers", "apiVersion": "1",
                     "properties": {"adminPassword": "supersensitive"}},
                    {"name": "app", "type": "app/apps", "apiVersion": "1",
                     "properties": {"dbHost": "${pg.fqdn}"}}
                ]
            }"#,
        );
        let (graph, _) = build_graph(&t).unwrap();
        let dot = to_dot(&graph);
        assert!(dot.contains("pg"));
        assert!(dot.contains("style=dashed"));
        assert!(!dot.contains("supersensitive"));
    }
}
