use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use petgraph::graph::NodeIndex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::dag::resource_graph::{self, GraphNode};
use crate::dag::variants::{self, SelectedGraph};
use crate::dag::walker::{CancelHandle, DagWalker, NodeExecutor, NodeOutput, NodeStatus};
use crate::error::{EngineError, Result};
use crate::provider::{ProviderResponse, ResourceProvider};
use crate::resolve::{self, EvalContext, ResolvedValues};
use crate::state::backend::StateStore;
use crate::state::models::ResourceRecord;
use crate::template::types::Template;

use super::retry::{with_retry, RetryPolicy};

/// The action taken (or planned) for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAction {
    Create,
    Update,
    NoOp,
    /// Existing resource: state fetched, never created or mutated.
    Read,
}

impl std::fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceAction::Create => write!(f, "+"),
            ResourceAction::Update => write!(f, "~"),
            ResourceAction::NoOp => write!(f, "(no changes)"),
            ResourceAction::Read => write!(f, "<="),
        }
    }
}

// ─── Plan ───────────────────────────────────────────────────────────────────

/// A planned change for a single resource.
#[derive(Debug)]
pub struct PlannedChange {
    pub name: String,
    pub resource_type: String,
    pub action: ResourceAction,
    /// The resource's properties embed references to other resources'
    /// runtime attributes, so the final decision is only known at apply.
    pub known_after_apply: bool,
}

/// Summary of a dry-run plan.
#[derive(Debug)]
pub struct PlanSummary {
    pub changes: Vec<PlannedChange>,
    pub creates: usize,
    pub updates: usize,
    pub no_ops: usize,
    pub reads: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.creates > 0 {
            parts.push(format!("{} to add", self.creates));
        }
        if self.updates > 0 {
            parts.push(format!("{} to change", self.updates));
        }
        if parts.is_empty() {
            write!(f, "No changes.")
        } else {
            write!(f, "Plan: {}.", parts.join(", "))
        }
    }
}

// ─── Apply report ───────────────────────────────────────────────────────────

/// Per-resource terminal status after an apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded { action: ResourceAction },
    /// Condition evaluated false (or every dependency was disabled); the
    /// provider was never contacted.
    SkippedDisabled,
    /// A transitive dependency failed; this node never started.
    SkippedUpstreamFailure { failed_dependency: String },
    Failed { error: String },
    Cancelled,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::Succeeded { .. } => write!(f, "succeeded"),
            OutcomeStatus::SkippedDisabled => write!(f, "skipped-disabled"),
            OutcomeStatus::SkippedUpstreamFailure { .. } => {
                write!(f, "skipped-upstream-failure")
            }
            OutcomeStatus::Failed { .. } => write!(f, "failed"),
            OutcomeStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    pub name: String,
    pub resource_type: String,
    pub status: OutcomeStatus,
}

/// The result of one apply run: per-node outcomes, the observed states of
/// everything that converged, and the slot selections made. Infrastructure
/// is not an atomic transaction: partial success is a first-class result,
/// and the persisted state lets a later apply resume where this one ended.
#[derive(Debug)]
pub struct ApplyReport {
    pub deployment_id: String,
    pub outcomes: Vec<ResourceOutcome>,
    /// Observed state per converged logical resource (succeeded nodes only).
    pub resource_states: BTreeMap<String, serde_json::Value>,
    pub slot_aliases: BTreeMap<String, String>,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub read: usize,
    pub failed: usize,
    pub skipped: usize,
    pub disabled: usize,
    pub cancelled: usize,
    pub elapsed: Duration,
}

impl ApplyReport {
    pub fn outcome(&self, name: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    /// True when every scheduled node converged.
    pub fn succeeded(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.cancelled == 0
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Apply complete! Resources: {} added, {} changed, {} unchanged",
            self.created, self.updated, self.unchanged,
        )?;
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        if self.cancelled > 0 {
            write!(f, ", {} cancelled", self.cancelled)?;
        }
        write!(f, ". Total time: {}.", format_elapsed(self.elapsed.as_secs()))
    }
}

fn format_elapsed(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else {
        let mins = secs / 60;
        let remaining = secs % 60;
        if remaining == 0 {
            format!("{}m", mins)
        } else {
            format!("{}m{}s", mins, remaining)
        }
    }
}

// ─── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub parallelism: usize,
    pub retry: RetryPolicy,
    /// Deadline per provider call attempt; exceeding it counts as a
    /// transient failure toward the retry cap.
    pub node_timeout: Duration,
    pub cancel: CancelHandle,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            parallelism: 10,
            retry: RetryPolicy::default(),
            node_timeout: Duration::from_secs(300),
            cancel: CancelHandle::new(),
        }
    }
}

// ─── Engine ─────────────────────────────────────────────────────────────────

/// The convergence engine: orders resource operations over the pruned
/// dependency graph and drives the provider until real state matches the
/// declared state.
pub struct ApplyEngine {
    provider: Arc<dyn ResourceProvider>,
    state: Arc<dyn StateStore>,
}

impl ApplyEngine {
    pub fn new(provider: Arc<dyn ResourceProvider>, state: Arc<dyn StateStore>) -> Self {
        Self { provider, state }
    }

    /// Dry-run: decide per-node actions against persisted state without any
    /// mutating provider call. Nodes whose properties reference other
    /// resources' runtime attributes cannot be hashed faithfully before
    /// those attributes exist and are reported as known-after-apply.
    pub async fn plan(
        &self,
        template: &Template,
        values: &ResolvedValues,
        deployment_id: &str,
    ) -> Result<PlanSummary> {
        let selected = preflight(template, values)?;
        let order = resource_graph::topological_order(&selected.graph);

        let empty_states = DashMap::new();
        let mut changes = Vec::new();

        for idx in order {
            let node = &selected.graph[idx];
            if node.decl.existing {
                changes.push(PlannedChange {
                    name: node.name.clone(),
                    resource_type: node.resource_type.clone(),
                    action: ResourceAction::Read,
                    known_after_apply: false,
                });
                continue;
            }

            let has_runtime_refs = node_has_resource_refs(node);
            let ctx = EvalContext {
                parameters: &values.parameters,
                variables: &values.variables,
                scope: &values.scope,
                resource_states: Some(&empty_states),
                slot_aliases: Some(&selected.slot_aliases),
            };
            let properties = resolve::evaluate(&node.decl.properties, &ctx)?;
            let hash = property_hash(&properties)?;

            let prior = self.state.get(deployment_id, &node.name).await?;
            let (action, known_after_apply) = match prior {
                None => (ResourceAction::Create, false),
                Some(_) if has_runtime_refs => (ResourceAction::Update, true),
                Some(rec) if rec.property_hash == hash => (ResourceAction::NoOp, false),
                Some(_) => (ResourceAction::Update, false),
            };
            changes.push(PlannedChange {
                name: node.name.clone(),
                resource_type: node.resource_type.clone(),
                action,
                known_after_apply,
            });
        }

        let creates = count_actions(&changes, ResourceAction::Create);
        let updates = count_actions(&changes, ResourceAction::Update);
        let no_ops = count_actions(&changes, ResourceAction::NoOp);
        let reads = count_actions(&changes, ResourceAction::Read);

        Ok(PlanSummary {
            changes,
            creates,
            updates,
            no_ops,
            reads,
        })
    }

    /// Converge the deployment: evaluate pre-flight, walk the pruned graph,
    /// and drive the provider for every scheduled node.
    ///
    /// All pre-flight failures (validation, cycles, dangling references,
    /// variant selection) surface as `Err` before a single provider call.
    /// Node-level failures do not: they land in the report's per-node
    /// outcome list, because a deployment is not an atomic transaction.
    pub async fn apply(
        &self,
        template: &Template,
        values: &ResolvedValues,
        deployment_id: &str,
        options: ApplyOptions,
    ) -> Result<ApplyReport> {
        let selected = preflight(template, values)?;
        info!(
            deployment_id = %deployment_id,
            nodes = selected.graph.node_count(),
            disabled = selected.disabled.len(),
            "starting apply"
        );

        let resource_states: Arc<DashMap<String, serde_json::Value>> = Arc::new(DashMap::new());
        let slot_aliases = Arc::new(selected.slot_aliases.clone());

        let provider = Arc::clone(&self.provider);
        let state = Arc::clone(&self.state);
        let values = Arc::new(values.clone());
        let dep_id = deployment_id.to_string();
        let retry = options.retry;
        let node_timeout = options.node_timeout;

        let executor: NodeExecutor = Box::new(move |_idx: NodeIndex, node: GraphNode| {
            let provider = Arc::clone(&provider);
            let state = Arc::clone(&state);
            let values = Arc::clone(&values);
            let resource_states = Arc::clone(&resource_states);
            let slot_aliases = Arc::clone(&slot_aliases);
            let dep_id = dep_id.clone();

            Box::pin(async move {
                converge_node(
                    node,
                    provider,
                    state,
                    values,
                    resource_states,
                    slot_aliases,
                    dep_id,
                    retry,
                    node_timeout,
                )
                .await
            })
        });

        let walker = DagWalker::new(options.parallelism, options.cancel.clone());
        let start = Instant::now();
        let results = walker.walk(&selected.graph, Arc::new(executor)).await;
        let elapsed = start.elapsed();

        Ok(build_report(
            deployment_id,
            template,
            &selected,
            results,
            elapsed,
        ))
    }
}

/// Build and prune the graph; everything that can fail without a provider
/// call fails here.
fn preflight(template: &Template, values: &ResolvedValues) -> Result<SelectedGraph> {
    let (raw, _node_map) = resource_graph::build_graph(template)?;
    variants::select_variants(template, &raw, values)
}

/// Drive one node through its create / update / no-op / read lifecycle.
#[allow(clippy::too_many_arguments)]
async fn converge_node(
    node: GraphNode,
    provider: Arc<dyn ResourceProvider>,
    state: Arc<dyn StateStore>,
    values: Arc<ResolvedValues>,
    resource_states: Arc<DashMap<String, serde_json::Value>>,
    slot_aliases: Arc<BTreeMap<String, String>>,
    deployment_id: String,
    retry: RetryPolicy,
    node_timeout: Duration,
) -> std::result::Result<NodeOutput, EngineError> {
    let name = node.name.clone();
    let resource_type = node.decl.resource_type.clone();

    // Dependencies have all converged by the time the walker runs this, so
    // every symbolic reference resolves against their observed state.
    let ctx = EvalContext {
        parameters: &values.parameters,
        variables: &values.variables,
        scope: &values.scope,
        resource_states: Some(&resource_states),
        slot_aliases: Some(&slot_aliases),
    };
    let properties = resolve::evaluate(&node.decl.properties, &ctx)?;
    let hash = property_hash(&properties)?;

    if node.decl.existing {
        let response = provider_call(retry, node_timeout, "read", || {
            let provider = Arc::clone(&provider);
            let resource_type = resource_type.clone();
            let name = name.clone();
            async move { provider.read(&resource_type, &name).await }
        })
        .await
        .map_err(|e| EngineError::Provider {
            name: name.clone(),
            source: e,
        })?;
        resource_states.insert(name, response.state.clone());
        return Ok(NodeOutput {
            action: ResourceAction::Read,
            state: response.state,
        });
    }

    let prior = state.get(&deployment_id, &name).await?;
    let (action, response) = match prior {
        None => {
            debug!(name = %name, "no prior identity, creating");
            let response = provider_call(retry, node_timeout, "create", || {
                let provider = Arc::clone(&provider);
                let resource_type = resource_type.clone();
                let name = name.clone();
                let properties = properties.clone();
                async move { provider.create(&resource_type, &name, &properties).await }
            })
            .await
            .map_err(|e| EngineError::Provider {
                name: name.clone(),
                source: e,
            })?;
            (ResourceAction::Create, response)
        }
        Some(record) if record.property_hash == hash => {
            // Converged already; refresh observed attributes for dependents
            // without any mutating call.
            debug!(name = %name, "property hash unchanged, no-op");
            let response = provider_call(retry, node_timeout, "read", || {
                let provider = Arc::clone(&provider);
                let resource_type = resource_type.clone();
                let identity = record.identity.clone();
                async move { provider.read(&resource_type, &identity).await }
            })
            .await
            .map_err(|e| EngineError::Provider {
                name: name.clone(),
                source: e,
            })?;
            (ResourceAction::NoOp, response)
        }
        Some(record) => {
            debug!(name = %name, "property hash changed, updating");
            let response = provider_call(retry, node_timeout, "update", || {
                let provider = Arc::clone(&provider);
                let resource_type = resource_type.clone();
                let identity = record.identity.clone();
                let properties = properties.clone();
                async move { provider.update(&resource_type, &identity, &properties).await }
            })
            .await
            .map_err(|e| EngineError::Provider {
                name: name.clone(),
                source: e,
            })?;
            (ResourceAction::Update, response)
        }
    };

    // Record state only after the provider confirmed the operation. Each
    // node writes its own key and nothing else.
    if action != ResourceAction::NoOp {
        let record = ResourceRecord::new(&name, &resource_type, &response.identity, &hash);
        state.put(&deployment_id, &record).await?;
    }
    resource_states.insert(name, response.state.clone());

    Ok(NodeOutput {
        action,
        state: response.state,
    })
}

/// Wrap a provider call with the per-attempt deadline and retry policy.
async fn provider_call<F, Fut>(
    retry: RetryPolicy,
    node_timeout: Duration,
    operation: &str,
    mut f: F,
) -> std::result::Result<ProviderResponse, crate::error::ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<
        Output = std::result::Result<ProviderResponse, crate::error::ProviderError>,
    >,
{
    with_retry(retry, operation, || {
        let fut = f();
        async move {
            match tokio::time::timeout(node_timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(crate::error::ProviderError::transient(
                    "node deadline exceeded",
                )),
            }
        }
    })
    .await
}

fn build_report(
    deployment_id: &str,
    template: &Template,
    selected: &SelectedGraph,
    results: Vec<crate::dag::walker::NodeResult>,
    elapsed: Duration,
) -> ApplyReport {
    let mut by_name: BTreeMap<String, crate::dag::walker::NodeResult> = results
        .into_iter()
        .map(|r| (r.name.clone(), r))
        .collect();

    let mut outcomes = Vec::new();
    let mut resource_states = BTreeMap::new();
    let (mut created, mut updated, mut unchanged, mut read) = (0, 0, 0, 0);
    let (mut failed, mut skipped, mut disabled, mut cancelled) = (0, 0, 0, 0);

    for decl in &template.resources {
        let status = if selected.disabled.contains(&decl.name)
            || selected.unreachable.contains(&decl.name)
        {
            disabled += 1;
            OutcomeStatus::SkippedDisabled
        } else if let Some(result) = by_name.remove(&decl.name) {
            match result.status {
                NodeStatus::Succeeded => match result.output {
                    Some(output) => {
                        match output.action {
                            ResourceAction::Create => created += 1,
                            ResourceAction::Update => updated += 1,
                            ResourceAction::NoOp => unchanged += 1,
                            ResourceAction::Read => read += 1,
                        }
                        resource_states.insert(decl.name.clone(), output.state);
                        OutcomeStatus::Succeeded {
                            action: output.action,
                        }
                    }
                    None => {
                        failed += 1;
                        OutcomeStatus::Failed {
                            error: "node reported success without output".to_string(),
                        }
                    }
                },
                NodeStatus::Failed(error) => {
                    failed += 1;
                    OutcomeStatus::Failed { error }
                }
                NodeStatus::Skipped { failed_dependency } => {
                    skipped += 1;
                    OutcomeStatus::SkippedUpstreamFailure { failed_dependency }
                }
                NodeStatus::Cancelled => {
                    cancelled += 1;
                    OutcomeStatus::Cancelled
                }
                NodeStatus::Pending | NodeStatus::Running => {
                    // The walker only reports terminal states.
                    cancelled += 1;
                    OutcomeStatus::Cancelled
                }
            }
        } else {
            // Not in the pruned graph and not recorded as disabled: the
            // walk ended before this node was reached.
            cancelled += 1;
            OutcomeStatus::Cancelled
        };

        outcomes.push(ResourceOutcome {
            name: decl.name.clone(),
            resource_type: decl.resource_type.clone(),
            status,
        });
    }

    ApplyReport {
        deployment_id: deployment_id.to_string(),
        outcomes,
        resource_states,
        slot_aliases: selected.slot_aliases.clone(),
        created,
        updated,
        unchanged,
        read,
        failed,
        skipped,
        disabled,
        cancelled,
        elapsed,
    }
}

fn count_actions(changes: &[PlannedChange], action: ResourceAction) -> usize {
    changes.iter().filter(|c| c.action == action).count()
}

/// Does a node's property tree reference any other resource's state?
fn node_has_resource_refs(node: &GraphNode) -> bool {
    node.decl.properties.references().iter().any(|path| {
        !matches!(
            path.first().map(String::as_str),
            Some("parameters") | Some("variables") | None
        )
    })
}

/// Stable hash of a resolved property tree: SHA-256 over a canonical JSON
/// encoding with object keys sorted. Secure parameters were already
/// replaced by secret reference markers during value resolution, so the
/// hash never sees plaintext secrets.
pub fn property_hash(properties: &serde_json::Value) -> Result<String> {
    let mut canonical = String::new();
    canonical_json(properties, &mut canonical)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest))
}

fn canonical_json(value: &serde_json::Value, out: &mut String) -> Result<()> {
    match value {
        serde_json::Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                canonical_json(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_json(item, out)?;
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_hash_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(property_hash(&a).unwrap(), property_hash(&b).unwrap());
    }

    #[test]
    fn property_hash_distinguishes_values() {
        let a = serde_json::json!({"size": "small"});
        let b = serde_json::json!({"size": "large"});
        assert_ne!(property_hash(&a).unwrap(), property_hash(&b).unwrap());
    }

    #[test]
    fn plan_summary_display() {
        let summary = PlanSummary {
            changes: vec![],
            creates: 2,
            updates: 1,
            no_ops: 0,
            reads: 0,
        };
        assert_eq!(summary.to_string(), "Plan: 2 to add, 1 to change.");
    }
}
