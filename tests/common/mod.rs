#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use stratus::dag::walker::CancelHandle;
use stratus::error::ProviderError;
use stratus::executor::retry::RetryPolicy;
use stratus::provider::{ProviderResponse, ResourceProvider};
use stratus::state::memory::MemoryStateStore;
use stratus::{ApplyEngine, ApplyOptions, DeploymentScope};

/// Scripted in-memory provider. Created resources get an identity of
/// `id-<name>` and a state that echoes the applied properties plus a few
/// synthesized runtime attributes (fqdn, loginServer, ingressFqdn) derived
/// from the logical name.
pub struct FakeProvider {
    pub create_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub read_calls: AtomicUsize,
    /// Last property tree the provider was asked to apply, per logical name.
    pub applied_props: DashMap<String, serde_json::Value>,
    records: DashMap<String, serde_json::Value>,
    transient_failures: DashMap<String, usize>,
    external: DashMap<String, serde_json::Value>,
    cancel_on_create: DashMap<String, CancelHandle>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            create_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
            applied_props: DashMap::new(),
            records: DashMap::new(),
            transient_failures: DashMap::new(),
            external: DashMap::new(),
            cancel_on_create: DashMap::new(),
        }
    }

    /// Trip the cancel handle from inside the create call for `name`, so
    /// cancellation lands while that node is in flight.
    pub fn cancel_during_create(&self, name: &str, handle: CancelHandle) {
        self.cancel_on_create.insert(name.to_string(), handle);
    }

    /// Script the next `count` create/update calls for `name` to fail
    /// transiently.
    pub fn fail_transient(&self, name: &str, count: usize) {
        self.transient_failures.insert(name.to_string(), count);
    }

    /// Register an externally-managed resource readable by logical name.
    pub fn add_external(&self, name: &str, state: serde_json::Value) {
        self.external.insert(name.to_string(), state);
    }

    pub fn total_mutations(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst) + self.update_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.total_mutations() + self.read_calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self, name: &str) -> Result<(), ProviderError> {
        if let Some(mut remaining) = self.transient_failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::transient("simulated throttling"));
            }
        }
        Ok(())
    }

    fn synth_state(name: &str, identity: &str, properties: &serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "id": identity,
            "name": name,
            "fqdn": format!("{name}.postgres.example"),
            "loginServer": format!("{name}.registry.example.io"),
            "ingressFqdn": format!("{name}.apps.example"),
            "properties": properties,
        })
    }
}

#[async_trait]
impl ResourceProvider for FakeProvider {
    async fn create(
        &self,
        _resource_type: &str,
        name: &str,
        properties: &serde_json::Value,
    ) -> Result<ProviderResponse, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail(name)?;
        if let Some(handle) = self.cancel_on_create.get(name) {
            handle.cancel();
        }
        let identity = format!("id-{name}");
        let state = Self::synth_state(name, &identity, properties);
        self.records.insert(identity.clone(), state.clone());
        self.applied_props
            .insert(name.to_string(), properties.clone());
        Ok(ProviderResponse { identity, state })
    }

    async fn read(
        &self,
        _resource_type: &str,
        reference: &str,
    ) -> Result<ProviderResponse, ProviderError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(state) = self.records.get(reference) {
            return Ok(ProviderResponse {
                identity: reference.to_string(),
                state: state.clone(),
            });
        }
        if let Some(state) = self.external.get(reference) {
            return Ok(ProviderResponse {
                identity: reference.to_string(),
                state: state.clone(),
            });
        }
        Err(ProviderError::terminal(format!(
            "resource '{reference}' not found"
        )))
    }

    async fn update(
        &self,
        _resource_type: &str,
        identity: &str,
        properties: &serde_json::Value,
    ) -> Result<ProviderResponse, ProviderError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let name = identity.strip_prefix("id-").unwrap_or(identity).to_string();
        self.maybe_fail(&name)?;
        let state = Self::synth_state(&name, identity, properties);
        self.records.insert(identity.to_string(), state.clone());
        self.applied_props.insert(name, properties.clone());
        Ok(ProviderResponse {
            identity: identity.to_string(),
            state,
        })
    }
}

pub fn scope() -> DeploymentScope {
    DeploymentScope::new("sub-0000")
}

/// Engine wired to a fresh fake provider and in-memory state store.
pub fn engine() -> (ApplyEngine, Arc<FakeProvider>, Arc<MemoryStateStore>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let provider = Arc::new(FakeProvider::new());
    let store = Arc::new(MemoryStateStore::new());
    let engine = ApplyEngine::new(provider.clone(), store.clone());
    (engine, provider, store)
}

/// Apply options with millisecond backoff so retry tests stay fast.
pub fn fast_options() -> ApplyOptions {
    ApplyOptions {
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
        },
        ..ApplyOptions::default()
    }
}
