//! Registry of resource types.
//!
//! Built once at process start and passed to whoever needs it, so tests can
//! register their own gateways without shared global state.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{GatewayError, LifecycleError};
use crate::resources::{self, ResourceKind};
use crate::state::StackState;

use super::{InMemoryGateway, ResourceGateway, RestClient, RestEndpoint, RestGateway};

/// A resource kind with the gateway that serves it.
#[derive(Clone)]
pub struct RegisteredType {
    kind: ResourceKind,
    gateway: Arc<dyn ResourceGateway>,
}

impl RegisteredType {
    /// Resource kind.
    #[must_use]
    pub const fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Gateway for the kind.
    #[must_use]
    pub fn gateway(&self) -> &dyn ResourceGateway {
        self.gateway.as_ref()
    }
}

impl std::fmt::Debug for RegisteredType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredType")
            .field("kind", &self.kind.name())
            .finish_non_exhaustive()
    }
}

/// Mapping from resource type name to kind and gateway.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    entries: BTreeMap<String, RegisteredType>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registers a kind, replacing any previous registration of the same name.
    pub fn register(&mut self, kind: ResourceKind, gateway: Arc<dyn ResourceGateway>) {
        self.entries
            .insert(kind.name().to_string(), RegisteredType { kind, gateway });
    }

    /// Builder-style [`Self::register`].
    #[must_use]
    pub fn with(mut self, kind: ResourceKind, gateway: Arc<dyn ResourceGateway>) -> Self {
        self.register(kind, gateway);
        self
    }

    /// Registers every kind in `kinds`, asking `gateway_for` for each gateway.
    #[must_use]
    pub fn with_kinds<F>(mut self, kinds: Vec<ResourceKind>, mut gateway_for: F) -> Self
    where
        F: FnMut(&ResourceKind) -> Arc<dyn ResourceGateway>,
    {
        for kind in kinds {
            let gateway = gateway_for(&kind);
            self.register(kind, gateway);
        }
        self
    }

    /// Looks up a resource type.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing is registered under `resource_type`.
    pub fn get(&self, resource_type: &str) -> Result<&RegisteredType, LifecycleError> {
        self.entries
            .get(resource_type)
            .ok_or_else(|| LifecycleError::UnregisteredType {
                resource_type: resource_type.to_string(),
            })
    }

    /// Returns true if `resource_type` is registered.
    #[must_use]
    pub fn contains(&self, resource_type: &str) -> bool {
        self.entries.contains_key(resource_type)
    }

    /// Registered type names in order.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Registers every built-in kind whose service endpoint is configured,
    /// each with a REST gateway authenticated by `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be created.
    pub fn rest(provider: &ProviderConfig, token: &str) -> Result<Self, GatewayError> {
        let mut registry = Self::new();
        for kind in resources::builtin() {
            let Some(endpoint) = RestEndpoint::builtin(kind.name()) else {
                continue;
            };
            let Some(base_url) = provider.endpoint(&endpoint.service) else {
                debug!("No {} endpoint, skipping {}", endpoint.service, kind.name());
                continue;
            };
            let client = RestClient::with_timeout(base_url, provider.request_timeout_secs)?
                .with_token(token);
            let gateway = RestGateway::new(kind.name(), client, endpoint);
            registry.register(kind, Arc::new(gateway));
        }
        Ok(registry)
    }

    /// Registers every built-in kind against an in-memory cloud that already
    /// holds the objects recorded in `state`.
    #[must_use]
    pub fn simulated(state: Option<&StackState>) -> Self {
        Self::new().with_kinds(resources::builtin(), |kind| {
            let gateway = InMemoryGateway::new(kind.name());
            for record in state.iter().flat_map(|s| s.resources.values()) {
                let instance = &record.instance;
                if instance.resource_type != kind.name() {
                    continue;
                }
                if let Some(id) = instance.id() {
                    let status = instance.remote_status.as_deref().unwrap_or("ACTIVE");
                    gateway.insert_object(id, instance.observed.clone(), status);
                }
            }
            Arc::new(gateway) as Arc<dyn ResourceGateway>
        })
    }
}
