use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;

use super::{ClientDescriptor, ClientId, ListAdapter};
use crate::config::Config;
use crate::error::SyncError;
use crate::model::ListKind;

const DEFAULT_MAX_CONCURRENT: usize = 2;

/// A client together with its adapter and its pass pool.
pub struct RegisteredClient {
    pub descriptor: ClientDescriptor,
    pub adapter: Arc<dyn ListAdapter>,
    /// Bounds concurrent passes so the service's own rate limit holds.
    pub pool: Arc<Semaphore>,
}

/// Every connected service, keyed by client identity.
///
/// Built once at startup and shared read-only with the orchestrator.
#[derive(Default)]
pub struct AdapterRegistry {
    clients: HashMap<ClientId, RegisteredClient>,
    /// Clients from the config whose adapter could not be built
    init_errors: HashMap<ClientId, String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the `[[clients]]` config section.
    ///
    /// `connect` builds the vendor adapter for a descriptor. A client whose
    /// adapter fails to build is left out and remembered in `init_errors`.
    pub fn from_config<F>(config: &Config, mut connect: F) -> Result<Self>
    where
        F: FnMut(&ClientDescriptor) -> Result<Arc<dyn ListAdapter>>,
    {
        let mut registry = Self::new();
        for client in &config.clients {
            let mut descriptor = client.descriptor()?;
            if descriptor.max_concurrent == 0 {
                descriptor.max_concurrent = config.scheduler.default_max_concurrent;
            }
            match connect(&descriptor) {
                Ok(adapter) => registry.register(descriptor, adapter)?,
                Err(e) => {
                    tracing::warn!("Could not connect client {} ({}): {}", descriptor.id, descriptor.name, e);
                    registry.init_errors.insert(descriptor.id, e.to_string());
                }
            }
        }
        Ok(registry)
    }

    /// Add a client. Ids must be non-zero and unique.
    pub fn register(&mut self, descriptor: ClientDescriptor, adapter: Arc<dyn ListAdapter>) -> Result<()> {
        if descriptor.id.get() == 0 {
            return Err(anyhow!("Client id 0 is reserved for the internal database"));
        }
        if self.clients.contains_key(&descriptor.id) {
            return Err(anyhow!("Client {} registered twice", descriptor.id));
        }
        let permits = if descriptor.max_concurrent > 0 {
            descriptor.max_concurrent
        } else {
            DEFAULT_MAX_CONCURRENT
        };
        tracing::debug!(
            "Registered client {} ({}, {}) with {} sync slots",
            descriptor.id,
            descriptor.name,
            descriptor.service,
            permits
        );
        self.clients.insert(
            descriptor.id,
            RegisteredClient {
                descriptor,
                adapter,
                pool: Arc::new(Semaphore::new(permits)),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: ClientId) -> Result<&RegisteredClient, SyncError> {
        self.clients
            .get(&id)
            .ok_or_else(|| SyncError::NotFound(format!("client {}", id)))
    }

    /// Registered client ids, ascending.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Clients able to hold a list of `kind`, ascending.
    pub fn targets_for(&self, kind: ListKind) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.descriptor.capabilities.supports(kind))
            .map(|c| c.descriptor.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn init_errors(&self) -> &HashMap<ClientId, String> {
        &self.init_errors
    }
}
