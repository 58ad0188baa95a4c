//! The static endpoint registry: the external table of endpoints an operator
//! registered for a component, filtered to the ones marked online.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

#[cfg(test)]
use mockall::automock;

use crate::crd::EndpointAddress;
use crate::error::Result;

/// Read access to registered endpoints.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    /// Addresses currently online for the component id.
    async fn online_endpoints(&self, component_id: &str) -> Result<Vec<EndpointAddress>>;
}

/// In-process registry, for embedding without an external database and for tests.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    online: RwLock<HashMap<String, Vec<EndpointAddress>>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the online endpoints of a component.
    pub fn set_online<I, A>(&self, component_id: impl Into<String>, addresses: I)
    where
        I: IntoIterator<Item = A>,
        A: Into<EndpointAddress>,
    {
        let addresses = addresses.into_iter().map(Into::into).collect();
        self.online.write().insert(component_id.into(), addresses);
    }

    /// Forgets a component.
    pub fn remove(&self, component_id: &str) {
        self.online.write().remove(component_id);
    }
}

#[async_trait]
impl EndpointRegistry for MemoryRegistry {
    async fn online_endpoints(&self, component_id: &str) -> Result<Vec<EndpointAddress>> {
        Ok(self
            .online
            .read()
            .get(component_id)
            .cloned()
            .unwrap_or_default())
    }
}
