//! Registry of deployed components.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use container_core::error::{RegistryError, Result};

use crate::factory::ComponentFactory;

/// Deployed components by name.
#[derive(Default)]
pub struct ComponentRegistry {
    components: DashMap<String, Arc<dyn ComponentFactory>>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component under its name.
    pub fn register(&self, factory: Arc<dyn ComponentFactory>) -> Result<()> {
        let name = factory.name().to_string();
        match self.components.entry(name.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(name).into()),
            Entry::Vacant(entry) => {
                entry.insert(factory);
                info!(component = %name, "Registered component");
                Ok(())
            }
        }
    }

    /// Unregister the component called `name`.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn ComponentFactory>> {
        match self.components.remove(name) {
            Some((_, factory)) => {
                info!(component = %name, "Unregistered component");
                Ok(factory)
            }
            None => Err(RegistryError::NotFound(name.to_string()).into()),
        }
    }

    /// Unregister `factory` if it is the one registered under its name.
    pub fn unregister_factory(&self, factory: &Arc<dyn ComponentFactory>) -> Result<()> {
        let name = factory.name();
        if self
            .components
            .remove_if(name, |_, registered| Arc::ptr_eq(registered, factory))
            .is_some()
        {
            info!(component = %name, "Unregistered component");
            return Ok(());
        }
        Err(RegistryError::NotFound(name.to_string()).into())
    }

    /// Look up a component.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ComponentFactory>> {
        self.components.get(name).map(|c| c.value().clone())
    }

    /// Names of all registered components, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.components.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
