//! Container Runtime - invocation core of the component container
//!
//! This crate integrates pooling, access control, context switching and
//! event dispatch into component factories for stateless, stateful and
//! singleton components, and exposes them through a [`Container`].

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod exceptions;
pub mod factory;
pub mod method;
pub mod registry;
pub mod request;

pub use config::{load_config, save_config, ComponentDescriptor, ContainerConfig};
pub use context::{ContextScope, InvocationContext, InvocationIdScope};
pub use dispatcher::InvocationDispatcher;
pub use events::{
    EventLog, EventRecord, FanoutEventDispatcher, InvocationStats, NoopEventDispatcher,
    TracingEventDispatcher,
};
pub use exceptions::DeclaredApplicationExceptions;
pub use factory::{
    ComponentBuilder, ComponentFactory, ComponentStats, FactoryState, SingletonFactory,
    StatefulFactory, StatelessFactory,
};
pub use method::{BeanRef, Handler, Invocation, MethodDescriptor, MethodResult, MethodTable};
pub use registry::ComponentRegistry;
pub use request::{CallFailure, CallOutcome, CallRequest, CallResponse, FailureKind};

use std::sync::Arc;

use tracing::{info, warn};

use container_core::error::{RegistryError, Result};

#[cfg(feature = "observability")]
use container_observability::{ObservabilityHandle, TracingConfig};

/// The component container.
pub struct Container {
    /// Deployed components.
    registry: Arc<ComponentRegistry>,

    /// Container configuration.
    config: ContainerConfig,

    /// Observability handle.
    #[cfg(feature = "observability")]
    _observability_handle: Option<ObservabilityHandle>,
}

impl Container {
    /// Create a container.
    pub fn new(config: ContainerConfig) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "observability")]
        let observability_handle = if config.enable_observability {
            let tracing_config = TracingConfig {
                service_name: "container".to_string(),
                log_level: config.log_level.clone(),
                enable_file_logging: config.enable_file_logging,
                log_directory: config.log_directory.clone(),
                enable_console_logging: config.enable_console_logging,
                enable_json_format: config.enable_json_format,
            };
            Some(container_observability::init(Some(tracing_config))?)
        } else {
            None
        };

        Ok(Self {
            registry: Arc::new(ComponentRegistry::new()),
            config,
            #[cfg(feature = "observability")]
            _observability_handle: observability_handle,
        })
    }

    /// Get the container configuration.
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Get the component registry.
    pub fn registry(&self) -> Arc<ComponentRegistry> {
        self.registry.clone()
    }

    /// Start building a component with the container's defaults.
    pub fn component<B: Send + 'static>(&self, descriptor: ComponentDescriptor) -> ComponentBuilder<B> {
        ComponentBuilder::new(descriptor).with_config(&self.config)
    }

    /// Start building a component described in the configuration file.
    pub fn configured<B: Send + 'static>(&self, name: &str) -> Result<ComponentBuilder<B>> {
        let descriptor = self
            .config
            .component(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok(self.component(descriptor))
    }

    /// Register and start a component.
    pub fn deploy(&self, factory: Arc<dyn ComponentFactory>) -> Result<()> {
        self.registry.register(factory.clone())?;
        if let Err(err) = factory.start() {
            warn!(component = %factory.name(), error = %err, "Component failed to start");
            self.registry.unregister_factory(&factory)?;
            return Err(err);
        }
        info!(component = %factory.name(), kind = %factory.kind(), "Deployed component");
        Ok(())
    }

    /// Stop and unregister a component.
    pub fn undeploy(&self, name: &str) -> Result<()> {
        let factory = self.registry.unregister(name)?;
        factory.stop()?;
        info!(component = %name, "Undeployed component");
        Ok(())
    }

    /// Call a deployed component.
    pub fn local_call(&self, name: &str, request: CallRequest) -> Result<CallResponse> {
        let factory = self
            .registry
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok(factory.local_call(request))
    }

    /// Names of deployed components.
    pub fn components(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Counters of a deployed component.
    pub fn stats(&self, name: &str) -> Option<ComponentStats> {
        self.registry.get(name).map(|factory| factory.stats())
    }

    /// Destroy idle instances and expire idle sessions of every deployed
    /// component. Returns how many instances were destroyed.
    pub fn cleanup_idle(&self) -> usize {
        let mut destroyed = 0;
        for name in self.registry.names() {
            if let Some(factory) = self.registry.get(&name) {
                destroyed += factory.cleanup_idle();
            }
        }
        if destroyed > 0 {
            info!(destroyed, "Cleaned up idle instances");
        }
        destroyed
    }

    /// Stop and unregister every component.
    pub fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for name in self.registry.names() {
            if let Err(err) = self.undeploy(&name) {
                warn!(component = %name, error = %err, "Failed to undeploy component");
                first_error.get_or_insert(err);
            }
        }
        info!("Container shut down");
        first_error.map_or(Ok(()), Err)
    }
}
