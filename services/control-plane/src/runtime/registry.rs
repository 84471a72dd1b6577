//! Runtime registry: backend discriminator -> constructed runtime
//!
//! Populated once at startup through [`RegistryBuilder`], then frozen. The frozen
//! registry is a plain map behind an `Arc`, so lookups need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::Runtime;
use crate::config::BackendsConfig;
use crate::error::RuntimeError;

/// Builds a runtime from the backend section of the settings.
///
/// `Ok(None)` means the backend is disabled by configuration.
pub type RuntimeConstructor =
    Box<dyn FnOnce(&BackendsConfig) -> Result<Option<Arc<dyn Runtime>>, RuntimeError> + Send>;

#[derive(Default)]
pub struct RegistryBuilder {
    constructors: Vec<(String, RuntimeConstructor)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under a discriminator. A later registration for the
    /// same discriminator replaces the earlier one.
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F) -> &mut Self
    where
        F: FnOnce(&BackendsConfig) -> Result<Option<Arc<dyn Runtime>>, RuntimeError> + Send + 'static,
    {
        let kind = kind.into();
        self.constructors.retain(|(k, _)| *k != kind);
        self.constructors.push((kind, Box::new(constructor)));
        self
    }

    /// Register an already constructed runtime
    pub fn register_runtime(&mut self, runtime: Arc<dyn Runtime>) -> &mut Self {
        let kind = runtime.kind();
        self.register(kind, move |_| Ok(Some(runtime)))
    }

    /// Run every constructor and freeze the result.
    ///
    /// A failing constructor is logged and its backend left out; the process keeps
    /// serving the backends that did come up.
    pub fn build(self, config: &BackendsConfig) -> RuntimeRegistry {
        let mut runtimes: HashMap<String, Arc<dyn Runtime>> = HashMap::new();

        for (kind, constructor) in self.constructors {
            match constructor(config) {
                Ok(Some(runtime)) => {
                    info!(backend = %kind, "runtime backend registered");
                    runtimes.insert(kind, runtime);
                }
                Ok(None) => {
                    info!(backend = %kind, "runtime backend disabled by configuration");
                }
                Err(e) => {
                    warn!(backend = %kind, error = %e, "runtime backend failed to initialize");
                }
            }
        }

        RuntimeRegistry { runtimes }
    }
}

/// Immutable lookup table shared by the monitor, the proxy and the API handlers
pub struct RuntimeRegistry {
    runtimes: HashMap<String, Arc<dyn Runtime>>,
}

impl RuntimeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Runtime>> {
        self.runtimes.get(kind).cloned()
    }

    /// Like [`get`](Self::get) but as an error suitable for propagation
    pub fn require(&self, kind: &str) -> Result<Arc<dyn Runtime>, RuntimeError> {
        self.get(kind)
            .ok_or_else(|| RuntimeError::Unsupported(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.runtimes.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateSpec, Endpoint, RuntimeHandle, StatusSnapshot};
    use async_trait::async_trait;

    struct NamedRuntime(&'static str);

    #[async_trait]
    impl Runtime for NamedRuntime {
        fn kind(&self) -> &'static str {
            self.0
        }
        async fn create(&self, _: &str, _: &CreateSpec) -> Result<RuntimeHandle, RuntimeError> {
            Ok(RuntimeHandle::new(format!("{}-1", self.0)))
        }
        async fn start(&self, _: &RuntimeHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn stop(&self, _: &RuntimeHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn restart(&self, _: &RuntimeHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn inspect(&self, h: &RuntimeHandle) -> Result<StatusSnapshot, RuntimeError> {
            Ok(StatusSnapshot::for_handle(h))
        }
        async fn resolve_endpoint(&self, _: &RuntimeHandle) -> Result<Option<Endpoint>, RuntimeError> {
            Ok(None)
        }
    }

    #[test]
    fn test_lookup_by_discriminator() {
        let mut builder = RuntimeRegistry::builder();
        builder
            .register_runtime(Arc::new(NamedRuntime("alpha")))
            .register_runtime(Arc::new(NamedRuntime("beta")));
        let registry = builder.build(&BackendsConfig::default());

        assert_eq!(registry.kinds(), vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(registry.get("beta").unwrap().kind(), "beta");
        assert!(registry.get("gamma").is_none());
        assert!(matches!(registry.require("gamma"), Err(RuntimeError::Unsupported(_))));
    }

    #[test]
    fn test_failed_and_disabled_constructors_are_skipped() {
        let mut builder = RuntimeRegistry::builder();
        builder
            .register("broken", |_| Err(RuntimeError::Provision("no api url".into())))
            .register("off", |_| Ok(None))
            .register_runtime(Arc::new(NamedRuntime("ok")));
        let registry = builder.build(&BackendsConfig::default());

        assert_eq!(registry.kinds(), vec!["ok".to_string()]);
    }

    #[test]
    fn test_builtin_backends_register_themselves() {
        let mut builder = RuntimeRegistry::builder();
        super::super::register_builtin_backends(&mut builder);
        // cluster backend stays out without an API server URL
        let registry = builder.build(&BackendsConfig::default());

        assert!(registry.get(crate::runtime::local::BACKEND).is_some());
        assert!(registry.get(crate::runtime::container::BACKEND).is_some());
        assert!(registry.get(crate::runtime::cluster::BACKEND).is_none());
    }

    #[test]
    fn test_coordinated_replicas_skip_local_backend() {
        let mut settings = crate::config::Settings::default();
        settings.coordination.endpoints = vec!["redis://10.0.0.1:6379".into()];

        let mut builder = RuntimeRegistry::builder();
        super::super::register_builtin_backends(&mut builder);
        let registry = builder.build(&settings.effective_backends());

        assert!(registry.get(crate::runtime::local::BACKEND).is_none());
        assert!(registry.get(crate::runtime::container::BACKEND).is_some());
    }

    #[test]
    fn test_registry_is_shareable_across_threads() {
        let mut builder = RuntimeRegistry::builder();
        builder.register_runtime(Arc::new(NamedRuntime("alpha")));
        let registry = Arc::new(builder.build(&BackendsConfig::default()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get("alpha").is_some())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
