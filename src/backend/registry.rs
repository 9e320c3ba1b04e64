//! Protocol prototype registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{Backend, Echo, Http, ProcessModel, Protocol};
use crate::log::LogSink;
use crate::types::{BackendConfig, BackendId, Error, Result};

/// Builds a fresh protocol instance for a backend.
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn Protocol> + Send + Sync>;

/// Named protocol prototypes, looked up case-insensitively.
#[derive(Clone, Default)]
pub struct Registry {
    prototypes: BTreeMap<String, ProtocolFactory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("prototypes", &self.prototypes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The prototypes compiled into the engine: `http` and `echo`.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.prototypes.insert(
            "http".to_string(),
            Arc::new(|| Box::new(Http::default()) as Box<dyn Protocol>),
        );
        registry.prototypes.insert(
            "echo".to_string(),
            Arc::new(|| Box::new(Echo::default()) as Box<dyn Protocol>),
        );
        registry
    }

    /// Add a prototype. A name may be registered once.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Protocol> + Send + Sync + 'static,
    {
        let key = name.to_ascii_lowercase();
        if self.prototypes.contains_key(&key) {
            return Err(Error::config(format!("prototype [{}] already registered", name)));
        }
        self.prototypes.insert(key, Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prototypes.contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.prototypes.keys().map(String::as_str)
    }

    /// Instantiate the prototype named by `config.proto` and run its `init`.
    ///
    /// `default_model` applies when the backend sets no model of its own.
    pub fn create(
        &self,
        id: BackendId,
        name: &str,
        config: &BackendConfig,
        default_model: ProcessModel,
    ) -> Result<Backend> {
        let factory = self
            .prototypes
            .get(&config.proto.to_ascii_lowercase())
            .ok_or_else(|| Error::not_found(format!("backend prototype [{}]", config.proto)))?;

        let model = match &config.model {
            Some(m) => m.parse()?,
            None => default_model,
        };
        let log = config.log.as_ref().map(LogSink::open).transpose()?;

        let mut protocol = factory();
        protocol.init(name, config)?;

        tracing::debug!(backend = name, id = %id, proto = %config.proto, model = %model, "backend created");
        Ok(Backend::new(id, name, model, config.clone(), log, protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Refusing;

    impl Protocol for Refusing {
        fn init(&mut self, name: &str, _config: &BackendConfig) -> Result<()> {
            Err(Error::config(format!("{} refuses to start", name)))
        }

        fn serve(&mut self, _conn: &mut Connection<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = Registry::builtin();
        let config = BackendConfig::new("HTTP", "127.0.0.1:0");
        let backend = registry
            .create(BackendId::new(0), "www", &config, ProcessModel::Fork)
            .unwrap();
        assert_eq!(backend.name(), "www");
        assert_eq!(backend.model(), ProcessModel::Fork);
        assert!(registry.contains("Echo"));
    }

    #[test]
    fn unknown_prototype_is_not_found() {
        let registry = Registry::builtin();
        let config = BackendConfig::new("gopher", "127.0.0.1:0");
        let err = registry
            .create(BackendId::new(0), "old", &config, ProcessModel::Fork)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn backend_model_overrides_default() {
        let registry = Registry::builtin();
        let mut config = BackendConfig::new("echo", "127.0.0.1:0");
        config.model = Some("Prefork".to_string());
        let backend = registry
            .create(BackendId::new(3), "echo", &config, ProcessModel::Iterative)
            .unwrap();
        assert_eq!(backend.model(), ProcessModel::Prefork);
        assert_eq!(backend.id(), BackendId::new(3));

        config.model = Some("threads".to_string());
        assert!(registry
            .create(BackendId::new(3), "echo", &config, ProcessModel::Iterative)
            .unwrap_err()
            .is_config());
    }

    #[test]
    fn failing_init_surfaces_its_error() {
        let mut registry = Registry::new();
        registry
            .register("refusing", || Box::new(Refusing) as Box<dyn Protocol>)
            .unwrap();
        let config = BackendConfig::new("refusing", "127.0.0.1:0");
        let err = registry
            .create(BackendId::new(0), "nope", &config, ProcessModel::Fork)
            .unwrap_err();
        assert!(err.to_string().contains("nope refuses to start"));
    }

    #[test]
    fn registered_factories_build_fresh_instances() {
        static BUILT: AtomicUsize = AtomicUsize::new(0);
        let mut registry = Registry::new();
        registry
            .register("counted", || {
                BUILT.fetch_add(1, Ordering::SeqCst);
                Box::new(Echo::default()) as Box<dyn Protocol>
            })
            .unwrap();
        assert!(registry
            .register("COUNTED", || Box::new(Echo::default()) as Box<dyn Protocol>)
            .is_err());

        let config = BackendConfig::new("counted", "127.0.0.1:0");
        for id in 0..2 {
            registry
                .create(BackendId::new(id), "c", &config, ProcessModel::Fork)
                .unwrap();
        }
        assert_eq!(BUILT.load(Ordering::SeqCst), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["counted"]);
    }
}
