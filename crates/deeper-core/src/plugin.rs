//! Plugin contract and the explicitly constructed registry.
//!
//! Plugins self-describe with a stable name and a single declared input
//! kind. The registry is built during startup and frozen into an `Arc`
//! before the engine accepts seeds; there is no process-global mutable
//! plugin table and no self-registration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppError;
use crate::trace::{Trace, TraceKind};

/// A unit of expansion logic: takes a trace of the declared input kind and
/// emits zero or more traces of possibly other kinds.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable identifier. Used as the circuit-breaker key and in metrics.
    fn name(&self) -> &str;

    /// The single trace kind this plugin consumes.
    fn input_kind(&self) -> TraceKind;

    /// Expand one trace into a finite list of new traces.
    async fn expand(&self, trace: &Trace) -> Result<Vec<Trace>, AppError>;
}

/// Ordered plugin registry keyed by input kind.
///
/// Iteration order per kind is registration order and is stable.
#[derive(Default)]
pub struct Registry {
    plugins: HashMap<TraceKind, Vec<Arc<dyn Plugin>>>,
    names: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin to the list for its declared input kind.
    ///
    /// Duplicate plugin names are rejected with [`AppError::DuplicatePlugin`]
    /// regardless of kind, since the name keys the circuit breaker.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), AppError> {
        let name = plugin.name().to_string();
        if self.names.iter().any(|n| n == &name) {
            return Err(AppError::DuplicatePlugin(name));
        }
        self.names.push(name);
        self.plugins
            .entry(plugin.input_kind())
            .or_default()
            .push(plugin);
        Ok(())
    }

    /// Plugins for a kind, in registration order. Empty slice if none.
    pub fn lookup(&self, kind: TraceKind) -> &[Arc<dyn Plugin>] {
        self.plugins.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Plugin names for a kind, in registration order.
    pub fn names_for(&self, kind: TraceKind) -> Vec<String> {
        self.lookup(kind)
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Find a plugin by its stable name.
    pub fn find(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .values()
            .flatten()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Kinds that have at least one plugin, sorted.
    pub fn kinds(&self) -> Vec<TraceKind> {
        let mut kinds: Vec<_> = self.plugins.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Total number of registered plugins.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All registered plugins in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Plugin>> {
        self.names
            .iter()
            .filter_map(|name| self.find(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockPlugin;

    #[test]
    fn test_register_and_lookup_preserves_order() {
        let mut registry = Registry::new();
        registry
            .register(Arc::new(MockPlugin::empty("first", TraceKind::Email)))
            .unwrap();
        registry
            .register(Arc::new(MockPlugin::empty("second", TraceKind::Email)))
            .unwrap();

        assert_eq!(registry.names_for(TraceKind::Email), vec!["first", "second"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected_across_kinds() {
        let mut registry = Registry::new();
        registry
            .register(Arc::new(MockPlugin::empty("dup", TraceKind::Email)))
            .unwrap();

        let err = registry
            .register(Arc::new(MockPlugin::empty("dup", TraceKind::Domain)))
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicatePlugin(name) if name == "dup"));
    }

    #[test]
    fn test_lookup_unknown_kind_is_empty() {
        let registry = Registry::new();
        assert!(registry.lookup(TraceKind::Geolocation).is_empty());
    }

    #[test]
    fn test_find_by_name() {
        let mut registry = Registry::new();
        registry
            .register(Arc::new(MockPlugin::empty("finder", TraceKind::Ip)))
            .unwrap();

        assert!(registry.find("finder").is_some());
        assert!(registry.find("missing").is_none());
    }
}
