//! Step handler lookup.
//!
//! `HandlerCatalog` is built once by the composition root and shared by
//! every task. `StepHandlerRegistry` narrows it to the steps of one run so
//! a missing handler surfaces before any item is fetched.

use std::collections::HashMap;
use std::sync::Arc;

use taskline_core::{Result, StepDescriptor, StepHandler, TasklineError};

/// Every known step handler, keyed by step name.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!("⚠️ Handler for step '{name}' replaced");
        }
    }

    pub fn with_handler(
        mut self,
        name: impl Into<String>,
        handler: impl StepHandler + 'static,
    ) -> Self {
        self.register(name, Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered step names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("steps", &self.names())
            .finish()
    }
}

/// Handlers of one run's step queue.
pub struct StepHandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepHandlerRegistry {
    /// Fails on the first queued step without a handler.
    pub fn for_run(catalog: &HandlerCatalog, steps: &[StepDescriptor]) -> Result<Self> {
        let mut handlers = HashMap::with_capacity(steps.len());
        for step in steps {
            let handler = catalog
                .get(&step.name)
                .ok_or_else(|| TasklineError::StepNotImplemented(step.name.clone()))?;
            handlers.insert(step.name.clone(), handler);
        }
        Ok(Self { handlers })
    }

    pub fn resolve(&self, step: &StepDescriptor) -> Result<Arc<dyn StepHandler>> {
        self.handlers
            .get(&step.name)
            .cloned()
            .ok_or_else(|| TasklineError::StepNotImplemented(step.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use taskline_core::{StepOutcome, WorkItem};

    struct Echo;

    #[async_trait]
    impl StepHandler for Echo {
        async fn handle(&self, _task: &str, _step: &StepDescriptor, items: Vec<WorkItem>) -> StepOutcome {
            StepOutcome::Completed(items)
        }
    }

    #[test]
    fn test_catalog_names_sorted() {
        let catalog = HandlerCatalog::new()
            .with_handler("Load", Echo)
            .with_handler("Extract", Echo);
        assert_eq!(catalog.names(), vec!["Extract", "Load"]);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_for_run_requires_every_step() {
        let catalog = HandlerCatalog::new().with_handler("Extract", Echo);
        let steps = vec![StepDescriptor::new(1, "Extract"), StepDescriptor::new(2, "Load")];

        let err = StepHandlerRegistry::for_run(&catalog, &steps).err().unwrap();
        assert_eq!(err.to_string(), "step 'Load' is not implemented");

        let registry = StepHandlerRegistry::for_run(&catalog, &steps[..1]).unwrap();
        assert!(registry.resolve(&steps[0]).is_ok());
        assert!(registry.resolve(&steps[1]).is_err());
    }
}
