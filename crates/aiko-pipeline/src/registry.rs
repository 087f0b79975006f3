//! Element factory registry.
//!
//! `deploy.local.module` + `class_name` resolve to a factory registered
//! here, the statically-compiled rendition of dynamic module loading.
//! Unknown pairs fail pipeline startup with a diagnostic naming the missing
//! symbol.

use std::collections::HashMap;

use crate::definition::ElementDefinition;
use crate::element::PipelineElement;
use crate::error::{PipelineError, Result};

/// Factory producing one element kind from its definition.
pub trait ElementFactory: Send + Sync {
    fn create(&self, definition: &ElementDefinition) -> Result<Box<dyn PipelineElement>>;
}

impl<F> ElementFactory for F
where
    F: Fn(&ElementDefinition) -> Result<Box<dyn PipelineElement>> + Send + Sync,
{
    fn create(&self, definition: &ElementDefinition) -> Result<Box<dyn PipelineElement>> {
        self(definition)
    }
}

// ── ElementRegistry ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ElementRegistry {
    factories: HashMap<String, Box<dyn ElementFactory>>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the bundled elements.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::elements::register_builtins(&mut registry);
        registry
    }

    fn key(module: &str, class_name: &str) -> String {
        format!("{module}.{class_name}")
    }

    pub fn register<F: ElementFactory + 'static>(
        &mut self,
        module: &str,
        class_name: &str,
        factory: F,
    ) {
        self.factories
            .insert(Self::key(module, class_name), Box::new(factory));
    }

    pub fn contains(&self, module: &str, class_name: &str) -> bool {
        self.factories.contains_key(&Self::key(module, class_name))
    }

    /// Instantiate a local element, or fail with the missing symbol named.
    pub fn create(
        &self,
        module: &str,
        class_name: &str,
        definition: &ElementDefinition,
    ) -> Result<Box<dyn PipelineElement>> {
        let factory =
            self.factories
                .get(&Self::key(module, class_name))
                .ok_or_else(|| PipelineError::Load {
                    element: definition.name.clone(),
                    module: module.to_string(),
                    class_name: class_name.to_string(),
                    problem: "found".into(),
                })?;
        factory.create(definition).map_err(|e| match e {
            load @ PipelineError::Load { .. } => load,
            other => PipelineError::Load {
                element: definition.name.clone(),
                module: module.to_string(),
                class_name: class_name.to_string(),
                problem: format!("loaded: {other}"),
            },
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
