//! Phase registry: runtime lookup of phase implementations by phase id.

use std::collections::HashMap;
use std::sync::Arc;

use stagehand_types::phase::PhaseDefinition;

use super::executor::{BoxPhaseExecutor, PhaseExecutor};

type PhaseFactory = Arc<dyn Fn() -> BoxPhaseExecutor + Send + Sync>;

/// Registry of phase implementations, indexed by phase id.
///
/// Holds factories rather than instances so each execution gets a fresh
/// executor with no state carried over from earlier units.
#[derive(Clone, Default)]
pub struct PhaseRegistry {
    factories: HashMap<String, PhaseFactory>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under the given phase id, replacing any previous one.
    pub fn register<F, E>(&mut self, phase_id: impl Into<String>, factory: F)
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: PhaseExecutor + 'static,
    {
        self.factories
            .insert(phase_id.into(), Arc::new(move || BoxPhaseExecutor::new(factory())));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F, E>(mut self, phase_id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: PhaseExecutor + 'static,
    {
        self.register(phase_id, factory);
        self
    }

    /// Build a fresh executor for `phase_id`.
    pub fn create(&self, phase_id: &str) -> Option<BoxPhaseExecutor> {
        self.factories.get(phase_id).map(|factory| factory())
    }

    pub fn contains(&self, phase_id: &str) -> bool {
        self.factories.contains_key(phase_id)
    }

    /// Phase ids from `phases` with no registered implementation.
    pub fn missing<'a>(&self, phases: &'a [PhaseDefinition]) -> Vec<&'a str> {
        phases
            .iter()
            .filter(|p| !self.contains(&p.id))
            .map(|p| p.id.as_str())
            .collect()
    }

    pub fn list_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for PhaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseRegistry")
            .field("phases", &self.list_ids())
            .finish()
    }
}
