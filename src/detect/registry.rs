use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use super::backend::Scorer;

type ScorerFactory = Box<dyn Fn() -> Result<Box<dyn Scorer>> + Send + Sync>;

/// Named scorer factories.
///
/// Scorers are built on demand so that each detector owns its own instance.
pub struct ScorerRegistry {
    factories: BTreeMap<String, ScorerFactory>,
    default_name: Option<String>,
}

impl ScorerRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Register a factory. The first registered scorer becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn Scorer>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Set default scorer by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("scorer '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Build a scorer by name.
    pub fn create(&self, name: &str) -> Result<Box<dyn Scorer>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "scorer '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            )
        })?;
        factory()
    }

    /// Build the default scorer.
    pub fn create_default(&self) -> Result<Box<dyn Scorer>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no scorers registered"))?;
        self.create(name)
    }

    /// List registered scorers.
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for ScorerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
