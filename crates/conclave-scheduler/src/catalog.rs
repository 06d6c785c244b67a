//! Model catalog.
//!
//! Immutable lookup of model name to category and concurrency cost. The
//! catalog is supplied by configuration and never changes after construction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A class of models sharing one concurrency budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    /// Large models, typically one or two at a time per GPU pool.
    Large,
    /// Mid-sized models.
    Medium,
    /// Small models with generous concurrency.
    Small,
}

impl ModelCategory {
    /// Every category, in admission scan order.
    pub const ALL: [Self; 3] = [Self::Large, Self::Medium, Self::Small];

    /// Returns the configuration key for this category.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Large => "large",
            Self::Medium => "medium",
            Self::Small => "small",
        }
    }
}

impl fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable catalog entry for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model name as used by callers.
    pub name: String,
    /// Category whose budget this model draws from.
    pub category: ModelCategory,
    /// Capacity units consumed by one held slot.
    #[serde(default = "default_cost")]
    pub concurrency_cost: u32,
}

fn default_cost() -> u32 {
    1
}

impl ModelDescriptor {
    /// Creates a descriptor with a cost of one unit.
    #[must_use]
    pub fn new(name: impl Into<String>, category: ModelCategory) -> Self {
        Self { name: name.into(), category, concurrency_cost: 1 }
    }

    /// Sets the concurrency cost.
    #[must_use]
    pub fn with_cost(mut self, concurrency_cost: u32) -> Self {
        self.concurrency_cost = concurrency_cost;
        self
    }
}

/// Lookup table of known models.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelDescriptor>,
}

impl ModelCatalog {
    /// Builds a catalog from descriptors. Later duplicates replace earlier ones.
    #[must_use]
    pub fn new(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let models = descriptors.into_iter().map(|d| (d.name.clone(), d)).collect();
        Self { models }
    }

    /// Looks up a model by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.get(name)
    }

    /// Returns the category of a model, if known.
    #[must_use]
    pub fn category_of(&self, name: &str) -> Option<ModelCategory> {
        self.models.get(name).map(|d| d.category)
    }

    /// Number of models in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the catalog has no models.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Descriptors sorted by category, then name.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&ModelDescriptor> {
        let mut all: Vec<_> = self.models.values().collect();
        all.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.name.cmp(&b.name)));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_lookup() {
        let catalog = ModelCatalog::new([
            ModelDescriptor::new("llama-70b", ModelCategory::Large),
            ModelDescriptor::new("phi-3", ModelCategory::Small).with_cost(2),
        ]);

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.category_of("llama-70b"), Some(ModelCategory::Large));
        assert_eq!(catalog.get("phi-3").map(|d| d.concurrency_cost), Some(2));
        assert_eq!(catalog.category_of("missing"), None);
    }

    #[test]
    fn test_descriptors_sorted() {
        let catalog = ModelCatalog::new([
            ModelDescriptor::new("b-small", ModelCategory::Small),
            ModelDescriptor::new("a-small", ModelCategory::Small),
            ModelDescriptor::new("z-large", ModelCategory::Large),
        ]);

        let names: Vec<_> = catalog.descriptors().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["z-large", "a-small", "b-small"]);
    }

    #[test]
    fn test_category_serde() {
        let json = serde_json::to_string(&ModelCategory::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
        let parsed: ModelCategory = serde_json::from_str("\"large\"").unwrap();
        assert_eq!(parsed, ModelCategory::Large);
    }
}
