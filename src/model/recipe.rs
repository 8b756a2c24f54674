//! Cached generation strategies.
//!
//! A bundle holds one recipe per variant slot. It is valid only for the
//! context hash and schema version it was generated under.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::Mode;

/// Bump when the recipe shape or its prompt contract changes.
pub const RECIPE_SCHEMA_VERSION: u32 = 1;

/// Strategy for one variant slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    /// Variant label this recipe drives ("A", "B", ...).
    pub label: String,
    /// Short name of the lens (e.g. "literal", "sonic", "imagistic").
    pub lens: String,
    /// Instruction handed to the translator for this slot.
    pub directive: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeBundle {
    pub schema_version: u32,
    pub mode: Mode,
    pub context_hash: String,
    pub recipes: Vec<Recipe>,
    pub created_at: DateTime<Utc>,
}

impl RecipeBundle {
    pub fn new(mode: Mode, context_hash: impl Into<String>, recipes: Vec<Recipe>) -> Self {
        Self {
            schema_version: RECIPE_SCHEMA_VERSION,
            mode,
            context_hash: context_hash.into(),
            recipes,
            created_at: Utc::now(),
        }
    }

    /// Usable for this context hash under the current schema.
    pub fn is_valid_for(&self, context_hash: &str) -> bool {
        self.schema_version == RECIPE_SCHEMA_VERSION && self.context_hash == context_hash
    }

    pub fn for_label(&self, label: &str) -> Option<&Recipe> {
        self.recipes.iter().find(|r| r.label == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_schema_or_hash_invalidates() {
        let mut bundle = RecipeBundle::new(Mode::Balanced, "abc", Vec::new());
        assert!(bundle.is_valid_for("abc"));
        assert!(!bundle.is_valid_for("def"));

        bundle.schema_version = RECIPE_SCHEMA_VERSION + 1;
        assert!(!bundle.is_valid_for("abc"));
    }
}
