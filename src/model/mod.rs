//! Core data model.
//!
//! A job is one poem-translation request. It owns chunks (stanzas), each of
//! which owns lines; every line ends up with several sibling variants.

pub mod context;
pub mod job;
pub mod recipe;

pub use context::{Mode, TranslationContext};
pub use job::*;
pub use recipe::{RECIPE_SCHEMA_VERSION, Recipe, RecipeBundle};
