//! Quality gate for sibling variants and the bounded salvage loop.

pub mod diversity;
pub mod regenerate;

pub use diversity::{DiversityGate, GateVerdict};
pub use regenerate::{ContrastiveConstraints, Regenerator, Salvage};
