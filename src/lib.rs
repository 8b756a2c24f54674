//! # stanza-rs
//!
//! Background engine that translates a poem into several sibling variants
//! per line.
//!
//! A job is one versioned document advanced by repeated ticks. Each tick
//! runs a bounded number of chunks in parallel under a time budget, gates
//! every line's variants for mutual distinctness (salvaging the worst one at
//! most once), and writes back with compare-and-swap. Postgres (sqlx) and
//! in-memory backends are provided; model calls go through rig-core.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod llm;
pub mod lock;
pub mod model;
pub mod quality;
pub mod recipe;
pub mod store;
pub mod telemetry;
