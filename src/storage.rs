//! Storage subsystem
//!
//! SQLite persistence for the session catalog and per-session files.
//!
//! Components:
//! - `types`: value, column and query types shared by the layer.
//! - `schema`: table descriptions and DDL generation.
//! - `query`: SQL text generation for selects, inserts and updates.
//! - `rotation`: rotation policies and per-table statistics.
//! - `database`: the async database handle with rotated table families.
//! - `session_filter`: helpers to build catalog queries.

pub mod database;
pub mod query;
pub mod rotation;
pub mod schema;
pub mod session_filter;
pub mod types;

pub use database::Database;
pub use rotation::{RotationKind, RotationPolicy};
