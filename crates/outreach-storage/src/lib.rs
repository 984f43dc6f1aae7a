//! Outreach Storage - Persistence for the delivery core
//!
//! Repository traits with a PostgreSQL implementation (sqlx) and an
//! in-process implementation sharing one lock across all tables.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
