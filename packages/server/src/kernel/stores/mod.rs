//! Store implementations.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryJobStore, MemoryLimiterStore};
pub use postgres::{PostgresJobStore, PostgresLimiterStore};
