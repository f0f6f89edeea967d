//! Invoice processing service.
//!
//! Structure:
//! - [`kernel`] — infrastructure: clock, stores, blob gateway, dispatcher,
//!   rate limiter, worker auth. Trait-injected, fully fakeable.
//! - [`domains::invoices`] — the job aggregate, the lifecycle engine, the
//!   orchestration facade, CSV export, retention.
//! - [`server`] — the axum surface: routes, middleware, app assembly.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::Config;
