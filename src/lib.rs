//! # Marketplace Sync Library
//!
//! Resumable, rate-limit aware synchronization of a paginated marketplace API into a
//! document store, plus the HTTP control surface that drives it.

pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod handlers;
pub mod marketplace;
pub mod models;
pub mod repositories;
pub mod server;
pub mod sync;
pub mod telemetry;
pub use migration;
