//! weft-api: Wire model and client for the conversation backend
//!
//! The backend decomposes a query into sub-tasks and only exposes pull-style
//! status snapshots. This crate provides the typed (but lenient) snapshot
//! model and a `Backend` abstraction with an HTTP implementation.

pub mod client;
pub mod error;
mod lenient;
pub mod types;

pub use client::{Backend, HttpBackend, HttpBackendConfig};
pub use error::{Error, Result};
pub use types::*;
