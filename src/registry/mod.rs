//! # Registry
//!
//! Lookup of activity kinds by handler id.

pub mod handler_registry;

pub use handler_registry::HandlerRegistry;
