//! Client-side session management for the storefront.
//!
//! The crate keeps a short-lived access credential alive without the caller
//! noticing: a scheduler renews it before it expires, an interceptor renews
//! and replays requests that come back 401, and every unrecoverable failure
//! ends the session through one idempotent path.
//!
//! Start with [`App`], which wires the pieces together.

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod models;

#[cfg(test)]
mod test_support;

pub use app::App;
pub use config::{Config, StorageKind};
