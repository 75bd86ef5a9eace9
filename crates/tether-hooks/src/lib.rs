//! # tether-hooks
//!
//! Ordered registries of cancellable callbacks.
//!
//! The server owns one registry per extension point (connection created,
//! message received). Registering returns a [`HookHandle`]; stopping the
//! handle removes the callback, and a callback stopped part-way through a
//! [`HookRegistry::fire_all`] pass is skipped for the rest of that pass.
//!
//! ## Fail-Open
//!
//! A panicking callback is logged and the pass continues with the next one.

#![deny(unsafe_code)]

pub mod registry;

pub use registry::{HookHandle, HookRegistry};
