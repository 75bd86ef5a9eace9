//! # tether-core
//!
//! Foundation types for the Tether real-time server:
//! - [`ids`]: branded connection / subscription / call identifiers
//! - [`messages`]: the `msg`-tagged JSON wire protocol
//! - [`errors`]: the `NotFound` / `Application` / `Internal` / `Protocol` taxonomy
//! - [`random`]: seeded random streams for deterministic side effects
//! - [`logging`]: tracing subscriber bootstrap

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod random;

pub use errors::{ErrorBody, MethodError};
pub use ids::{CallId, ConnectionId, SubscriptionId};
pub use messages::{ClientMessage, ServerMessage};
