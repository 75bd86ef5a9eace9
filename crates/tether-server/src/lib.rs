//! # tether-server
//!
//! Server half of a real-time sync protocol.
//!
//! - [`server`]: the composition root; handshake, message routing, hooks
//! - [`connection`]: per-client state with idempotent close and close callbacks
//! - [`context`]: ambient invocation context that follows deferred work
//! - [`methods`] / [`publications`]: named handler registries
//! - [`subscription`]: reactive subscription lifecycle and rerun scheduling
//! - [`reactive`]: tracked inputs that trigger subscription reruns
//! - [`http`] / [`websocket`]: Axum front end and per-socket sessions
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod context;
pub mod health;
pub mod http;
pub mod methods;
pub mod metrics;
pub mod publications;
pub mod reactive;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod subscription;
pub mod transport;
pub mod websocket;

pub use connection::{Connection, ConnectionStatus};
pub use context::{InvocationContext, InvocationKind};
pub use http::HttpServer;
pub use methods::{MethodHandler, MethodRegistry, Methods, Outcome, Params, Reply};
pub use publications::{PublicationRegistry, Publications, PublishHandler};
pub use reactive::{Dependency, ReactiveVar};
pub use server::Server;
pub use subscription::{Subscription, SubscriptionState};
pub use transport::{ChannelTransport, Transport};
