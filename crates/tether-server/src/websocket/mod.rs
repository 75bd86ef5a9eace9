//! WebSocket transport: one session task per upgraded socket.

pub mod session;

pub use session::{SessionSettings, run_ws_session};
