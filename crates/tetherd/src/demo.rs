//! Built-in handlers so a bare `tetherd` has something to talk to.

use std::time::Duration;

use serde_json::{Value, json};
use tether_core::MethodError;
use tether_server::{Methods, Outcome, Params, Publications, Reply, Server};

/// Longest delay `sleep` accepts.
const MAX_SLEEP_MS: u64 = 10_000;

/// Register the built-in methods and publications on `server`.
pub fn register(server: &Server) {
    server.register_methods(
        Methods::new()
            .method("echo", |_, params: Params| Reply::ok(Value::Array(params)))
            .method("whoami", |ctx, _| {
                Reply::ok(json!({
                    "connection": ctx.connection().map(|c| c.id().to_string()),
                    "userId": ctx.user_id(),
                }))
            })
            .method("setUserId", |ctx, params: Params| -> Outcome {
                let user_id = match params.first() {
                    None | Some(Value::Null) => None,
                    Some(Value::String(id)) => Some(id.clone()),
                    Some(_) => return Err(MethodError::invalid_params("userId must be a string or null")),
                };
                ctx.set_user_id(user_id)?;
                Ok(Value::Null)
            })
            .async_method("sleep", |_, params| async move {
                let ms = params
                    .first()
                    .and_then(Value::as_u64)
                    .ok_or_else(|| MethodError::invalid_params("expected a delay in milliseconds"))?
                    .min(MAX_SLEEP_MS);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }),
    );

    server.register_publications(
        Publications::new()
            // Reruns whenever the connection's user id changes.
            .publication("currentUser", |ctx, _| {
                tracing::debug!(user_id = ?ctx.user_id(), "currentUser run");
                ctx.ready();
            })
            .publication("loggedIn", |ctx, _| {
                if ctx.user_id().is_some() {
                    ctx.ready();
                } else {
                    ctx.error(MethodError::application_with_reason("not-authorized", "log in first"));
                }
            }),
    );
}
