//! Error codes and the error type shared by methods and publications.
//!
//! Four kinds of failure exist:
//! - [`MethodError::NotFound`]: unknown method or publication name.
//! - [`MethodError::Application`]: a handler raised a structured error on
//!   purpose. Forwarded to the client verbatim.
//! - [`MethodError::Internal`]: anything else. The client only ever sees a
//!   sanitized body; the detail stays in server logs.
//! - [`MethodError::Protocol`]: malformed inbound message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Error code constants ────────────────────────────────────────────

/// Method name not registered.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Publication name not registered.
pub const PUBLICATION_NOT_FOUND: &str = "PUBLICATION_NOT_FOUND";
/// Unexpected failure inside a handler or continuation.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Malformed or out-of-order inbound message.
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
/// Invalid or missing parameters (raised by application handlers).
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";

/// Reason sent to clients in place of internal error detail.
pub const INTERNAL_REASON: &str = "Internal server error";

/// Error returned by method handlers, publish handlers and the dispatcher.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum MethodError {
    /// Unknown method or publication name.
    #[error("{message}")]
    NotFound {
        /// [`METHOD_NOT_FOUND`] or [`PUBLICATION_NOT_FOUND`].
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// Structured error raised deliberately by application code.
    #[error("{}", application_message(.error, .reason))]
    Application {
        /// Machine-readable error code chosen by the application.
        error: String,
        /// Optional human-readable reason.
        reason: Option<String>,
        /// Optional structured details.
        details: Option<Value>,
    },

    /// Unexpected failure. `message` is for server-side diagnostics only.
    #[error("{message}")]
    Internal {
        /// Full diagnostic detail.
        message: String,
    },

    /// Malformed inbound message.
    #[error("{message}")]
    Protocol {
        /// Description of what is wrong with the message.
        message: String,
    },
}

fn application_message(error: &str, reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!("{reason} [{error}]"),
        None => format!("[{error}]"),
    }
}

impl MethodError {
    /// Unknown method.
    pub fn method_not_found(name: &str) -> Self {
        Self::NotFound {
            code: METHOD_NOT_FOUND.to_owned(),
            message: format!("Method '{name}' not found"),
        }
    }

    /// Unknown publication.
    pub fn publication_not_found(name: &str) -> Self {
        Self::NotFound {
            code: PUBLICATION_NOT_FOUND.to_owned(),
            message: format!("Subscription '{name}' not found"),
        }
    }

    /// Application error with just a code.
    pub fn application(error: impl Into<String>) -> Self {
        Self::Application {
            error: error.into(),
            reason: None,
            details: None,
        }
    }

    /// Application error with a code and a reason.
    pub fn application_with_reason(error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Application {
            error: error.into(),
            reason: Some(reason.into()),
            details: None,
        }
    }

    /// Attach structured details. No effect on non-application errors.
    #[must_use]
    pub fn with_details(mut self, value: Value) -> Self {
        if let Self::Application { details, .. } = &mut self {
            *details = Some(value);
        }
        self
    }

    /// Parameters failed validation.
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::application_with_reason(INVALID_PARAMS, reason)
    }

    /// Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Machine-readable error code for this error.
    pub fn code(&self) -> &str {
        match self {
            Self::NotFound { code, .. } => code,
            Self::Application { error, .. } => error,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::Protocol { .. } => PROTOCOL_ERROR,
        }
    }

    /// Whether this error must be sanitized before reaching a client.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Convert to the client-facing error body.
    ///
    /// Internal errors are replaced by a generic body; their message is
    /// never serialized.
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            Self::Application {
                error,
                reason,
                details,
            } => ErrorBody {
                error: error.clone(),
                reason: reason.clone(),
                message: self.to_string(),
                details: details.clone(),
            },
            Self::Internal { .. } => ErrorBody {
                error: INTERNAL_ERROR.to_owned(),
                reason: Some(INTERNAL_REASON.to_owned()),
                message: application_message(INTERNAL_ERROR, &Some(INTERNAL_REASON.to_owned())),
                details: None,
            },
            Self::NotFound { code, message } => ErrorBody {
                error: code.clone(),
                reason: Some(message.clone()),
                message: application_message(code, &Some(message.clone())),
                details: None,
            },
            Self::Protocol { message } => ErrorBody {
                error: PROTOCOL_ERROR.to_owned(),
                reason: Some(message.clone()),
                message: application_message(PROTOCOL_ERROR, &Some(message.clone())),
                details: None,
            },
        }
    }
}

impl From<anyhow::Error> for MethodError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: format!("{err:#}"),
        }
    }
}

impl From<ErrorBody> for MethodError {
    fn from(body: ErrorBody) -> Self {
        Self::Application {
            error: body.error,
            reason: body.reason,
            details: body.details,
        }
    }
}

/// Structured error body sent over the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub error: String,
    /// Human-readable reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Rendered message (`"reason [error]"` or `"[error]"`).
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}
