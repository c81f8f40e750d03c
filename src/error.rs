//! Contains the `Error` and `Result` types that `mongodb-livedata` uses.

use std::fmt;

use bson::Bson;
use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// The `errorType` tag client-safe errors carry on the wire.
const CLIENT_ERROR_TYPE: &str = "Meteor.Error";

/// The result type for all methods that can return an error in the
/// `mongodb-livedata` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb-livedata` crate. The inner
/// [`ErrorKind`] is boxed to keep the error small; the whole error is
/// cheaply cloneable so it can be broadcast to every waiter of a failed
/// multiplexer.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }

    /// Creates a client-safe error with the given `error` code. These are the
    /// only errors whose contents are sent to clients verbatim, as a method's
    /// `error` result or inside a `nosub` message.
    pub fn client(error: impl Into<ClientErrorCode>) -> Self {
        ErrorKind::Method(ClientError {
            error: error.into(),
            reason: None,
            details: None,
        })
        .into()
    }

    /// Creates a client-safe error with a code and a human-readable reason.
    pub fn client_with_reason(
        error: impl Into<ClientErrorCode>,
        reason: impl Into<String>,
    ) -> Self {
        ErrorKind::Method(ClientError {
            error: error.into(),
            reason: Some(reason.into()),
            details: None,
        })
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        ErrorKind::Protocol {
            reason: reason.into(),
        }
        .into()
    }

    pub(crate) fn stopped(message: impl Into<String>) -> Self {
        ErrorKind::Stopped {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error may be shown to clients as-is.
    pub fn is_client_safe(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Method(_))
    }

    /// The numeric code attached to a store error, if any. Store errors that
    /// carry a code are treated as permanent query errors by the polling
    /// driver; codeless ones are transient and retried.
    pub fn store_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Store { code, .. } => *code,
            _ => None,
        }
    }

    /// The wire representation of this error: client-safe errors verbatim,
    /// everything else replaced by a generic 500. The original error is the
    /// caller's responsibility to log.
    pub(crate) fn to_wire(&self) -> ClientError {
        match self.kind.as_ref() {
            ErrorKind::Method(client_error) => client_error.clone(),
            _ => ClientError {
                error: ClientErrorCode::Code(500),
                reason: Some("Internal server error".to_string()),
                details: None,
            },
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        Self::new(ErrorKind::Method(err))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A method-level error flagged as safe to propagate to clients
    /// verbatim.
    #[error("{0}")]
    Method(ClientError),

    /// An error reported by the document store. A numeric `code` marks the
    /// error as a permanent query error (e.g. a malformed selector).
    #[error("store error: {message}")]
    Store { message: String, code: Option<i32> },

    /// A malformed or out-of-sequence client message.
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    /// An invalid argument was provided to an API method.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The component this operation was submitted to has shut down.
    #[error("{message}")]
    Stopped { message: String },

    /// An internal error occurred.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// A client-visible error: an `error` code (HTTP-like integer or symbolic
/// string), an optional human-readable `reason`, and optional structured
/// `details`. Serialized into `result` and `nosub` messages as
/// `{error, reason?, details?, message, errorType: "Meteor.Error"}`, where
/// `message` is the display rendering and `errorType` tags the error as
/// client-safe.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ClientError {
    /// The error code.
    pub error: ClientErrorCode,

    /// Human-readable summary, suitable for display to end users.
    pub reason: Option<String>,

    /// Machine-readable details.
    pub details: Option<Bson>,
}

impl ClientError {
    /// Attaches structured details to this error.
    pub fn with_details(mut self, details: impl Into<Bson>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl Serialize for ClientError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("ClientError", 5)?;
        state.serialize_field("error", &self.error)?;
        if let Some(reason) = &self.reason {
            state.serialize_field("reason", reason)?;
        }
        if let Some(details) = &self.details {
            state.serialize_field("details", details)?;
        }
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("errorType", CLIENT_ERROR_TYPE)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ClientError {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // `message` and `errorType` are derived on send and ignored here.
        #[derive(Deserialize)]
        struct Wire {
            error: ClientErrorCode,
            #[serde(default)]
            reason: Option<String>,
            #[serde(default)]
            details: Option<Bson>,
        }
        let wire = Wire::deserialize(deserializer)?;
        Ok(ClientError {
            error: wire.error,
            reason: wire.reason,
            details: wire.details,
        })
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} [{}]", reason, self.error),
            None => write!(f, "[{}]", self.error),
        }
    }
}

/// An HTTP-like integer or symbolic string error code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientErrorCode {
    /// An HTTP-like integer code, e.g. `404`.
    Code(i64),
    /// A symbolic string code, e.g. `"not-authorized"`.
    Symbolic(String),
}

impl fmt::Display for ClientErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientErrorCode::Code(code) => write!(f, "{}", code),
            ClientErrorCode::Symbolic(name) => f.write_str(name),
        }
    }
}

impl From<i64> for ClientErrorCode {
    fn from(code: i64) -> Self {
        ClientErrorCode::Code(code)
    }
}

impl From<i32> for ClientErrorCode {
    fn from(code: i32) -> Self {
        ClientErrorCode::Code(code.into())
    }
}

impl From<&str> for ClientErrorCode {
    fn from(name: &str) -> Self {
        ClientErrorCode::Symbolic(name.to_string())
    }
}

impl From<String> for ClientErrorCode {
    fn from(name: String) -> Self {
        ClientErrorCode::Symbolic(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_safe_errors_survive_the_wire() {
        let err = Error::client_with_reason(404, "Subscription not found");
        assert!(err.is_client_safe());
        let wire = err.to_wire();
        assert_eq!(wire.error, ClientErrorCode::Code(404));
        assert_eq!(wire.reason.as_deref(), Some("Subscription not found"));
    }

    #[test]
    fn internal_errors_are_sanitized() {
        let err = Error::internal("connection string leaked in here");
        let wire = err.to_wire();
        assert_eq!(wire.error, ClientErrorCode::Code(500));
        assert_eq!(wire.reason.as_deref(), Some("Internal server error"));
        assert_eq!(wire.details, None);
    }

    #[test]
    fn symbolic_codes_round_trip_as_json() {
        let code: ClientErrorCode = "not-authorized".into();
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"not-authorized\"");
        let back: ClientErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn wire_shape_carries_message_and_error_type() {
        let wire = Error::client_with_reason(403, "Not allowed").to_wire();
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "error": 403,
                "reason": "Not allowed",
                "message": "Not allowed [403]",
                "errorType": "Meteor.Error",
            })
        );

        // Codeless reason: message falls back to the bracketed code alone.
        let bare = Error::client("not-authorized").to_wire();
        let json = serde_json::to_value(&bare).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "error": "not-authorized",
                "message": "[not-authorized]",
                "errorType": "Meteor.Error",
            })
        );

        // The derived fields are regenerated on send, not read back.
        let parsed: ClientError = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, bare);
    }
}
