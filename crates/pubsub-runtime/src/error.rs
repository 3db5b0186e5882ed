//! Error types for publish/subscribe operations.
//!
//! Every error a provider driver produces is mapped onto the portable
//! [`ErrorCode`] taxonomy and wrapped into a [`PubSubError`] that keeps the
//! original error reachable as its source.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type returned by provider drivers.
pub type DriverError = Box<dyn StdError + Send + Sync + 'static>;

/// Shared, cloneable handle to a provider-originated error.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Provider-independent error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The error could not be classified.
    Unknown,
    /// The addressed resource does not exist.
    NotFound,
    /// The system is not in a state required for the operation.
    FailedPrecondition,
    /// An invariant of the provider or this library was broken.
    Internal,
    /// The operation is not supported by the provider.
    Unimplemented,
    /// The caller lacks permission for the operation.
    PermissionDenied,
    /// A quota or other resource limit was hit.
    ResourceExhausted,
    /// The caller supplied an invalid value.
    InvalidArgument,
    /// The operation was canceled by the caller.
    Canceled,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::NotFound => "NotFound",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::Internal => "Internal",
            Self::Unimplemented => "Unimplemented",
            Self::PermissionDenied => "PermissionDenied",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::InvalidArgument => "InvalidArgument",
            Self::Canceled => "Canceled",
        };
        f.write_str(name)
    }
}

/// Comprehensive error type for all publish/subscribe operations.
///
/// The type is `Clone` so that one batch failure can be handed to every
/// caller waiting on that batch, and so that a handle's permanent error is
/// observed identically by every later call.
#[derive(Debug, Clone, Error)]
pub enum PubSubError {
    /// The caller's cancellation token fired. Never wrapped.
    #[error("operation canceled")]
    Canceled,

    /// A canonical error raised by this library rather than by a provider.
    #[error("pubsub (code={code}): {message}")]
    Canonical { code: ErrorCode, message: String },

    /// A provider-originated error, mapped onto the canonical taxonomy.
    #[error("pubsub (code={code}) {provider}: {source}")]
    Provider {
        code: ErrorCode,
        provider: &'static str,
        source: SharedError,
    },

    /// A metadata key or value is not legal text.
    #[error("invalid message metadata {key:?}: {reason}")]
    InvalidMetadata { key: String, reason: &'static str },

    /// The string handed to a URL opener is not a valid URL.
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// No opener is registered for the URL's scheme.
    #[error("no {kind} provider registered for scheme {scheme:?}")]
    NoProvider { kind: &'static str, scheme: String },

    /// A URL opener rejected the URL.
    #[error("open {kind} {url}: {message}")]
    Open {
        kind: &'static str,
        url: String,
        message: String,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl PubSubError {
    /// Create a canonical error that did not come from a provider.
    pub fn canonical(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Canonical {
            code,
            message: message.into(),
        }
    }

    /// The permanent error a handle reports once it has been shut down.
    pub fn closed(what: &str) -> Self {
        Self::canonical(ErrorCode::FailedPrecondition, format!("{} closed", what))
    }

    /// Wrap a provider error into the canonical taxonomy.
    ///
    /// Errors that already are a [`PubSubError`] (cancellation in particular)
    /// pass through unchanged.
    pub fn wrap(code: ErrorCode, provider: &'static str, err: DriverError) -> Self {
        match err.downcast::<PubSubError>() {
            Ok(already) => *already,
            Err(err) => Self::Provider {
                code,
                provider,
                source: Arc::from(err),
            },
        }
    }

    /// Canonical code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Canceled => ErrorCode::Canceled,
            Self::Canonical { code, .. } | Self::Provider { code, .. } => *code,
            Self::InvalidMetadata { .. } | Self::InvalidUrl { .. } => ErrorCode::InvalidArgument,
            Self::NoProvider { .. } => ErrorCode::NotFound,
            Self::Open { .. } => ErrorCode::InvalidArgument,
            Self::Configuration { .. } => ErrorCode::InvalidArgument,
        }
    }

    /// Check whether this error reports cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// The provider-native error wrapped by this error, if any.
    pub fn provider_cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Provider { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
