//! Errors raised while acquiring or refreshing credentials

use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

/// An error while attempting to obtain a token
///
/// Errors are cheap to clone so that the outcome of a single fetch can be
/// handed to every caller that was waiting on it.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// A per-resource token was requested without a resource key and no
    /// seeded token is available
    #[error("a resource key is required to obtain a temporary token")]
    MissingResourceKey,

    /// The cached token for a resource expired and fetching is disabled
    #[error("temporary token for `{resource_key}` has expired and fetching new tokens is disabled")]
    TokenExpired {
        /// The resource whose token expired
        resource_key: String,
    },

    /// The authority rejected the request with a non-success status
    #[error("authority rejected the token request with status {status}: {message}")]
    Rejected {
        /// The HTTP status returned by the authority
        status: StatusCode,
        /// The authority's explanation
        message: String,
    },

    /// The ticket exchange reported a non-zero error code
    #[error("sign in failed with error code {code}: {message}")]
    TicketRejected {
        /// The `errcode` reported by the authority
        code: i32,
        /// The `errtext` and `errdetail` reported by the authority
        message: String,
    },

    /// The authority responded successfully but did not provide a usable token
    #[error("authority responded with status {status} but provided no token")]
    EmptyCredential {
        /// The HTTP status returned by the authority
        status: StatusCode,
    },

    /// The password was already used and the resulting session is gone
    #[error("session has expired; a new client must be constructed to sign in again")]
    SessionExpired,

    /// An endpoint URL could not be derived from the configuration
    #[error("unable to derive an endpoint URL from `{base}`")]
    InvalidUrl {
        /// The base the URL was derived from
        base: String,
    },

    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] Arc<reqwest::Error>),

    /// Unable to read the response
    #[error("error reading response body")]
    BodyRead(#[source] Arc<reqwest::Error>),

    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBody(#[source] Arc<serde_json::Error>),

    /// Unable to deserialize the ticket exchange body
    #[error("error deserializing ticket body from authority")]
    TicketBody(#[source] Arc<quick_xml::DeError>),
}

impl AuthError {
    pub(crate) fn request_send(error: reqwest::Error) -> Self {
        Self::RequestSend(Arc::new(error))
    }

    pub(crate) fn body_read(error: reqwest::Error) -> Self {
        Self::BodyRead(Arc::new(error))
    }

    /// Whether the authority refused to issue a token
    ///
    /// Rejections are surfaced as-is; this crate never retries them.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Rejected { .. }
                | Self::TicketRejected { .. }
                | Self::EmptyCredential { .. }
                | Self::TokenExpired { .. }
        )
    }

    /// Whether a fresh attempt could plausibly succeed
    ///
    /// Only transport failures qualify. Configuration errors, rejections and
    /// an expired session will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RequestSend(_) | Self::BodyRead(_))
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(error: serde_json::Error) -> Self {
        Self::TokenBody(Arc::new(error))
    }
}

impl From<quick_xml::DeError> for AuthError {
    fn from(error: quick_xml::DeError) -> Self {
        Self::TicketBody(Arc::new(error))
    }
}

/// An error in the configuration used to build a strategy
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The base URL could not be parsed
    #[error("invalid base URL `{url}`")]
    InvalidBaseUrl {
        /// The offending value
        url: String,
        /// The parse failure
        #[source]
        source: url::ParseError,
    },

    /// The configured URL cannot carry path segments
    #[error("base URL `{url}` cannot be used as a base for API paths")]
    CannotBeABase {
        /// The offending value
        url: String,
    },

    /// A temporary token lifespan of zero would expire every token immediately
    #[error("temporary token lifespan must be greater than zero")]
    ZeroLifespan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_not_retryable() {
        let error = AuthError::Rejected {
            status: StatusCode::FORBIDDEN,
            message: "Access denied".into(),
        };
        assert!(error.is_rejection());
        assert!(!error.is_retryable());
    }

    #[test]
    fn session_expiry_is_neither_rejection_nor_retryable() {
        assert!(!AuthError::SessionExpired.is_rejection());
        assert!(!AuthError::SessionExpired.is_retryable());
    }

    #[test]
    fn rejection_message_includes_status_and_provider_text() {
        let error = AuthError::Rejected {
            status: StatusCode::UNAUTHORIZED,
            message: "Invalid token".into(),
        };
        let message = error.to_string();
        assert!(message.contains("401"));
        assert!(message.contains("Invalid token"));
    }
}
