//! The contract shared by every authentication strategy

use std::fmt;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use reqwest::{header, Request, StatusCode};

use crate::{AccessToken, AccessTokenRef, AuthError};

mod sealed {
    pub trait Sealed {}
}

pub(crate) use sealed::Sealed;

/// The authorization scheme a strategy places in front of its token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `QB-USER-TOKEN`
    UserToken,
    /// `QB-TEMP-TOKEN`
    TempToken,
    /// `QB-TICKET`
    Ticket,
}

impl Scheme {
    /// The scheme name as it appears in the `Authorization` header
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserToken => "QB-USER-TOKEN",
            Self::TempToken => "QB-TEMP-TOKEN",
            Self::Ticket => "QB-TICKET",
        }
    }

    /// Builds an `Authorization` header value for `token`
    ///
    /// Returns `None` if the token contains bytes that cannot appear in a
    /// header value.
    pub fn header_value(self, token: &str) -> Option<header::HeaderValue> {
        let scheme = self.as_str();
        let mut value = BytesMut::with_capacity(scheme.len() + 1 + token.len());
        value.put_slice(scheme.as_bytes());
        value.put_u8(b' ');
        value.put_slice(token.as_bytes());

        let mut value = header::HeaderValue::from_maybe_shared(value.freeze()).ok()?;
        value.set_sensitive(true);
        Some(value)
    }

    /// Sets the `Authorization` header of `request`, replacing any prior value
    pub fn apply(self, request: &mut Request, token: &AccessTokenRef) {
        match self.header_value(token.as_str()) {
            Some(value) => {
                request.headers_mut().insert(header::AUTHORIZATION, value);
            }
            None => {
                tracing::warn!(
                    scheme = self.as_str(),
                    "token is not a valid header value, request left unauthenticated"
                );
            }
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failed call qualifies for a retry with a refreshed credential
///
/// Only `401 Unauthorized` qualifies, and only if at least one attempt
/// remains after the one that failed.
#[inline]
pub fn should_refresh(status: StatusCode, attempt: u32, max_attempts: u32) -> bool {
    status == StatusCode::UNAUTHORIZED && attempt.saturating_add(1) < max_attempts
}

/// A means of authenticating requests to the Quickbase API
///
/// The request executor calls [`get_token()`][Self::get_token()] before each
/// request, [`apply_auth()`][Self::apply_auth()] to attach the token and, only
/// after a `401 Unauthorized` response,
/// [`handle_auth_error()`][Self::handle_auth_error()] to find out whether to
/// retry with a different token.
///
/// This trait is sealed. The available strategies are gathered in
/// [`Strategy`][crate::Strategy].
#[async_trait]
pub trait AuthStrategy: Sealed + fmt::Debug + Send + Sync {
    /// The scheme this strategy uses on the wire
    fn scheme(&self) -> Scheme;

    /// Gets a currently valid token for `resource_key`
    ///
    /// Strategies that are not scoped to a resource ignore the key.
    async fn get_token(&self, resource_key: &str) -> Result<AccessToken, AuthError>;

    /// Attaches `token` to an outgoing request
    fn apply_auth(&self, request: &mut Request, token: &AccessTokenRef) {
        self.scheme().apply(request, token)
    }

    /// Reacts to a failed call
    ///
    /// Returns a token to retry with only when `status` is `401 Unauthorized`,
    /// another attempt remains and the strategy can refresh its credential.
    /// `Ok(None)` tells the executor not to retry on this strategy's account.
    async fn handle_auth_error(
        &self,
        status: StatusCode,
        resource_key: &str,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<Option<AccessToken>, AuthError>;
}
