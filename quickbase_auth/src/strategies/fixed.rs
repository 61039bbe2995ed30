//! Strategies whose token is known up front

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::{
    strategy::{should_refresh, Sealed},
    AccessToken, AuthError, AuthStrategy, Scheme, UserToken,
};

/// Authenticates every request with a long-lived user token
///
/// The token never expires client-side and no network call is ever made to
/// obtain it.
#[derive(Clone, Debug)]
pub struct UserTokenStrategy {
    token: UserToken,
}

impl UserTokenStrategy {
    /// Constructs a strategy around the given user token
    pub fn new(token: UserToken) -> Self {
        Self { token }
    }

    fn access_token(&self) -> AccessToken {
        AccessToken::new(self.token.as_str().to_owned())
    }
}

impl Sealed for UserTokenStrategy {}

#[async_trait]
impl AuthStrategy for UserTokenStrategy {
    fn scheme(&self) -> Scheme {
        Scheme::UserToken
    }

    async fn get_token(&self, _resource_key: &str) -> Result<AccessToken, AuthError> {
        Ok(self.access_token())
    }

    /// A user token cannot be refreshed, but a 401 may be transient, so the
    /// same token is offered again while attempts remain.
    async fn handle_auth_error(
        &self,
        status: StatusCode,
        _resource_key: &str,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<Option<AccessToken>, AuthError> {
        if should_refresh(status, attempt, max_attempts) {
            tracing::debug!(attempt, "retrying with the same user token");
            Ok(Some(self.access_token()))
        } else {
            Ok(None)
        }
    }
}

/// Authenticates every request with a ticket obtained elsewhere
#[derive(Clone, Debug)]
pub struct ExistingTicketStrategy {
    ticket: AccessToken,
}

impl ExistingTicketStrategy {
    /// Constructs a strategy around a previously issued ticket
    pub fn new(ticket: AccessToken) -> Self {
        Self { ticket }
    }
}

impl Sealed for ExistingTicketStrategy {}

#[async_trait]
impl AuthStrategy for ExistingTicketStrategy {
    fn scheme(&self) -> Scheme {
        Scheme::Ticket
    }

    async fn get_token(&self, _resource_key: &str) -> Result<AccessToken, AuthError> {
        Ok(self.ticket.clone())
    }

    async fn handle_auth_error(
        &self,
        _status: StatusCode,
        _resource_key: &str,
        _attempt: u32,
        _max_attempts: u32,
    ) -> Result<Option<AccessToken>, AuthError> {
        Ok(None)
    }
}
