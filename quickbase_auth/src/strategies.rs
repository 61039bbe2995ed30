//! The available authentication strategies

use async_trait::async_trait;
use reqwest::{Request, StatusCode};

use crate::{strategy::Sealed, AccessToken, AccessTokenRef, AuthError, AuthStrategy, Scheme};

mod dto;
mod fixed;
mod provider;
mod sso;
mod temp_token;
mod ticket;

pub use fixed::{ExistingTicketStrategy, UserTokenStrategy};
pub use provider::{default_base_url, DEFAULT_BASE_URL};
pub use sso::SsoStrategy;
pub use temp_token::{
    TempTokenBuilder, TempTokenFetch, TempTokenStrategy, DEFAULT_TEMP_TOKEN_LIFESPAN,
};
pub use ticket::{SessionState, TicketStrategy, DEFAULT_TICKET_HOURS, MAX_TICKET_HOURS};

/// One of the credential models a client can be constructed with
///
/// A client picks its strategy once and keeps it for its whole lifetime.
#[derive(Debug)]
pub enum Strategy {
    /// A long-lived user token
    UserToken(UserTokenStrategy),
    /// Temporary tokens cached per table or app
    TempToken(TempTokenStrategy),
    /// A ticket obtained by signing in with a password
    Ticket(TicketStrategy),
    /// A ticket obtained elsewhere
    ExistingTicket(ExistingTicketStrategy),
    /// Temporary tokens exchanged for a SAML assertion
    Sso(SsoStrategy),
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Strategy::UserToken($inner) => $body,
            Strategy::TempToken($inner) => $body,
            Strategy::Ticket($inner) => $body,
            Strategy::ExistingTicket($inner) => $body,
            Strategy::Sso($inner) => $body,
        }
    };
}

impl Sealed for Strategy {}

#[async_trait]
impl AuthStrategy for Strategy {
    fn scheme(&self) -> Scheme {
        dispatch!(self, s => s.scheme())
    }

    async fn get_token(&self, resource_key: &str) -> Result<AccessToken, AuthError> {
        dispatch!(self, s => s.get_token(resource_key).await)
    }

    fn apply_auth(&self, request: &mut Request, token: &AccessTokenRef) {
        dispatch!(self, s => s.apply_auth(request, token))
    }

    async fn handle_auth_error(
        &self,
        status: StatusCode,
        resource_key: &str,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<Option<AccessToken>, AuthError> {
        dispatch!(self, s => s.handle_auth_error(status, resource_key, attempt, max_attempts).await)
    }
}

macro_rules! impl_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Strategy {
                fn from(strategy: $ty) -> Self {
                    Self::$variant(strategy)
                }
            }
        )*
    };
}

impl_from! {
    UserToken(UserTokenStrategy),
    TempToken(TempTokenStrategy),
    Ticket(TicketStrategy),
    ExistingTicket(ExistingTicketStrategy),
    Sso(SsoStrategy),
}

#[cfg(test)]
mod tests {
    use reqwest::header;

    use super::*;
    use crate::UserToken;

    #[tokio::test]
    async fn dispatches_to_the_wrapped_strategy() {
        let strategy = Strategy::from(UserTokenStrategy::new(UserToken::from_static("b7c9_abc")));
        assert_eq!(strategy.scheme(), Scheme::UserToken);

        let token = strategy.get_token("").await.unwrap();
        let mut req = Request::new(
            reqwest::Method::GET,
            "https://api.quickbase.com/v1/apps/bqx7xre7f".parse().unwrap(),
        );
        strategy.apply_auth(&mut req, &token);

        assert_eq!(
            req.headers()[header::AUTHORIZATION].to_str().unwrap(),
            "QB-USER-TOKEN b7c9_abc"
        );
    }

    #[test]
    fn schemes_follow_the_credential_model() {
        let ticket = Strategy::from(ExistingTicketStrategy::new(AccessToken::from_static("t")));
        let temp = Strategy::from(
            TempTokenStrategy::builder("acme.quickbase.com")
                .build(reqwest::Client::new())
                .unwrap(),
        );
        let sso = Strategy::from(SsoStrategy::new(
            reqwest::Client::new(),
            "acme.quickbase.com",
            crate::SamlAssertion::from_static("PHNhbWw+"),
        ));

        assert_eq!(ticket.scheme(), Scheme::Ticket);
        assert_eq!(temp.scheme(), Scheme::TempToken);
        assert_eq!(sso.scheme(), Scheme::TempToken);
    }
}
