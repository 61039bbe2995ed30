//! Temporary tokens obtained by exchanging a SAML assertion

use std::fmt;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use super::{
    dto,
    provider::{self, REALM_HOSTNAME},
};
use crate::{
    single_flight::SingleFlight,
    strategy::{should_refresh, Sealed},
    AccessToken, AuthError, AuthStrategy, ConfigError, Credential, Realm, SamlAssertion, Scheme,
};

const SESSION_KEY: &str = "";

/// Authenticates with a temporary token exchanged for a SAML assertion
///
/// The assertion is kept for the lifetime of the strategy, so a rejected token
/// is replaced by exchanging the assertion again.
pub struct SsoStrategy {
    client: reqwest::Client,
    base_url: Url,
    realm: Realm,
    assertion: SamlAssertion,
    flights: SingleFlight,
}

impl fmt::Debug for SsoStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsoStrategy")
            .field("base_url", &self.base_url.as_str())
            .field("realm", &self.realm)
            .field("assertion", &self.assertion)
            .field("flights", &self.flights)
            .finish()
    }
}

impl SsoStrategy {
    /// Constructs a strategy for `realm` using the default API base URL
    pub fn new(client: reqwest::Client, realm: impl Into<Realm>, assertion: SamlAssertion) -> Self {
        Self {
            client,
            base_url: provider::default_base_url(),
            realm: realm.into(),
            assertion,
            flights: SingleFlight::new((), quickbase_clock::System),
        }
    }

    /// Overrides the API base URL
    pub fn with_base_url(mut self, base_url: Url) -> Result<Self, ConfigError> {
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::CannotBeABase {
                url: base_url.to_string(),
            });
        }
        self.base_url = base_url;
        Ok(self)
    }

    /// Drops the exchanged token so that the next call exchanges again
    pub fn invalidate(&self) -> bool {
        self.flights.invalidate(SESSION_KEY)
    }

    async fn token(&self) -> Result<AccessToken, AuthError> {
        self.flights
            .get_or_fetch(SESSION_KEY, |_| Ok(()), |()| self.exchange())
            .await
    }

    #[tracing::instrument(err, skip(self), fields(realm = %self.realm, base_url = %self.base_url))]
    async fn exchange(&self) -> Result<Credential, AuthError> {
        tracing::trace!("exchanging SAML assertion for temporary token");

        let url = provider::endpoint(&self.base_url, &["auth", "oauth", "token"])?;
        let resp = self
            .client
            .post(url)
            .header(REALM_HOSTNAME, self.realm.as_str())
            .json(&dto::TokenExchangeRequest::for_assertion(&self.assertion))
            .send()
            .await
            .map_err(AuthError::request_send)?;

        let (status, body) = provider::read_json::<dto::TokenExchangeResponse>(resp).await?;
        let token =
            provider::non_empty(body.access_token).ok_or(AuthError::EmptyCredential { status })?;

        tracing::info!("received new temporary token from assertion exchange");

        Ok(Credential::new(AccessToken::new(token)))
    }
}

impl Sealed for SsoStrategy {}

#[async_trait]
impl AuthStrategy for SsoStrategy {
    fn scheme(&self) -> Scheme {
        Scheme::TempToken
    }

    async fn get_token(&self, _resource_key: &str) -> Result<AccessToken, AuthError> {
        self.token().await
    }

    async fn handle_auth_error(
        &self,
        status: StatusCode,
        _resource_key: &str,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<Option<AccessToken>, AuthError> {
        if !should_refresh(status, attempt, max_attempts) {
            return Ok(None);
        }

        tracing::debug!(attempt, "token rejected, exchanging assertion again");
        self.invalidate();
        self.token().await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::json;
    use wiremock::{
        matchers::{body_partial_json, header as has_header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn strategy(server: &MockServer) -> SsoStrategy {
        SsoStrategy::new(
            reqwest::Client::new(),
            "acme.quickbase.com",
            SamlAssertion::from_static("PHNhbWxwOlJlc3BvbnNlPg=="),
        )
        .with_base_url(Url::parse(&format!("{}/v1", server.uri())).unwrap())
        .unwrap()
    }

    fn exchanged(token: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token,
            "issued_token_type": "urn:quickbase:params:oauth:token-type:temp_token",
            "token_type": "N_A",
        }))
    }

    mod when_exchanging {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_callers_share_one_exchange() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/auth/oauth/token"))
                .and(has_header("QB-Realm-Hostname", "acme.quickbase.com"))
                .and(body_partial_json(json!({
                    "grant_type": "urn:ietf:params:oauth:grant-type:token-exchange",
                    "subject_token": "PHNhbWxwOlJlc3BvbnNlPg==",
                    "subject_token_type": "urn:ietf:params:oauth:token-type:saml2",
                })))
                .respond_with(exchanged("sso-temp").set_delay(Duration::from_millis(100)))
                .expect(1)
                .mount(&server)
                .await;

            let strategy = Arc::new(strategy(&server));
            let tasks: Vec<_> = (0..5)
                .map(|_| {
                    let strategy = strategy.clone();
                    tokio::spawn(async move { strategy.get_token("").await })
                })
                .collect();

            for task in tasks {
                assert_eq!(task.await.unwrap().unwrap().as_str(), "sso-temp");
            }
        }

        #[tokio::test]
        async fn missing_access_token_is_an_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
                .mount(&server)
                .await;

            assert!(matches!(
                strategy(&server).get_token("").await,
                Err(AuthError::EmptyCredential { .. })
            ));
        }

        #[tokio::test]
        async fn rejection_surfaces_the_provider_message() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                    "message": "Bad Request",
                    "description": "Invalid SAML assertion",
                })))
                .mount(&server)
                .await;

            match strategy(&server).get_token("").await {
                Err(AuthError::Rejected { status, message }) => {
                    assert_eq!(status, StatusCode::BAD_REQUEST);
                    assert_eq!(message, "Bad Request: Invalid SAML assertion");
                }
                other => panic!("expected a rejection, got {:?}", other),
            }
        }
    }

    mod when_a_request_is_rejected {
        use super::*;

        #[tokio::test]
        async fn a_401_exchanges_the_assertion_again() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(exchanged("sso-temp"))
                .expect(2)
                .mount(&server)
                .await;

            let strategy = strategy(&server);
            strategy.get_token("").await.unwrap();

            let retry = strategy
                .handle_auth_error(StatusCode::UNAUTHORIZED, "", 0, 3)
                .await
                .unwrap();
            assert_eq!(retry.unwrap().as_str(), "sso-temp");
        }

        #[tokio::test]
        async fn no_exchange_on_the_last_attempt() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(exchanged("sso-temp"))
                .expect(1)
                .mount(&server)
                .await;

            let strategy = strategy(&server);
            strategy.get_token("").await.unwrap();

            let retry = strategy
                .handle_auth_error(StatusCode::UNAUTHORIZED, "", 2, 3)
                .await
                .unwrap();
            assert!(retry.is_none());
            assert!(strategy.flights.cached(SESSION_KEY).is_some());
        }
    }

    #[test]
    fn debug_output_hides_the_assertion() {
        let strategy = SsoStrategy::new(
            reqwest::Client::new(),
            "acme.quickbase.com",
            SamlAssertion::from_static("PHNhbWxwOlJlc3BvbnNlPg=="),
        );
        assert!(!format!("{:?}", strategy).contains("PHNhbWxw"));
    }
}
