//! Per-resource temporary tokens

use std::{fmt, time::Duration};

use async_trait::async_trait;
use quickbase_clock::{Clock, System};
use reqwest::{header, StatusCode, Url};

use super::{
    dto,
    provider::{self, REALM_HOSTNAME},
};
use crate::{
    single_flight::SingleFlight,
    strategy::{should_refresh, Sealed},
    AccessToken, AuthError, AuthStrategy, ConfigError, Credential, Realm, Scheme, UserToken,
};

/// How long a temporary token is trusted after it was fetched
///
/// Quickbase issues temporary tokens that are valid for five minutes. The
/// default leaves a margin so that a token is not sent just as it expires.
pub const DEFAULT_TEMP_TOKEN_LIFESPAN: Duration = Duration::from_secs(290);

/// How requests for new temporary tokens are authorized
#[derive(Clone, Debug, Default)]
pub enum TempTokenFetch {
    /// Rely on the HTTP client's own session, such as its cookie store
    #[default]
    Session,
    /// Authorize the request with a user token
    UserToken(UserToken),
    /// Never fetch; only seeded or externally supplied tokens are used
    Disabled,
}

/// Authenticates requests with temporary tokens scoped to a single table or app
///
/// Tokens are cached per resource key and trusted for the configured
/// lifespan. Concurrent requests for the same key share a single fetch.
pub struct TempTokenStrategy<C = System> {
    client: reqwest::Client,
    base_url: Url,
    realm: Realm,
    fetch: TempTokenFetch,
    lifespan: Duration,
    global_seed: Option<AccessToken>,
    flights: SingleFlight<(), C>,
}

impl<C: fmt::Debug> fmt::Debug for TempTokenStrategy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempTokenStrategy")
            .field("base_url", &self.base_url.as_str())
            .field("realm", &self.realm)
            .field("fetch", &self.fetch)
            .field("lifespan", &self.lifespan)
            .field("global_seed", &self.global_seed)
            .field("flights", &self.flights)
            .finish()
    }
}

impl TempTokenStrategy {
    /// Starts building a strategy for the given realm
    pub fn builder(realm: impl Into<Realm>) -> TempTokenBuilder {
        TempTokenBuilder {
            realm: realm.into(),
            base_url: None,
            fetch: TempTokenFetch::default(),
            lifespan: DEFAULT_TEMP_TOKEN_LIFESPAN,
            seeds: Vec::new(),
            clock: System,
        }
    }
}

impl<C: Clock> TempTokenStrategy<C> {
    /// The lifespan applied to fetched and supplied tokens
    pub fn lifespan(&self) -> Duration {
        self.lifespan
    }

    /// The token cached for `resource_key`, if it is still valid
    pub fn cached_token(&self, resource_key: &str) -> Option<AccessToken> {
        self.flights.cached(resource_key)
    }

    /// Drops the cached token for `resource_key`
    ///
    /// Returns whether a token was cached.
    pub fn invalidate(&self, resource_key: &str) -> bool {
        self.flights.invalidate(resource_key)
    }

    /// Drops every cached token
    pub fn clear(&self) {
        self.flights.clear();
    }

    /// Stores an externally obtained token, trusting it for the configured lifespan
    pub fn set_token(&self, resource_key: impl Into<String>, token: AccessToken) {
        let credential = Credential::with_lifespan(token, self.lifespan, self.flights.clock());
        self.flights.insert(resource_key, credential);
    }

    /// Stores an externally obtained token that never expires client-side
    pub fn set_token_without_expiry(&self, resource_key: impl Into<String>, token: AccessToken) {
        self.flights.insert(resource_key, Credential::new(token));
    }

    async fn token_for(&self, resource_key: &str) -> Result<AccessToken, AuthError> {
        if resource_key.is_empty() {
            return self
                .global_seed
                .clone()
                .ok_or(AuthError::MissingResourceKey);
        }

        self.flights
            .get_or_fetch(
                resource_key,
                |_| match self.fetch {
                    TempTokenFetch::Disabled => Err(AuthError::TokenExpired {
                        resource_key: resource_key.to_owned(),
                    }),
                    _ => Ok(()),
                },
                |()| self.fetch_token(resource_key),
            )
            .await
    }

    #[tracing::instrument(
        err,
        skip(self),
        fields(realm = %self.realm, base_url = %self.base_url),
    )]
    async fn fetch_token(&self, resource_key: &str) -> Result<Credential, AuthError> {
        tracing::trace!("requesting temporary token from authority");

        let url = provider::endpoint(&self.base_url, &["auth", "temporary", resource_key])?;
        let mut req = self
            .client
            .get(url)
            .header(REALM_HOSTNAME, self.realm.as_str());

        if let TempTokenFetch::UserToken(token) = &self.fetch {
            match Scheme::UserToken.header_value(token.as_str()) {
                Some(value) => req = req.header(header::AUTHORIZATION, value),
                None => tracing::warn!("user token is not a valid header value, fetching without it"),
            }
        }

        let resp = req.send().await.map_err(AuthError::request_send)?;
        let (status, body) = provider::read_json::<dto::TemporaryAuthorization>(resp).await?;

        let token = provider::non_empty(body.temporary_authorization)
            .ok_or(AuthError::EmptyCredential { status })?;

        tracing::info!(
            lifespan = ?self.lifespan,
            "received new temporary token"
        );

        Ok(Credential::with_lifespan(
            AccessToken::new(token),
            self.lifespan,
            self.flights.clock(),
        ))
    }
}

impl<C> Sealed for TempTokenStrategy<C> {}

#[async_trait]
impl<C> AuthStrategy for TempTokenStrategy<C>
where
    C: Clock + fmt::Debug + Send + Sync,
{
    fn scheme(&self) -> Scheme {
        Scheme::TempToken
    }

    async fn get_token(&self, resource_key: &str) -> Result<AccessToken, AuthError> {
        self.token_for(resource_key).await
    }

    async fn handle_auth_error(
        &self,
        status: StatusCode,
        resource_key: &str,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<Option<AccessToken>, AuthError> {
        if !should_refresh(status, attempt, max_attempts) || resource_key.is_empty() {
            return Ok(None);
        }

        self.invalidate(resource_key);

        if let TempTokenFetch::Disabled = self.fetch {
            tracing::debug!(resource_key, "token rejected and fetching is disabled");
            return Ok(None);
        }

        tracing::debug!(resource_key, attempt, "token rejected, fetching a new one");
        self.token_for(resource_key).await.map(Some)
    }
}

/// Builder for a [`TempTokenStrategy`]
#[derive(Debug)]
pub struct TempTokenBuilder<C = System> {
    realm: Realm,
    base_url: Option<Url>,
    fetch: TempTokenFetch,
    lifespan: Duration,
    seeds: Vec<(String, AccessToken)>,
    clock: C,
}

impl<C> TempTokenBuilder<C> {
    /// Overrides the API base URL
    ///
    /// Defaults to [`DEFAULT_BASE_URL`][crate::DEFAULT_BASE_URL].
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// Overrides how long fetched tokens are trusted
    ///
    /// Defaults to [`DEFAULT_TEMP_TOKEN_LIFESPAN`].
    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = lifespan;
        self
    }

    /// Sets how token fetches are authorized
    pub fn with_fetch(mut self, fetch: TempTokenFetch) -> Self {
        self.fetch = fetch;
        self
    }

    /// Authorizes token fetches with a user token
    pub fn with_user_token(self, token: UserToken) -> Self {
        self.with_fetch(TempTokenFetch::UserToken(token))
    }

    /// Disables token fetches entirely
    pub fn without_fetch(self) -> Self {
        self.with_fetch(TempTokenFetch::Disabled)
    }

    /// Provides a token served when no resource key is given
    pub fn with_seed(self, token: AccessToken) -> Self {
        self.with_seed_for("", token)
    }

    /// Provides a token for one resource, trusted for the configured lifespan
    /// starting when the strategy is built
    pub fn with_seed_for(mut self, resource_key: impl Into<String>, token: AccessToken) -> Self {
        self.seeds.push((resource_key.into(), token));
        self
    }

    /// Uses a different clock to judge token expiry
    pub fn with_clock<C2>(self, clock: C2) -> TempTokenBuilder<C2> {
        TempTokenBuilder {
            realm: self.realm,
            base_url: self.base_url,
            fetch: self.fetch,
            lifespan: self.lifespan,
            seeds: self.seeds,
            clock,
        }
    }
}

impl<C: Clock> TempTokenBuilder<C> {
    /// Builds the strategy
    pub fn build(self, client: reqwest::Client) -> Result<TempTokenStrategy<C>, ConfigError> {
        if self.lifespan.is_zero() {
            return Err(ConfigError::ZeroLifespan);
        }

        let base_url = match self.base_url {
            Some(url) if url.cannot_be_a_base() => {
                return Err(ConfigError::CannotBeABase {
                    url: url.to_string(),
                })
            }
            Some(url) => url,
            None => provider::default_base_url(),
        };

        let flights = SingleFlight::new((), self.clock);
        let mut global_seed = None;

        for (key, token) in self.seeds {
            if key.is_empty() {
                global_seed = Some(token);
            } else {
                let credential = Credential::with_lifespan(token, self.lifespan, flights.clock());
                flights.insert(key, credential);
            }
        }

        Ok(TempTokenStrategy {
            client,
            base_url,
            realm: self.realm,
            fetch: self.fetch,
            lifespan: self.lifespan,
            global_seed,
            flights,
        })
    }
}
