//! Middleware to authenticate outgoing Quickbase API requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AuthMiddleware`] in the middleware stack to attach a token
//! from an authentication [`Strategy`][quickbase_auth::Strategy] to each
//! outbound request.
//!
//! If the API answers `401 Unauthorized`, the strategy is asked for a
//! refreshed token and the request is sent again, up to a configurable number
//! of attempts. Strategies that cannot refresh their credential end the
//! exchange and the `401` response is returned to the caller. No other
//! failures are retried.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use quickbase_auth::{UserToken, UserTokenStrategy};
//! use quickbase_auth_reqwest::AuthMiddleware;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let strategy = UserTokenStrategy::new(UserToken::from_static("b7c9_abcdef"));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AuthMiddleware::new(strategy))
//!     .build();
//!
//! let req = client
//!     .get("https://api.quickbase.com/v1/apps/bqx7xre7f")
//!     .header("QB-Realm-Hostname", "acme.quickbase.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! Per-resource strategies need to know which table or app a request is
//! for. Provide it with the [`ResourceKey`] extension:
//!
//! ```
//! # use quickbase_auth::TempTokenStrategy;
//! # use quickbase_auth_reqwest::AuthMiddleware;
//! use quickbase_auth_reqwest::ResourceKey;
//! # use reqwest::Client;
//! # use reqwest_middleware::ClientBuilder;
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let strategy = TempTokenStrategy::builder("acme.quickbase.com").build(Client::new()).unwrap();
//! # let client = ClientBuilder::new(Client::default()).with(AuthMiddleware::new(strategy)).build();
//!
//! let req = client
//!     .get("https://api.quickbase.com/v1/fields?tableId=bqx7xre7f")
//!     .with_extension(ResourceKey::from("bqx7xre7f"));
//! # }
//! ```
//!
//! The middleware can also be configured to authenticate requests only
//! conditionally. This can be useful in the event that you want to
//! use a single common middleware stack with multiple potential backends
//! and want to ensure that credentials are only ever sent to Quickbase.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a token to a request.
//!
//! ```
//! use quickbase_auth::{UserToken, UserTokenStrategy};
//! use quickbase_auth_reqwest::{AuthMiddleware, ExactHostMatch, HttpsOnly};
//! use predicates::prelude::PredicateBooleanExt;
//!
//! let strategy = UserTokenStrategy::new(UserToken::from_static("b7c9_abcdef"));
//!
//! AuthMiddleware::new(strategy)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("api.quickbase.com")))
//!     .with_max_attempts(2);
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use predicates::{prelude::*, reflection};
use quickbase_auth::{AccessToken, AuthStrategy};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Error, Middleware, Next, Result};

/// Number of times a request is sent before a `401` is returned to the caller
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// The table or app a request is for
///
/// Attach it to a request with
/// [`RequestBuilder::with_extension()`](reqwest_middleware::RequestBuilder::with_extension).
/// Requests without one are authenticated with the strategy's token for no
/// particular resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey(pub String);

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// A middleware that authenticates outgoing requests and retries them when
/// a refreshed credential is available
#[derive(Debug)]
pub struct AuthMiddleware<S, P = HttpsOnly> {
    strategy: Arc<S>,
    predicate: P,
    max_attempts: u32,
}

impl<S, P: Clone> Clone for AuthMiddleware<S, P> {
    fn clone(&self) -> Self {
        Self {
            strategy: Arc::clone(&self.strategy),
            predicate: self.predicate.clone(),
            max_attempts: self.max_attempts,
        }
    }
}

impl<S> AuthMiddleware<S, HttpsOnly> {
    /// Construct a new middleware from an authentication strategy
    ///
    /// By default, this middleware will only authenticate requests sent via
    /// HTTPS. To change this behavior, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(strategy: S) -> Self {
        Self::from_arc(Arc::new(strategy))
    }

    /// Construct a new middleware from a strategy that is shared elsewhere
    pub fn from_arc(strategy: Arc<S>) -> Self {
        Self {
            strategy,
            predicate: HttpsOnly,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl<S, P> AuthMiddleware<S, P> {
    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P2>(self, predicate: P2) -> AuthMiddleware<S, P2> {
        AuthMiddleware {
            strategy: self.strategy,
            predicate,
            max_attempts: self.max_attempts,
        }
    }

    /// Sets how many times a request may be sent in total
    ///
    /// Values below one are treated as one. Defaults to
    /// [`DEFAULT_MAX_ATTEMPTS`].
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// The strategy used to authenticate requests
    pub fn strategy(&self) -> &Arc<S> {
        &self.strategy
    }
}

impl<S: AuthStrategy, P> AuthMiddleware<S, P> {
    async fn authenticated(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let resource_key = extensions
            .get::<ResourceKey>()
            .map(|key| key.0.clone())
            .unwrap_or_default();

        let mut token: AccessToken = self
            .strategy
            .get_token(&resource_key)
            .await
            .map_err(Error::middleware)?;

        let mut attempt = 0;
        loop {
            let spare = if attempt + 1 < self.max_attempts {
                req.try_clone()
            } else {
                None
            };

            self.strategy.apply_auth(&mut req, &token);
            let resp = next.clone().run(req, extensions).await?;

            let status = resp.status();
            if status != StatusCode::UNAUTHORIZED {
                return Ok(resp);
            }

            tracing::debug!(
                resource_key = %resource_key,
                attempt,
                max_attempts = self.max_attempts,
                "request rejected as unauthorized"
            );

            // Without a spare request this is the final attempt, so the strategy
            // must not fetch a token that would never be sent.
            let reported_attempt = match spare {
                Some(_) => attempt,
                None => {
                    if attempt + 1 < self.max_attempts {
                        tracing::warn!("request body cannot be cloned, unable to retry");
                    }
                    self.max_attempts - 1
                }
            };

            let refreshed = self
                .strategy
                .handle_auth_error(status, &resource_key, reported_attempt, self.max_attempts)
                .await
                .map_err(Error::middleware)?;

            match (refreshed, spare) {
                (Some(fresh), Some(retry)) => {
                    token = fresh;
                    req = retry;
                    attempt += 1;
                }
                _ => return Ok(resp),
            }
        }
    }
}

#[async_trait::async_trait]
impl<S, P> Middleware for AuthMiddleware<S, P>
where
    S: AuthStrategy + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        self.authenticated(req, extensions, next).await
    }
}

/// Only authenticate a request if it is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only authenticate a request if it is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or("<no host>").to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}
