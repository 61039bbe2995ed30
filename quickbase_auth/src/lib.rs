//! Acquisition, caching and refresh of credentials for Quickbase API clients
//!
//! A client authenticates under exactly one credential model for its whole
//! lifetime. Each model is implemented by a strategy and all of them share the
//! [`AuthStrategy`] contract:
//!
//! * [`get_token()`][AuthStrategy::get_token()] yields a currently valid
//!   token, fetching one from the authority if nothing usable is cached.
//! * [`apply_auth()`][AuthStrategy::apply_auth()] attaches that token to an
//!   outgoing request using the model's `Authorization` scheme.
//! * [`handle_auth_error()`][AuthStrategy::handle_auth_error()] is consulted
//!   after a `401 Unauthorized` and offers a refreshed token when the model
//!   has a way to obtain one.
//!
//! | Strategy | Scheme | Obtains tokens by |
//! |---|---|---|
//! | [`UserTokenStrategy`] | `QB-USER-TOKEN` | configuration only |
//! | [`TempTokenStrategy`] | `QB-TEMP-TOKEN` | `GET /auth/temporary/{dbid}`, cached per table or app |
//! | [`TicketStrategy`] | `QB-TICKET` | exchanging a password once via `API_Authenticate` |
//! | [`ExistingTicketStrategy`] | `QB-TICKET` | configuration only |
//! | [`SsoStrategy`] | `QB-TEMP-TOKEN` | exchanging a SAML assertion via `POST /auth/oauth/token` |
//!
//! # Concurrency
//!
//! Strategies are meant to be shared between tasks. Caching strategies make
//! sure that concurrent callers asking for the same resource trigger at most
//! one request to the authority; the other callers wait for that request and
//! share its outcome, success or failure. Callers that give up waiting simply
//! drop their future. If the caller performing the request is dropped, a
//! waiting caller takes over.
//!
//! # Example
//!
//! ```
//! use quickbase_auth::{AuthStrategy, TempTokenStrategy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let strategy = TempTokenStrategy::builder("acme.quickbase.com")
//!     .build(reqwest::Client::new())?;
//!
//! # /* Commented out due to this trying to interact with the world.
//! let token = strategy.get_token("bqx7xre7f").await?;
//!
//! let mut request = reqwest::Request::new(
//!     reqwest::Method::GET,
//!     "https://api.quickbase.com/v1/fields?tableId=bqx7xre7f".parse()?,
//! );
//! strategy.apply_auth(&mut request, &token);
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! To authenticate every request sent through a `reqwest_middleware` client,
//! see the `quickbase_auth_reqwest` crate.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod config;
mod credential;
mod error;
mod single_flight;
mod strategies;
mod strategy;

pub use braids::*;
pub use credential::{Credential, CredentialStatus};
pub use error::{AuthError, ConfigError};
pub use strategies::*;
pub use strategy::{should_refresh, AuthStrategy, Scheme};
