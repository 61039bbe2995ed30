//! Declarative credentials configuration
//!
//! Applications that read their settings from a file or the environment can
//! deserialize an [`AuthConfig`] and turn it into a [`Strategy`]:
//!
//! ```
//! use quickbase_auth::{config::AuthConfig, AuthStrategy, Scheme};
//!
//! let config: AuthConfig = serde_json::from_str(r#"{
//!     "realm": "acme.quickbase.com",
//!     "credentials": { "type": "user_token", "token": "b7c9_abcdef" }
//! }"#).unwrap();
//!
//! let strategy = config.build(reqwest::Client::new()).unwrap();
//! assert_eq!(strategy.scheme(), Scheme::UserToken);
//! ```

use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;
use serde::Deserialize;

use crate::{
    AccessToken, ConfigError, ExistingTicketStrategy, Realm, SamlAssertion, SsoStrategy,
    Strategy, TempTokenStrategy, TicketStrategy, UserToken, UserTokenStrategy, Username,
};

mod secret_string {
    use secrecy::SecretString;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(SecretString::new(s.into()))
    }
}

/// Settings needed to authenticate against a Quickbase realm
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// The realm hostname, such as `acme.quickbase.com`
    pub realm: Realm,
    /// Overrides the JSON API base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// The credential model to authenticate with
    pub credentials: CredentialsConfig,
}

/// The credential model and its secrets
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialsConfig {
    /// A long-lived user token
    UserToken {
        /// The user token
        token: UserToken,
    },
    /// Temporary tokens cached per table or app
    TempToken {
        /// Authorizes token fetches; the HTTP client's session is used otherwise
        #[serde(default)]
        user_token: Option<UserToken>,
        /// A token to use before any fetch
        #[serde(default)]
        token: Option<AccessToken>,
        /// Binds `token` to a single resource; without it, `token` serves
        /// requests made without a resource key
        #[serde(default)]
        resource_key: Option<String>,
        /// How long tokens are trusted, in milliseconds
        #[serde(default)]
        lifespan_ms: Option<u64>,
        /// Whether new tokens may be fetched at all
        #[serde(default = "fetch_by_default")]
        fetch: bool,
    },
    /// A ticket obtained by signing in with a password
    Ticket {
        /// The user signing in
        username: Username,
        /// The user's password
        #[serde(deserialize_with = "secret_string::deserialize")]
        password: SecretString,
        /// How many hours the ticket should remain valid
        #[serde(default)]
        hours: Option<u32>,
        /// Overrides the sign in URL
        #[serde(default)]
        ticket_url: Option<String>,
    },
    /// A ticket obtained elsewhere
    ExistingTicket {
        /// The ticket
        ticket: AccessToken,
    },
    /// Temporary tokens exchanged for a SAML assertion
    Sso {
        /// The base64 encoded SAML assertion
        assertion: SamlAssertion,
    },
}

fn fetch_by_default() -> bool {
    true
}

fn parse_url(url: String) -> Result<Url, ConfigError> {
    Url::parse(&url).map_err(|source| ConfigError::InvalidBaseUrl { url, source })
}

impl AuthConfig {
    /// Builds the configured strategy around `client`
    pub fn build(self, client: reqwest::Client) -> Result<Strategy, ConfigError> {
        let base_url = self.base_url.map(parse_url).transpose()?;

        let strategy = match self.credentials {
            CredentialsConfig::UserToken { token } => UserTokenStrategy::new(token).into(),
            CredentialsConfig::TempToken {
                user_token,
                token,
                resource_key,
                lifespan_ms,
                fetch,
            } => {
                let mut builder = TempTokenStrategy::builder(self.realm);
                if let Some(url) = base_url {
                    builder = builder.with_base_url(url);
                }
                if let Some(ms) = lifespan_ms {
                    builder = builder.with_lifespan(Duration::from_millis(ms));
                }
                builder = match (fetch, user_token) {
                    (false, _) => builder.without_fetch(),
                    (true, Some(user_token)) => builder.with_user_token(user_token),
                    (true, None) => builder,
                };
                builder = match (token, resource_key) {
                    (Some(token), Some(key)) => builder.with_seed_for(key, token),
                    (Some(token), None) => builder.with_seed(token),
                    (None, _) => builder,
                };
                builder.build(client)?.into()
            }
            CredentialsConfig::Ticket {
                username,
                password,
                hours,
                ticket_url,
            } => {
                let mut strategy = TicketStrategy::new(client, self.realm, username, password)?;
                if let Some(hours) = hours {
                    strategy = strategy.with_validity_hours(hours);
                }
                if let Some(url) = ticket_url {
                    strategy = strategy.with_ticket_url(parse_url(url)?);
                }
                strategy.into()
            }
            CredentialsConfig::ExistingTicket { ticket } => {
                ExistingTicketStrategy::new(ticket).into()
            }
            CredentialsConfig::Sso { assertion } => {
                let mut strategy = SsoStrategy::new(client, self.realm, assertion);
                if let Some(url) = base_url {
                    strategy = strategy.with_base_url(url)?;
                }
                strategy.into()
            }
        };

        Ok(strategy)
    }
}
