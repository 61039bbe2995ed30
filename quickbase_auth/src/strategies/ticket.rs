//! One-shot username and password sign in

use std::{fmt, sync::OnceLock};

use async_trait::async_trait;
use quick_xml::escape::escape;
use reqwest::{header, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};

use super::{dto, provider};
use crate::{
    single_flight::SingleFlight, strategy::Sealed, AccessToken, AuthError, AuthStrategy,
    ConfigError, Credential, Realm, Scheme, UserId, Username,
};

/// Validity requested for a ticket unless configured otherwise
pub const DEFAULT_TICKET_HOURS: u32 = 12;

/// The longest validity Quickbase grants a ticket, roughly six months
pub const MAX_TICKET_HOURS: u32 = 4380;

const SESSION_KEY: &str = "";
const ACTION_HEADER: &str = "QUICKBASE-ACTION";
const AUTHENTICATE_ACTION: &str = "API_Authenticate";

struct Secret {
    username: Username,
    password: SecretString,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("username", &self.username)
            .field("password", &self.password)
            .finish()
    }
}

/// What remains of the password
#[derive(Debug)]
enum Session {
    Pending(Secret),
    Consumed,
    SignedOut,
}

impl Session {
    fn take_secret(&mut self) -> Result<Secret, AuthError> {
        match std::mem::replace(self, Self::Consumed) {
            Self::Pending(secret) => Ok(secret),
            Self::Consumed => Err(AuthError::SessionExpired),
            Self::SignedOut => {
                *self = Self::SignedOut;
                Err(AuthError::SessionExpired)
            }
        }
    }

    fn accept_ticket(&mut self) -> Result<(), AuthError> {
        match self {
            Self::SignedOut => Err(AuthError::SessionExpired),
            _ => Ok(()),
        }
    }
}

/// Where a ticket session stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The password has not been exchanged yet, or the exchange is underway
    Unauthenticated,
    /// A ticket was issued and is cached
    Authenticated,
    /// The password is gone and no ticket remains; this state is final
    Expired,
}

/// Authenticates with a ticket obtained by signing in with a password
///
/// The password is exchanged for a ticket at most once. It is removed from
/// memory as soon as the exchange starts, whatever its outcome. Once the
/// ticket is rejected or the session is signed out, every call fails with
/// [`AuthError::SessionExpired`] and a new strategy must be constructed. A
/// ticket issued after the session was signed out is discarded.
pub struct TicketStrategy {
    client: reqwest::Client,
    realm: Realm,
    ticket_url: Url,
    hours: u32,
    flights: SingleFlight<Session>,
    user_id: OnceLock<UserId>,
}

impl fmt::Debug for TicketStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketStrategy")
            .field("realm", &self.realm)
            .field("ticket_url", &self.ticket_url.as_str())
            .field("hours", &self.hours)
            .field("state", &self.session_state())
            .field("user_id", &self.user_id.get())
            .finish()
    }
}

impl TicketStrategy {
    /// Constructs a strategy that signs in to `realm` on first use
    pub fn new(
        client: reqwest::Client,
        realm: impl Into<Realm>,
        username: impl Into<Username>,
        password: SecretString,
    ) -> Result<Self, ConfigError> {
        let realm = realm.into();
        let url = format!("https://{}/db/main", realm);
        let ticket_url = Url::parse(&url)
            .map_err(|source| ConfigError::InvalidBaseUrl { url, source })?;

        let secret = Secret {
            username: username.into(),
            password,
        };

        Ok(Self {
            client,
            realm,
            ticket_url,
            hours: DEFAULT_TICKET_HOURS,
            flights: SingleFlight::new(Session::Pending(secret), quickbase_clock::System),
            user_id: OnceLock::new(),
        })
    }

    /// Sets how many hours the issued ticket should remain valid
    ///
    /// Values are clamped to between 1 and [`MAX_TICKET_HOURS`].
    pub fn with_validity_hours(mut self, hours: u32) -> Self {
        self.hours = hours.clamp(1, MAX_TICKET_HOURS);
        self
    }

    /// Overrides the URL the sign in request is sent to
    pub fn with_ticket_url(mut self, ticket_url: Url) -> Self {
        self.ticket_url = ticket_url;
        self
    }

    /// The validity requested for the ticket
    pub fn validity_hours(&self) -> u32 {
        self.hours
    }

    /// The identifier of the signed in user, once known
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id.get().cloned()
    }

    /// Reports where the session stands
    pub fn session_state(&self) -> SessionState {
        self.flights.read(|state| match state.extra {
            Session::SignedOut => SessionState::Expired,
            _ if state.entry(SESSION_KEY).is_some() => SessionState::Authenticated,
            Session::Pending(_) => SessionState::Unauthenticated,
            Session::Consumed if state.is_in_flight(SESSION_KEY) => SessionState::Unauthenticated,
            Session::Consumed => SessionState::Expired,
        })
    }

    /// Discards the password and the ticket, ending the session
    ///
    /// A sign in that is already underway runs to completion, but its ticket
    /// is thrown away and its callers receive [`AuthError::SessionExpired`].
    pub fn sign_out(&self) {
        self.flights.write(|state| {
            state.extra = Session::SignedOut;
            state.clear();
        });
        tracing::debug!(realm = %self.realm, "signed out");
    }

    #[tracing::instrument(
        err,
        skip(self, secret),
        fields(realm = %self.realm, username = %secret.username, hours = self.hours),
    )]
    async fn sign_in(&self, secret: Secret) -> Result<Credential, AuthError> {
        tracing::trace!("exchanging password for ticket");

        let body = request_body(&secret, self.hours);
        drop(secret);

        let resp = self
            .client
            .post(self.ticket_url.clone())
            .header(ACTION_HEADER, AUTHENTICATE_ACTION)
            .header(header::CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .await
            .map_err(AuthError::request_send)?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received sign in response from authority"
        );

        let text = resp.text().await.map_err(AuthError::body_read)?;
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status,
                message: provider::provider_message(&text),
            });
        }

        let reply: dto::AuthenticateResponse = quick_xml::de::from_str(&text)?;
        if reply.errcode != 0 {
            return Err(AuthError::TicketRejected {
                code: reply.errcode,
                message: reply.error_message(),
            });
        }

        let ticket =
            provider::non_empty(reply.ticket).ok_or(AuthError::EmptyCredential { status })?;

        if let Some(user_id) = provider::non_empty(reply.userid) {
            let _ = self.user_id.set(UserId::new(user_id));
        }

        tracing::info!(user_id = ?self.user_id.get(), "signed in and received ticket");

        Ok(Credential::new(AccessToken::new(ticket)))
    }
}

fn request_body(secret: &Secret, hours: u32) -> String {
    format!(
        "<qdbapi><username>{}</username><password>{}</password><hours>{}</hours></qdbapi>",
        escape(secret.username.as_str()),
        escape(secret.password.expose_secret()),
        hours,
    )
}

impl Sealed for TicketStrategy {}

#[async_trait]
impl AuthStrategy for TicketStrategy {
    fn scheme(&self) -> Scheme {
        Scheme::Ticket
    }

    async fn get_token(&self, _resource_key: &str) -> Result<AccessToken, AuthError> {
        self.flights
            .get_or_fetch_committed(
                SESSION_KEY,
                Session::take_secret,
                |secret| self.sign_in(secret),
                Session::accept_ticket,
            )
            .await
    }

    /// A rejected ticket cannot be renewed without the password, so the
    /// session ends and no retry is offered.
    async fn handle_auth_error(
        &self,
        status: StatusCode,
        _resource_key: &str,
        _attempt: u32,
        _max_attempts: u32,
    ) -> Result<Option<AccessToken>, AuthError> {
        if status == StatusCode::UNAUTHORIZED && self.flights.invalidate(SESSION_KEY) {
            tracing::warn!(realm = %self.realm, "ticket rejected, session has expired");
        }
        Ok(None)
    }
}
