use std::time::Duration;

use quickbase_clock::{Clock, System, UnixTime};

use crate::{AccessToken, AccessTokenRef};

/// A token along with the time, if any, at which it stops being valid
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    access_token: AccessToken,
    expires_at: Option<UnixTime>,
}

/// A credential's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialStatus {
    /// The credential can be attached to requests
    Valid,
    /// The credential had an expiry and it has passed
    Expired,
    /// The credential carries no token at all
    Empty,
}

impl Credential {
    /// Constructs a credential that never expires
    pub fn new(access_token: AccessToken) -> Self {
        Self {
            access_token,
            expires_at: None,
        }
    }

    /// Constructs a credential that expires at the given time
    pub fn expiring_at(access_token: AccessToken, expires_at: UnixTime) -> Self {
        Self {
            access_token,
            expires_at: Some(expires_at),
        }
    }

    /// Constructs a credential valid for `lifespan` from the time reported by `clock`
    pub fn with_lifespan<C: Clock>(access_token: AccessToken, lifespan: Duration, clock: &C) -> Self {
        Self::expiring_at(access_token, clock.now() + lifespan)
    }

    /// Gets the token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the time at which the token expires, if it does
    #[inline]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.expires_at
    }

    /// Gets the credential's current lifecycle status
    #[inline]
    pub fn status(&self) -> CredentialStatus {
        self.status_at(System.now())
    }

    /// Gets the credential's lifecycle status as of the provided time
    pub fn status_at(&self, time: UnixTime) -> CredentialStatus {
        if self.access_token.as_str().is_empty() {
            CredentialStatus::Empty
        } else {
            match self.expires_at {
                Some(expiry) if time >= expiry => CredentialStatus::Expired,
                _ => CredentialStatus::Valid,
            }
        }
    }

    /// Whether the credential can be used as of the provided time
    #[inline]
    pub fn is_valid_at(&self, time: UnixTime) -> bool {
        self.status_at(time) == CredentialStatus::Valid
    }

    /// Gets how much longer the credential remains valid as of the provided time
    ///
    /// Returns `None` for credentials that never expire.
    pub fn until_expired_at(&self, time: UnixTime) -> Option<Duration> {
        self.expires_at
            .map(|expiry| expiry.saturating_duration_since(time))
    }
}
