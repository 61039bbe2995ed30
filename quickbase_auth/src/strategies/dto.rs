//! DTOs for interacting with Quickbase authentication endpoints

use serde::{Deserialize, Serialize};

use crate::SamlAssertionRef;

/// Response to `GET /auth/temporary/{dbid}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TemporaryAuthorization {
    #[serde(default)]
    pub temporary_authorization: Option<String>,
}

/// RFC 8693 token exchange request presenting a SAML assertion
#[derive(Debug, Serialize)]
pub(super) struct TokenExchangeRequest<'a> {
    pub grant_type: &'static str,
    pub requested_token_type: &'static str,
    pub subject_token: &'a SamlAssertionRef,
    pub subject_token_type: &'static str,
}

impl<'a> TokenExchangeRequest<'a> {
    pub const GRANT_TYPE: &'static str = "urn:ietf:params:oauth:grant-type:token-exchange";
    pub const REQUESTED_TOKEN_TYPE: &'static str =
        "urn:quickbase:params:oauth:token-type:temp_token";
    pub const SUBJECT_TOKEN_TYPE: &'static str = "urn:ietf:params:oauth:token-type:saml2";

    pub fn for_assertion(assertion: &'a SamlAssertionRef) -> Self {
        Self {
            grant_type: Self::GRANT_TYPE,
            requested_token_type: Self::REQUESTED_TOKEN_TYPE,
            subject_token: assertion,
            subject_token_type: Self::SUBJECT_TOKEN_TYPE,
        }
    }
}

/// Response to `POST /auth/oauth/token`
#[derive(Debug, Deserialize)]
pub(super) struct TokenExchangeResponse {
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Response to the `API_Authenticate` action
#[derive(Debug, Deserialize)]
pub(super) struct AuthenticateResponse {
    pub errcode: i32,
    #[serde(default)]
    pub errtext: Option<String>,
    #[serde(default)]
    pub errdetail: Option<String>,
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(default)]
    pub userid: Option<String>,
}

impl AuthenticateResponse {
    pub fn error_message(&self) -> String {
        match (self.errtext.as_deref(), self.errdetail.as_deref()) {
            (Some(text), Some(detail)) if !detail.is_empty() => format!("{}: {}", text, detail),
            (Some(text), _) => text.to_owned(),
            (None, Some(detail)) => detail.to_owned(),
            (None, None) => String::from("no details provided"),
        }
    }
}

/// Error body returned by the JSON API
#[derive(Debug, Deserialize)]
pub(super) struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}
