//! Shared plumbing for requests sent to the Quickbase authority

use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use super::dto;
use crate::AuthError;

/// Header carrying the realm hostname on JSON API requests
pub(crate) const REALM_HOSTNAME: &str = "QB-Realm-Hostname";

/// The public Quickbase JSON API
pub const DEFAULT_BASE_URL: &str = "https://api.quickbase.com/v1";

/// Parses [`DEFAULT_BASE_URL`]
pub fn default_base_url() -> Url {
    Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid")
}

/// Appends path segments to `base`, percent-encoding each one
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, AuthError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| AuthError::InvalidUrl {
            base: base.to_string(),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Reads a JSON body, converting non-success statuses into rejections
pub(crate) async fn read_json<T: DeserializeOwned>(
    resp: Response,
) -> Result<(StatusCode, T), AuthError> {
    let status = resp.status();

    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from authority"
    );

    if !status.is_success() {
        let body = resp.text().await.map_err(AuthError::body_read)?;
        return Err(AuthError::Rejected {
            status,
            message: provider_message(&body),
        });
    }

    let body = resp.bytes().await.map_err(AuthError::body_read)?;
    Ok((status, serde_json::from_slice(&body)?))
}

/// Extracts a human readable explanation from an error body
pub(crate) fn provider_message(body: &str) -> String {
    if let Ok(error) = serde_json::from_str::<dto::ErrorBody>(body) {
        match (error.message, error.description) {
            (Some(message), Some(description)) if !description.is_empty() => {
                return format!("{}: {}", message, description)
            }
            (Some(message), _) => return message,
            (None, Some(description)) => return description,
            (None, None) => {}
        }
    }

    let body = body.trim();
    if body.is_empty() {
        String::from("no details provided")
    } else {
        body.to_owned()
    }
}

/// Keeps only non-empty strings
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
