use aliri_braid::braid;
use std::fmt;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// A bearer credential ready to be attached to a request
///
/// Depending on the strategy that produced it, this is a user token, a
/// temporary token or a ticket.
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A long-lived Quickbase user token
#[braid(serde, debug = "owned", display = "owned")]
pub struct UserToken;

limited_reveal!(UserTokenRef: "USER TOKEN", 5);

/// A SAML assertion presented to the token exchange endpoint
#[braid(serde, debug = "owned", display = "owned")]
pub struct SamlAssertion;

limited_reveal!(SamlAssertionRef: "SAML ASSERTION", 5);

/// The hostname of a Quickbase realm, such as `acme.quickbase.com`
#[braid(serde)]
pub struct Realm;

/// The name of the user signing in with a password
#[braid(serde)]
pub struct Username;

/// The identifier of an authenticated user, as reported by the ticket exchange
#[braid(serde)]
pub struct UserId;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_is_hidden_by_default() {
        let token = AccessToken::from_static("b7c9_secret_value_here");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn alternate_debug_reveals_a_prefix_only() {
        let token = AccessToken::from_static("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{:#?}", token), "\"abcdefghijklmn…\"");
    }

    #[test]
    fn alternate_display_honors_width() {
        let token = UserToken::from_static("b7c9_secret");
        assert_eq!(format!("{:#4}", token), "b7c…");
    }

    #[test]
    fn short_secrets_are_revealed_whole_in_alternate_mode() {
        let assertion = SamlAssertion::from_static("abc");
        assert_eq!(format!("{:#?}", assertion), "\"abc\"");
    }

    #[test]
    fn realm_is_not_secret() {
        let realm = Realm::from_static("acme.quickbase.com");
        assert_eq!(format!("{}", realm), "acme.quickbase.com");
    }
}
