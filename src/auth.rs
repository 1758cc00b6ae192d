//! Bearer-token identity attached to requests by the auth middleware.

use subtle::ConstantTimeEq;

use crate::config::AuthApiSecret;

/// Identity of the authenticated caller.
///
/// `id` is the configured secret id when API secret auth matched, `None` when
/// authentication is disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auth {
    pub id: Option<String>,
}

impl Auth {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
        }
    }

    pub fn empty() -> Self {
        Self { id: None }
    }

    pub fn is_authenticated(&self) -> bool {
        self.id.is_some()
    }
}

/// Find the id of the API secret matching `token`.
///
/// Every configured secret is compared in constant time, and the scan does not
/// stop at the first match, so timing does not reveal which entry matched.
pub fn match_api_secret_id(token: &str, secrets: &[AuthApiSecret]) -> Option<String> {
    let mut matched: Option<&str> = None;
    for entry in secrets {
        let equal: bool = entry.secret.as_bytes().ct_eq(token.as_bytes()).into();
        if equal && matched.is_none() {
            matched = Some(entry.id.as_str());
        }
    }
    matched.map(str::to_string)
}
