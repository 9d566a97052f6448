//! Caller identity extraction: bearer tokens and forwarded user headers.
//!
//! The operator never issues OAuth identity itself — that is deliberately
//! out of scope; it only consumes what an upstream proxy has already
//! forwarded.

use axum::http::HeaderMap;

use crate::errors::AuthError;
use crate::kube_client::{CallerToken, TokenSource};

const AUTHORIZATION: &str = "authorization";
const FORWARDED_TOKEN: &str = "x-forwarded-access-token";
const FORWARDED_USER: &str = "x-forwarded-user";
const FORWARDED_PREFERRED_USERNAME: &str = "x-forwarded-preferred-username";
const FORWARDED_EMAIL: &str = "x-forwarded-email";
const FORWARDED_GROUPS: &str = "x-forwarded-groups";

/// Identity forwarded by an upstream proxy, consumed (never issued) by this
/// process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedIdentity {
    /// `X-Forwarded-User`.
    pub user: Option<String>,
    /// `X-Forwarded-Preferred-Username`.
    pub preferred_username: Option<String>,
    /// `X-Forwarded-Email`.
    pub email: Option<String>,
    /// `X-Forwarded-Groups`, comma-separated in the header, split here.
    pub groups: Vec<String>,
}

/// Extract whatever forwarded-identity headers are present. Absence of all
/// of them is not itself an error; the caller token is what gates access.
#[must_use]
pub fn extract_forwarded_identity(headers: &HeaderMap) -> ForwardedIdentity {
    ForwardedIdentity {
        user: header_str(headers, FORWARDED_USER),
        preferred_username: header_str(headers, FORWARDED_PREFERRED_USERNAME),
        email: header_str(headers, FORWARDED_EMAIL),
        groups: header_str(headers, FORWARDED_GROUPS)
            .map(|g| g.split(',').map(|s| s.trim().to_owned()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default(),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
}

/// Extract the caller's bearer token, trying in priority order: the
/// `Authorization: Bearer` header, then `X-Forwarded-Access-Token`, then (only
/// when `allow_query_param` is set, for the WebSocket and messages endpoints)
/// a `?token=` query parameter.
///
/// # Errors
///
/// Returns [`AuthError::MissingToken`] if none of the accepted channels
/// carried a non-empty token.
pub fn extract_caller_token(
    headers: &HeaderMap,
    query_token: Option<&str>,
    allow_query_param: bool,
) -> Result<CallerToken, AuthError> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")) {
            if !token.is_empty() {
                return Ok(CallerToken::new(token.to_owned(), TokenSource::AuthorizationHeader));
            }
        }
    }

    if let Some(token) = header_str(headers, FORWARDED_TOKEN) {
        if !token.is_empty() {
            return Ok(CallerToken::new(token, TokenSource::ForwardedHeader));
        }
    }

    if allow_query_param {
        if let Some(token) = query_token {
            if !token.is_empty() {
                return Ok(CallerToken::new(token.to_owned(), TokenSource::QueryParam));
            }
        }
    }

    Err(AuthError::MissingToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn prefers_authorization_header_over_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(FORWARDED_TOKEN, HeaderValue::from_static("def"));
        let token = extract_caller_token(&headers, None, false).expect("token");
        assert_eq!(token.source, TokenSource::AuthorizationHeader);
    }

    #[test]
    fn falls_back_to_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_TOKEN, HeaderValue::from_static("def"));
        let token = extract_caller_token(&headers, None, false).expect("token");
        assert_eq!(token.source, TokenSource::ForwardedHeader);
    }

    #[test]
    fn query_param_only_accepted_when_allowed() {
        let headers = HeaderMap::new();
        assert!(extract_caller_token(&headers, Some("qtok"), false).is_err());
        let token = extract_caller_token(&headers, Some("qtok"), true).expect("token");
        assert_eq!(token.source, TokenSource::QueryParam);
    }

    #[test]
    fn missing_everything_is_an_error() {
        let headers = HeaderMap::new();
        assert!(matches!(
            extract_caller_token(&headers, None, false),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn forwarded_groups_are_split_and_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_GROUPS, HeaderValue::from_static("team-a, team-b,  team-c"));
        let identity = extract_forwarded_identity(&headers);
        assert_eq!(identity.groups, vec!["team-a", "team-b", "team-c"]);
    }
}
