//! Substrate client facade.
//!
//! Exposes a typed and a dynamic client, each available in two flavors: a
//! backend-identity client used only for the small enumerated set of
//! operations that require authority the caller does not have, and a
//! per-request client built fresh from the caller's own bearer token for
//! everything else. There is deliberately no path from "per-request client
//! failed to build" to "fall back to backend identity" — callers that can't
//! build one must treat the request as unauthenticated.

use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::{Client, Config};

use crate::errors::AuthError;

/// Header a caller's forwarded bearer token was found under, recorded for
/// logging (never the token value itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// `Authorization: Bearer <token>`.
    AuthorizationHeader,
    /// `X-Forwarded-Access-Token`.
    ForwardedHeader,
    /// `?token=` query parameter (websocket/message endpoints only).
    QueryParam,
}

impl TokenSource {
    /// The header/param name, safe to log alongside a token's length.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::AuthorizationHeader => "authorization",
            Self::ForwardedHeader => "x-forwarded-access-token",
            Self::QueryParam => "query:token",
        }
    }
}

/// A caller-presented token together with where it came from.
#[derive(Clone)]
pub struct CallerToken {
    /// The raw bearer token value. Never logged; only `source` and `len()` may be.
    token: String,
    /// Which channel the token arrived on.
    pub source: TokenSource,
}

impl CallerToken {
    /// Construct a caller token from its raw value and the channel it arrived on.
    #[must_use]
    pub const fn new(token: String, source: TokenSource) -> Self {
        Self { token, source }
    }

    /// Length of the token, safe to log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.token.len()
    }

    /// Whether the token is empty (always rejected).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }

    /// The raw token value. Reserved for the narrow set of call sites that
    /// must present the caller's own token to a third party on the caller's
    /// behalf (minting a per-request client, authenticating a git push);
    /// never pass this to a logger or error message.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for CallerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerToken")
            .field("source", &self.source)
            .field("len", &self.token.len())
            .finish()
    }
}

/// The substrate client facade.
///
/// Holds a connected backend-identity client plus the cluster connection
/// skeleton (server address, CA data) needed to mint per-request clients
/// without ever touching the backend's own credentials.
#[derive(Clone)]
pub struct Substrate {
    backend_client: Client,
    cluster_skeleton: Config,
}

impl std::fmt::Debug for Substrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substrate")
            .field("cluster_url", &self.cluster_skeleton.cluster_url)
            .finish()
    }
}

impl Substrate {
    /// Build the facade from the ambient environment: in-cluster service
    /// account when running in a Pod, otherwise the local kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster connection cannot be inferred or the
    /// backend-identity client cannot be constructed.
    pub async fn from_env() -> anyhow::Result<Self> {
        let cluster_skeleton = Config::infer().await?;
        let backend_client = Client::try_from(cluster_skeleton.clone())?;
        Ok(Self {
            backend_client,
            cluster_skeleton,
        })
    }

    /// The backend-identity client, for the enumerated operations that
    /// require elevated authority (writing the validated session record,
    /// minting tokens, seeding tenant-scoped resources the caller cannot
    /// create themselves).
    #[must_use]
    pub fn backend(&self) -> &Client {
        &self.backend_client
    }

    /// A typed API handle scoped to `namespace`, using the backend identity.
    #[must_use]
    pub fn backend_typed<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        K: kube::api::Resource<DynamicType = ()>,
        K: Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    {
        Api::namespaced(self.backend_client.clone(), namespace)
    }

    /// A dynamic API handle scoped to `namespace`, using the backend identity.
    #[must_use]
    pub fn backend_dynamic(&self, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.backend_client.clone(), namespace, resource)
    }

    /// Build a client that acts as `token`, never touching the backend's own
    /// credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingToken`] if `token` is empty, or
    /// [`AuthError::InvalidToken`] if a client could not be constructed from
    /// it (malformed token string, TLS setup failure).
    pub fn per_request_client(&self, token: &CallerToken) -> Result<Client, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let mut config = self.cluster_skeleton.clone();
        config.auth_info.token = Some(token.token.clone().into());
        config.auth_info.token_file = None;
        config.auth_info.username = None;
        config.auth_info.password = None;
        config.auth_info.client_certificate_data = None;
        config.auth_info.client_key_data = None;

        Client::try_from(config).map_err(|_| AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_token_debug_never_prints_raw_value() {
        let token = CallerToken::new("super-secret-value".to_owned(), TokenSource::AuthorizationHeader);
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret-value"));
        assert!(debug.contains("len"));
    }

    #[test]
    fn token_source_labels_are_stable() {
        assert_eq!(TokenSource::AuthorizationHeader.label(), "authorization");
        assert_eq!(TokenSource::ForwardedHeader.label(), "x-forwarded-access-token");
        assert_eq!(TokenSource::QueryParam.label(), "query:token");
    }
}
