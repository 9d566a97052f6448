//! Forge user-identity lookup, used to resolve a push's commit author.
//!
//! A small `reqwest` client hitting a provider's user endpoint, the same
//! shape used elsewhere in this codebase for other outbound API calls; here
//! the provider is whatever forge hosts the repo's output URL, queried with
//! the caller's own push token rather than any stored credential.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::content_staging::GitIdentity;

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Resolve the identity a push should be attributed to: the forge's own user
/// record for the token presented, falling back to the stable bot identity
/// when the host isn't recognized or the lookup fails for any reason.
///
/// Never fails: a forge outage or an unrecognized host degrades to the bot
/// identity rather than blocking the push.
pub async fn resolve_identity(output_url: &str, token: &str) -> GitIdentity {
    if !is_github_host(output_url) {
        return GitIdentity::bot();
    }

    match fetch_github_user(token).await {
        Ok(user) => GitIdentity {
            name: user.name.unwrap_or(user.login.clone()),
            email: user
                .email
                .unwrap_or_else(|| format!("{}@users.noreply.github.com", user.login)),
        },
        Err(_) => GitIdentity::bot(),
    }
}

fn is_github_host(url: &str) -> bool {
    url.contains("github.com")
}

async fn fetch_github_user(token: &str) -> anyhow::Result<GithubUser> {
    let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
    let user = client
        .get("https://api.github.com/user")
        .bearer_auth(token)
        .header("User-Agent", "agentic-session-operator")
        .send()
        .await?
        .error_for_status()?
        .json::<GithubUser>()
        .await?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_github_hosts_skip_the_lookup() {
        assert!(!is_github_host("https://gitlab.example.com/owner/repo.git"));
        assert!(is_github_host("https://github.com/owner/repo.git"));
    }
}
