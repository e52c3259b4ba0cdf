//! GitHub App platform client.
//!
//! Authenticates as a GitHub App: a short-lived RS256 JWT identifies the
//! app, which is exchanged for an installation token scoped to the target
//! repository. Tokens are minted per call.

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use super::{IssueComment, PlatformClient, PrFile};
use crate::error::{Error, Result};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "sadguard";

/// GitHub App implementation of [`PlatformClient`].
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    app_id: String,
    private_key_pem: String,
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct Installation {
    id: u64,
}

#[derive(Deserialize)]
struct InstallationToken {
    token: String,
}

#[derive(Deserialize)]
struct Comment {
    id: u64,
}

impl GitHubClient {
    /// Creates a client for the given App id and PEM private key.
    pub fn new(app_id: &str, private_key_pem: &str) -> Result<Self> {
        // Validate the key eagerly so a bad PEM fails at startup.
        EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| Error::Config(format!("invalid GitHub App private key: {}", e)))?;

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            app_id: app_id.to_string(),
            private_key_pem: private_key_pem.to_string(),
        })
    }

    /// Overrides the API base URL.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Signs a short-lived App JWT (10 minutes, 60 s clock-skew allowance).
    fn app_jwt(&self) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 600,
            iss: self.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key_pem.as_bytes())
            .map_err(|e| Error::Config(format!("invalid GitHub App private key: {}", e)))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| Error::Config(format!("cannot sign App JWT: {}", e)))
    }

    /// Mints an installation token for the repository.
    async fn installation_token(&self, repo: &str) -> Result<String> {
        let jwt = self.app_jwt()?;

        let installation: Installation = self
            .get_json(
                &format!("{}/repos/{}/installation", self.api_base, repo),
                &jwt,
            )
            .await?;

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation.id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(transport_error)?;
        let token: InstallationToken = decode_response(response).await?;
        Ok(token.token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, token: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(transport_error)?;
        decode_response(response).await
    }
}

/// Extracts `owner/repo` from a repository-scoped API URL such as
/// `https://api.github.com/repos/{owner}/{repo}/pulls/{n}`.
fn repo_from_api_url(url: &str) -> Result<String> {
    let mut segments = url.split('/').skip_while(|s| *s != "repos").skip(1);
    match (segments.next(), segments.next()) {
        (Some(owner), Some(repo)) if !owner.is_empty() && !repo.is_empty() => {
            Ok(format!("{}/{}", owner, repo))
        }
        _ => Err(Error::Platform {
            status: 0,
            message: format!("cannot derive repository from URL: {}", url),
        }),
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::Platform {
        status: e.status().map(|s| s.as_u16()).unwrap_or(0),
        message: e.to_string(),
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(Error::Platform {
            status: status.as_u16(),
            message,
        });
    }
    response.json().await.map_err(transport_error)
}

#[async_trait]
impl PlatformClient for GitHubClient {
    async fn list_pr_files(&self, pr_api_url: &str) -> Result<Vec<PrFile>> {
        let repo = repo_from_api_url(pr_api_url)?;
        let token = self.installation_token(&repo).await?;
        self.get_json(&format!("{}/files", pr_api_url), &token).await
    }

    async fn create_comment(&self, repo: &str, pr_number: i64, body: &str) -> Result<u64> {
        let token = self.installation_token(repo).await?;
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_base, repo, pr_number
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .header("Accept", "application/vnd.github+json")
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(transport_error)?;
        let comment: Comment = decode_response(response).await?;
        Ok(comment.id)
    }

    async fn edit_comment(&self, repo: &str, comment_id: u64, body: &str) -> Result<()> {
        let token = self.installation_token(repo).await?;
        let url = format!(
            "{}/repos/{}/issues/comments/{}",
            self.api_base, repo, comment_id
        );
        let response = self
            .http
            .patch(&url)
            .bearer_auth(&token)
            .header("Accept", "application/vnd.github+json")
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(transport_error)?;
        let _: Comment = decode_response(response).await?;
        Ok(())
    }

    async fn list_comments(&self, repo: &str, pr_number: i64) -> Result<Vec<IssueComment>> {
        let token = self.installation_token(repo).await?;
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_base, repo, pr_number
        );
        self.get_json(&url, &token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_repo_from_pull_request_api_url() {
        let repo =
            repo_from_api_url("https://api.github.com/repos/octo/demo/pulls/7").unwrap();
        assert_eq!(repo, "octo/demo");
    }

    #[test]
    fn rejects_url_without_repos_segment() {
        assert!(repo_from_api_url("https://api.github.com/pulls/7").is_err());
    }

    #[test]
    fn rejects_truncated_repo_path() {
        assert!(repo_from_api_url("https://api.github.com/repos/octo").is_err());
    }

    #[test]
    fn app_claims_window_spans_skew_and_expiry() {
        let claims = AppClaims {
            iat: 1000 - 60,
            exp: 1000 + 600,
            iss: "12345".to_string(),
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["iss"], "12345");
        assert_eq!(json["exp"].as_i64().unwrap() - json["iat"].as_i64().unwrap(), 660);
    }
}
