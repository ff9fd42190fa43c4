use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use devcell_core::remote::{
    RemoteCommit, RemoteConnector, RemoteError, RemoteRepository, RemoteResult, TreeEntry,
};

use crate::retry::{RetryConfig, send_with_retry};

const USER_AGENT: &str = concat!("devcell/", env!("CARGO_PKG_VERSION"));
const ACCEPT: &str = "application/vnd.github+json";

/// Client for the GitHub git-data REST API (or any server speaking it).
///
/// One instance per user: the stored access token is attached to every
/// request. Reads are retried on 5xx; writes are sent exactly once.
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    retry: RetryConfig,
}

impl GitHubClient {
    /// Create a new client with the given base URL and timeout.
    pub fn new(base_url: &str, timeout: Duration) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RemoteError::Transient(format!("build http client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create from an existing `reqwest::Client` (e.g. shared in tests).
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn set_auth(&mut self, token: String) {
        self.auth_token = Some(token);
    }

    pub fn set_retry(&mut self, retry: RetryConfig) {
        self.retry = retry;
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url(path))
            .header(reqwest::header::ACCEPT, ACCEPT);
        if let Some(token) = self.auth_token.as_deref() {
            req = req.bearer_auth(token);
        }
        req
    }

    /// GET with retry; `Ok(None)` when the object does not exist.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<Option<T>> {
        let resp = send_with_retry(|| self.request(Method::GET, path), "GET", &self.retry)
            .await
            .map_err(network_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse_response(resp).await.map(Some)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> RemoteResult<T> {
        let resp = self
            .request(Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(network_error)?;
        parse_response(resp).await
    }
}

// ── Wire shapes ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RepositoryBody {
    full_name: String,
}

#[derive(Deserialize)]
struct ShaBody {
    sha: String,
}

#[derive(Deserialize)]
struct RefBody {
    object: ShaBody,
}

#[derive(Deserialize)]
struct CommitBody {
    sha: String,
    tree: ShaBody,
    #[serde(default)]
    parents: Vec<ShaBody>,
    #[serde(default)]
    message: String,
    committer: Option<SignatureBody>,
}

#[derive(Deserialize)]
struct SignatureBody {
    date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct TreeListBody {
    tree: Vec<TreeItemBody>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeItemBody {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
}

#[derive(Deserialize)]
struct BlobBody {
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Serialize)]
struct NewBlob<'a> {
    content: &'a str,
    encoding: &'a str,
}

#[derive(Serialize)]
struct NewTree<'a> {
    base_tree: &'a str,
    tree: Vec<NewTreeItem<'a>>,
}

#[derive(Serialize)]
struct NewTreeItem<'a> {
    path: &'a str,
    mode: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    sha: &'a str,
}

#[derive(Serialize)]
struct NewCommit<'a> {
    message: &'a str,
    tree: &'a str,
    parents: [&'a str; 1],
}

#[derive(Serialize)]
struct RefUpdate<'a> {
    sha: &'a str,
    force: bool,
}

#[async_trait]
impl RemoteRepository for GitHubClient {
    async fn resolve_repo(&self, repo_id: &str) -> RemoteResult<Option<String>> {
        let body: Option<RepositoryBody> = self
            .get_optional(&format!("/repositories/{}", urlencoding::encode(repo_id)))
            .await?;
        Ok(body.map(|b| b.full_name))
    }

    async fn branch_head(&self, repo: &str, branch: &str) -> RemoteResult<Option<String>> {
        let path = format!("/repos/{repo}/git/ref/heads/{branch}");
        let resp = send_with_retry(|| self.request(Method::GET, &path), "GET", &self.retry)
            .await
            .map_err(network_error)?;
        // An empty repository answers 409 instead of 404.
        if matches!(resp.status(), StatusCode::NOT_FOUND | StatusCode::CONFLICT) {
            return Ok(None);
        }
        let body: RefBody = parse_response(resp).await?;
        Ok(Some(body.object.sha))
    }

    async fn get_commit(&self, repo: &str, sha: &str) -> RemoteResult<Option<RemoteCommit>> {
        let body: Option<CommitBody> = self
            .get_optional(&format!("/repos/{repo}/git/commits/{sha}"))
            .await?;
        Ok(body.map(|c| RemoteCommit {
            sha: c.sha,
            tree_sha: c.tree.sha,
            parent_shas: c.parents.into_iter().map(|p| p.sha).collect(),
            message: c.message,
            date: c.committer.and_then(|s| s.date),
        }))
    }

    async fn create_blob(&self, repo: &str, content: &[u8]) -> RemoteResult<String> {
        let encoded = BASE64.encode(content);
        let body: ShaBody = self
            .post(
                &format!("/repos/{repo}/git/blobs"),
                &NewBlob {
                    content: &encoded,
                    encoding: "base64",
                },
            )
            .await?;
        debug!(repo, sha = %body.sha, bytes = content.len(), "created blob");
        Ok(body.sha)
    }

    async fn create_tree(
        &self,
        repo: &str,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> RemoteResult<String> {
        let tree = entries
            .iter()
            .map(|e| NewTreeItem {
                path: &e.path,
                mode: "100644",
                kind: "blob",
                sha: &e.sha,
            })
            .collect();
        let body: ShaBody = self
            .post(&format!("/repos/{repo}/git/trees"), &NewTree { base_tree, tree })
            .await?;
        Ok(body.sha)
    }

    async fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree: &str,
        parent: &str,
    ) -> RemoteResult<String> {
        let body: ShaBody = self
            .post(
                &format!("/repos/{repo}/git/commits"),
                &NewCommit {
                    message,
                    tree,
                    parents: [parent],
                },
            )
            .await?;
        Ok(body.sha)
    }

    async fn update_ref(
        &self,
        repo: &str,
        branch: &str,
        new_sha: &str,
        _expected_parent: &str,
    ) -> RemoteResult<()> {
        // `force: false` makes the server enforce fast-forward against the
        // current head, which the new commit's parent must equal.
        let resp = self
            .request(Method::PATCH, &format!("/repos/{repo}/git/refs/heads/{branch}"))
            .json(&RefUpdate {
                sha: new_sha,
                force: false,
            })
            .send()
            .await
            .map_err(network_error)?;
        if resp.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let body = resp.text().await.unwrap_or_default();
            debug!(repo, branch, %body, "ref update rejected");
            return Err(RemoteError::NonFastForward {
                branch: branch.to_string(),
            });
        }
        let _: serde_json::Value = parse_response(resp).await?;
        Ok(())
    }

    async fn list_tree(&self, repo: &str, tree_sha: &str) -> RemoteResult<Vec<TreeEntry>> {
        let body: TreeListBody = self
            .get(&format!("/repos/{repo}/git/trees/{tree_sha}?recursive=1"))
            .await?;
        if body.truncated {
            warn!(repo, tree_sha, "remote tree listing truncated");
        }
        Ok(body
            .tree
            .into_iter()
            .filter(|item| item.kind == "blob")
            .map(|item| TreeEntry {
                path: item.path,
                sha: item.sha,
            })
            .collect())
    }

    async fn get_blob(&self, repo: &str, sha: &str) -> RemoteResult<Vec<u8>> {
        let body: BlobBody = self.get(&format!("/repos/{repo}/git/blobs/{sha}")).await?;
        if body.encoding == "base64" {
            let compact: String = body.content.split_whitespace().collect();
            BASE64
                .decode(compact)
                .map_err(|e| RemoteError::Rejected(format!("malformed blob {sha}: {e}")))
        } else {
            Ok(body.content.into_bytes())
        }
    }
}

/// Hands out one [`GitHubClient`] per user token.
pub struct GitHubConnector {
    base_url: String,
    timeout: Duration,
}

impl GitHubConnector {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout,
        }
    }
}

impl RemoteConnector for GitHubConnector {
    fn connect(&self, token: Option<&str>) -> RemoteResult<Arc<dyn RemoteRepository>> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(RemoteError::Unauthorized)?;
        let mut client = GitHubClient::new(&self.base_url, self.timeout)?;
        client.set_auth(token.to_string());
        Ok(Arc::new(client))
    }
}

fn network_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Transient(e.to_string())
}

/// Parse an HTTP response: return the deserialized body on 2xx, or a
/// classified [`RemoteError`] carrying the status and body text.
async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> RemoteResult<T> {
    let status = resp.status();
    if !status.is_success() {
        let rate_limit_exhausted = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0");
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_status(status, rate_limit_exhausted, body));
    }
    resp.json()
        .await
        .map_err(|e| RemoteError::Rejected(format!("unexpected response body: {e}")))
}

fn classify_status(status: StatusCode, rate_limit_exhausted: bool, body: String) -> RemoteError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited(body),
        StatusCode::FORBIDDEN if rate_limit_exhausted => RemoteError::RateLimited(body),
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized,
        StatusCode::NOT_FOUND => RemoteError::NotFound(body),
        s if s.is_server_error() => RemoteError::Transient(format!("{s}: {body}")),
        s => RemoteError::Rejected(format!("{s}: {body}")),
    }
}
