//! App listing and deployment through the external deploy service.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use devcell_core::{RepoFile, SessionError, SessionResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSummary {
    pub name: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn list_apps(&self) -> SessionResult<Vec<AppSummary>>;

    /// `None` when no app of that name exists.
    async fn get_app_created_at(&self, name: &str) -> SessionResult<Option<DateTime<Utc>>>;

    async fn app_exists(&self, name: &str) -> SessionResult<bool> {
        Ok(self.get_app_created_at(name).await?.is_some())
    }

    async fn deploy(&self, name: &str, files: &[RepoFile]) -> SessionResult<DeployResult>;
}

/// [`Deployer`] speaking JSON over HTTP:
///
/// - `GET  {base}/apps`
/// - `GET  {base}/apps/{name}` (404 means no such app)
/// - `POST {base}/apps/{name}/deploy` with base64 file contents
pub struct HttpDeployer {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct DeployFile<'a> {
    path: &'a str,
    content: String,
}

#[derive(Serialize)]
struct DeployRequest<'a> {
    files: Vec<DeployFile<'a>>,
}

impl HttpDeployer {
    pub fn new(base_url: &str, timeout: Duration) -> SessionResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::Internal(format!("deploy client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn app_url(&self, name: &str) -> String {
        self.url(&format!("/apps/{}", urlencoding::encode(name)))
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> SessionResult<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(status, format!("{status}: {body}")));
        }
        resp.json()
            .await
            .map_err(|e| SessionError::Internal(format!("deploy service returned bad JSON: {e}")))
    }
}

fn classify(status: reqwest::StatusCode, message: String) -> SessionError {
    match status.as_u16() {
        404 => SessionError::NotFound(message),
        409 => SessionError::Conflict(message),
        429 => SessionError::RateLimited(message),
        400 | 422 => SessionError::InvalidRequest(message),
        401 | 403 => SessionError::PermissionDenied(message),
        s if s >= 500 => SessionError::Transient(message),
        _ => SessionError::Internal(message),
    }
}

fn transport(e: reqwest::Error) -> SessionError {
    SessionError::Transient(format!("deploy service unreachable: {e}"))
}

#[derive(Deserialize)]
struct AppDetail {
    #[serde(default, rename = "createdAt")]
    created_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl Deployer for HttpDeployer {
    async fn list_apps(&self) -> SessionResult<Vec<AppSummary>> {
        let resp = self
            .client
            .get(self.url("/apps"))
            .send()
            .await
            .map_err(transport)?;
        Self::parse_response(resp).await
    }

    async fn get_app_created_at(&self, name: &str) -> SessionResult<Option<DateTime<Utc>>> {
        let resp = self
            .client
            .get(self.app_url(name))
            .send()
            .await
            .map_err(transport)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(app = name, "app not found");
            return Ok(None);
        }
        let detail: AppDetail = Self::parse_response(resp).await?;
        // An existing app without a timestamp still exists.
        Ok(Some(detail.created_at.unwrap_or_else(Utc::now)))
    }

    async fn deploy(&self, name: &str, files: &[RepoFile]) -> SessionResult<DeployResult> {
        let body = DeployRequest {
            files: files
                .iter()
                .map(|f| DeployFile {
                    path: &f.path,
                    content: STANDARD.encode(f.content.as_bytes()),
                })
                .collect(),
        };
        let resp = self
            .client
            .post(format!("{}/deploy", self.app_url(name)))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let result: DeployResult = Self::parse_response(resp).await?;
        info!(app = name, files = files.len(), url = ?result.url, "deployed app");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};

    async fn serve() -> String {
        let app = Router::new()
            .route(
                "/apps",
                get(|| async { Json(json!([{"name": "blog", "createdAt": "2024-05-01T10:00:00Z"}])) }),
            )
            .route(
                "/apps/{name}",
                get(|Path(name): Path<String>| async move {
                    if name == "blog" {
                        Ok(Json(json!({"name": "blog", "createdAt": "2024-05-01T10:00:00Z"})))
                    } else {
                        Err(StatusCode::NOT_FOUND)
                    }
                }),
            )
            .route(
                "/apps/{name}/deploy",
                post(|Path(name): Path<String>, Json(body): Json<Value>| async move {
                    let files = body["files"].as_array().cloned().unwrap_or_default();
                    if files.is_empty() {
                        return Err((StatusCode::UNPROCESSABLE_ENTITY, "no files"));
                    }
                    let first = files[0]["content"].as_str().unwrap_or_default().to_string();
                    Ok(Json(json!({
                        "name": name,
                        "url": format!("https://{name}.apps.test"),
                        "status": first,
                    })))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn lists_and_looks_up_apps() {
        let deployer = HttpDeployer::new(&serve().await, Duration::from_secs(5)).unwrap();
        let apps = deployer.list_apps().await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "blog");

        assert!(deployer.app_exists("blog").await.unwrap());
        assert!(!deployer.app_exists("shop").await.unwrap());
        assert!(deployer.get_app_created_at("shop").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deploy_sends_base64_contents() {
        let deployer = HttpDeployer::new(&serve().await, Duration::from_secs(5)).unwrap();
        let result = deployer
            .deploy("blog", &[RepoFile::new("index.html", "<h1>hi</h1>")])
            .await
            .unwrap();
        assert_eq!(result.url.as_deref(), Some("https://blog.apps.test"));
        assert_eq!(
            result.status.as_deref(),
            Some(STANDARD.encode("<h1>hi</h1>").as_str())
        );

        let err = deployer.deploy("blog", &[]).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRequest(_)), "got {err}");
    }

    #[tokio::test]
    async fn missing_service_is_transient() {
        let deployer = HttpDeployer::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = deployer.list_apps().await.unwrap_err();
        assert!(matches!(err, SessionError::Transient(_)), "got {err}");
    }
}
