use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/";

/// Supplies the bearer token attached to outgoing requests, if any.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("api: request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("api: unauthorized")]
    Unauthorized,
    #[error("api: forbidden")]
    Forbidden,
    #[error("api: content rejected: {}", describe_violations(.0))]
    Rejected(Vec<Violation>),
    #[error("api: error {status}: {}", status_message(.body))]
    Status { status: StatusCode, body: String },
    #[error("api: decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("api: invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ApiError {
    /// Human readable message from the server body, when there is one.
    pub fn server_message(&self) -> Option<String> {
        match self {
            ApiError::Status { body, .. } => server_message(body),
            _ => None,
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub struct Client {
    token_provider: Arc<dyn TokenProvider>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(token_provider: Arc<dyn TokenProvider>, config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("api client user agent required");
        }
        let mut base = config
            .base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };

        Ok(Client {
            token_provider,
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub fn popular_listings(&self, limit: Option<usize>) -> ApiResult<Vec<ListingSummary>> {
        let params = limit
            .map(|limit| vec![("limit".to_string(), limit.to_string())])
            .unwrap_or_default();
        let req = self.request(Method::GET, "api/listings/popular/", &params)?;
        decode(self.send(req)?)
    }

    pub fn listing_by_url(&self, url: &str) -> ApiResult<Listing> {
        let req = self
            .request(Method::POST, "api/listings/by-url/", &[])?
            .json(&serde_json::json!({ "url": url }));
        decode(self.send(req)?)
    }

    pub fn listing(&self, id: i64) -> ApiResult<Listing> {
        let path = format!("api/listings/{}/", id);
        let req = self.request(Method::GET, &path, &[])?;
        decode(self.send(req)?)
    }

    pub fn comments(&self, listing_id: i64, opts: PageOptions) -> ApiResult<Page<Comment>> {
        let path = format!("api/listings/{}/comments/", listing_id);
        let req = self.request(Method::GET, &path, &opts.into_params())?;
        decode(self.send(req)?)
    }

    pub fn create_comment(&self, listing_id: i64, content: &str) -> ApiResult<Comment> {
        let path = format!("api/listings/{}/comments/", listing_id);
        let req = self
            .request(Method::POST, &path, &[])?
            .json(&ContentPayload {
                content: Some(content),
            });
        decode(self.send(req)?)
    }

    pub fn comment(&self, id: i64) -> ApiResult<Comment> {
        let path = format!("api/comments/{}/", id);
        let req = self.request(Method::GET, &path, &[])?;
        decode(self.send(req)?)
    }

    pub fn update_comment(&self, id: i64, content: Option<&str>) -> ApiResult<Comment> {
        let path = format!("api/comments/{}/", id);
        let req = self
            .request(Method::PATCH, &path, &[])?
            .json(&ContentPayload { content });
        decode(self.send(req)?)
    }

    pub fn delete_comment(&self, id: i64) -> ApiResult<()> {
        let path = format!("api/comments/{}/", id);
        let req = self.request(Method::DELETE, &path, &[])?;
        self.send(req)?;
        Ok(())
    }

    pub fn toggle_like(&self, id: i64) -> ApiResult<LikeToggle> {
        let path = format!("api/comments/{}/like/", id);
        let req = self.request(Method::POST, &path, &[])?;
        decode(self.send(req)?)
    }

    pub fn login(&self, username: &str, password: &str) -> ApiResult<AuthResponse> {
        let req = self
            .request(Method::POST, "api/auth/login/", &[])?
            .json(&CredentialsPayload { username, password });
        decode(self.send(req)?)
    }

    pub fn register(&self, username: &str, password: &str) -> ApiResult<AuthResponse> {
        let req = self
            .request(Method::POST, "api/auth/register/", &[])?
            .json(&CredentialsPayload { username, password });
        decode(self.send(req)?)
    }

    pub fn me(&self) -> ApiResult<User> {
        let req = self.request(Method::GET, "api/auth/me/", &[])?;
        decode(self.send(req)?)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> ApiResult<RequestBuilder> {
        let mut url = self.base_url.join(path.trim_start_matches('/'))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        tracing::debug!(%method, %url, "api request");
        let mut req = self
            .http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(ACCEPT, "application/json");
        if let Some(token) = self.token_provider.token() {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        Ok(req)
    }

    fn send(&self, req: RequestBuilder) -> ApiResult<Response> {
        let resp = req.send()?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().unwrap_or_default();
        tracing::debug!(%status, "api request failed");
        match status {
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            StatusCode::FORBIDDEN => Err(ApiError::Forbidden),
            _ if status.is_client_error() => match parse_violations(&body) {
                Some(violations) => Err(ApiError::Rejected(violations)),
                None => Err(ApiError::Status { status, body }),
            },
            _ => Err(ApiError::Status { status, body }),
        }
    }
}

fn decode<T: DeserializeOwned>(resp: Response) -> ApiResult<T> {
    let body = resp.text()?;
    Ok(serde_json::from_str(&body)?)
}

/// A rejection body is a bare array of `{id, description}` objects.
fn parse_violations(body: &str) -> Option<Vec<Violation>> {
    serde_json::from_str::<Vec<Violation>>(body).ok()
}

fn describe_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.description.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn status_message(body: &str) -> String {
    server_message(body).unwrap_or_else(|| body.trim().to_string())
}

/// Flattens the usual error envelopes (`{"detail": ..}`, field -> messages, bare strings).
fn server_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value {
        Value::String(text) => Some(text),
        Value::Object(map) => {
            if let Some(Value::String(detail)) = map.get("detail") {
                return Some(detail.clone());
            }
            let parts = map
                .iter()
                .map(|(field, value)| match value {
                    Value::Array(items) => {
                        let joined = items
                            .iter()
                            .map(|item| match item {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect::<Vec<_>>()
                            .join(" ");
                        format!("{}: {}", field, joined)
                    }
                    Value::String(s) => format!("{}: {}", field, s),
                    other => format!("{}: {}", field, other),
                })
                .collect::<Vec<_>>();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("; "))
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PageOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageOptions {
    pub fn window(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
        }
    }

    fn into_params(self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            params.push(("offset".into(), offset.to_string()));
        }
        params
    }
}

#[derive(Serialize)]
struct ContentPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

#[derive(Serialize)]
struct CredentialsPayload<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub id: i64,
    #[serde(default)]
    pub description: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Author {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub user: Author,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub likes_count: u64,
    #[serde(default)]
    pub is_owner: bool,
}

impl Comment {
    pub fn can_modify(&self) -> bool {
        self.is_owner && !self.deleted
    }
}

/// Like toggle outcome. The backend answers either with `{liked, likes_count}`
/// or with the whole comment; both carry the authoritative count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeToggle {
    #[serde(default)]
    pub liked: Option<bool>,
    pub likes_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_price")]
    pub price: Option<String>,
    #[serde(default)]
    pub view_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    #[serde(default)]
    pub avito_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_price")]
    pub price: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Decimal prices arrive as strings, numbers or null.
fn deserialize_price<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub date_joined: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}
