//! Upstream usage source.
//!
//! [`ConsoleClient`] reads apps and per-model token costs from the Dify
//! console API. It logs in lazily with the configured credentials and keeps
//! the access token to itself; a 401 triggers one re-login and retry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use exporter_config::SourceConfig;
use exporter_transform::AppTokenCostRow;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SourceError;

/// An upstream app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: Option<String>,
}

/// Token cost query for one app over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCostQuery {
    pub app_id: String,
    pub app_name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TokenCostQuery {
    pub fn new(app: &AppInfo, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            app_id: app.id.clone(),
            app_name: app.name.clone(),
            start,
            end,
        }
    }
}

/// Where usage rows come from.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// All apps visible to the exporter account.
    async fn fetch_apps(&self) -> Result<Vec<AppInfo>, SourceError>;

    /// Per-day, per-model usage rows for one app.
    async fn fetch_app_token_costs(
        &self,
        query: &TokenCostQuery,
    ) -> Result<Vec<AppTokenCostRow>, SourceError>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
    remember_me: bool,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    result: String,
    data: Option<LoginData>,
}

/// Newer consoles return a token pair, older ones a bare token.
#[derive(Deserialize)]
#[serde(untagged)]
enum LoginData {
    Tokens { access_token: String },
    Bare(String),
}

impl LoginData {
    fn into_access_token(self) -> String {
        match self {
            Self::Tokens { access_token } => access_token,
            Self::Bare(token) => token,
        }
    }
}

#[derive(Deserialize)]
struct AppsPage {
    #[serde(default)]
    data: Vec<AppInfo>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Deserialize)]
struct CostRowsPage {
    #[serde(default)]
    data: Vec<CostRow>,
}

/// A cost row as returned by the console; app identity comes from the query.
#[derive(Deserialize)]
struct CostRow {
    date: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    user_type: Option<String>,
    model_provider: String,
    model_name: String,
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
    #[serde(default, deserialize_with = "price_string")]
    prompt_price: String,
    #[serde(default, deserialize_with = "price_string")]
    completion_price: String,
    #[serde(default, deserialize_with = "price_string")]
    total_price: String,
    #[serde(default)]
    currency: Option<String>,
}

impl CostRow {
    fn into_row(self, query: &TokenCostQuery) -> AppTokenCostRow {
        AppTokenCostRow {
            date: self.date,
            app_id: query.app_id.clone(),
            app_name: query.app_name.clone(),
            user_id: self.user_id,
            user_type: self.user_type,
            model_provider: self.model_provider,
            model_name: self.model_name,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            prompt_price: self.prompt_price,
            completion_price: self.completion_price,
            total_price: self.total_price,
            currency: self.currency.unwrap_or_else(|| "USD".to_string()),
        }
    }
}

/// Prices arrive as decimal strings or JSON numbers; keep them as text.
fn price_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Dify console API client.
pub struct ConsoleClient {
    client: reqwest::Client,
    base_url: Url,
    email: String,
    password: String,
    page_size: u32,
    access_token: Mutex<Option<String>>,
}

impl std::fmt::Debug for ConsoleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleClient")
            .field("base_url", &self.base_url.as_str())
            .field("email", &self.email)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl ConsoleClient {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let base_url = Url::parse(config.base_url.trim())
            .map_err(|e| SourceError::Client(format!("invalid console URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SourceError::Client(format!(
                "invalid console URL: {}",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SourceError::Client(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            email: config.email.clone(),
            password: config.password.expose().to_string(),
            page_size: config.page_size.max(1),
            access_token: Mutex::new(None),
        })
    }

    /// `{base}/console/api/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| SourceError::Client("console URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["console", "api"])
            .extend(segments);
        Ok(url)
    }

    async fn login(&self) -> Result<String, SourceError> {
        let url = self.endpoint(&["login"])?;
        info!(url = %url, email = %self.email, "logging in to console");

        let response = self
            .client
            .post(url.clone())
            .json(&LoginRequest {
                email: &self.email,
                password: &self.password,
                remember_me: true,
            })
            .send()
            .await
            .map_err(|e| SourceError::request(url.as_str(), &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Login(format!("HTTP {}: {}", status.as_u16(), body.trim())));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| SourceError::decode(url.as_str(), e))?;
        if login.result != "success" {
            return Err(SourceError::Login(format!("result {:?}", login.result)));
        }
        login
            .data
            .map(LoginData::into_access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| SourceError::Login("no access token in response".to_string()))
    }

    /// Current access token, logging in if there is none.
    async fn token(&self) -> Result<String, SourceError> {
        let mut guard = self.access_token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn invalidate(&self, stale: &str) {
        let mut guard = self.access_token.lock().await;
        if guard.as_deref() == Some(stale) {
            *guard = None;
        }
    }

    /// Authenticated GET, re-logging in once on 401.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        for attempt in 0..2 {
            let token = self.token().await?;
            let response = self
                .client
                .get(url.clone())
                .bearer_auth(&token)
                .query(query)
                .send()
                .await
                .map_err(|e| SourceError::request(url.as_str(), &e))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                warn!(url = %url, attempt, "console session expired");
                self.invalidate(&token).await;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body: body.trim().to_string(),
                });
            }
            return response
                .json()
                .await
                .map_err(|e| SourceError::decode(url.as_str(), e));
        }
        Err(SourceError::Unauthorized)
    }
}

#[async_trait]
impl UsageSource for ConsoleClient {
    async fn fetch_apps(&self) -> Result<Vec<AppInfo>, SourceError> {
        let url = self.endpoint(&["apps"])?;
        let mut apps = Vec::new();
        let mut page = 1u32;

        loop {
            let query = [("page", page.to_string()), ("limit", self.page_size.to_string())];
            let body: AppsPage = self.get_json(url.clone(), &query).await?;
            let fetched = body.data.len();
            apps.extend(body.data);

            if !body.has_more || fetched == 0 {
                break;
            }
            page += 1;
        }

        debug!(apps = apps.len(), pages = page, "fetched console apps");
        Ok(apps)
    }

    async fn fetch_app_token_costs(
        &self,
        query: &TokenCostQuery,
    ) -> Result<Vec<AppTokenCostRow>, SourceError> {
        let url = self.endpoint(&["apps", &query.app_id, "statistics", "model-token-costs"])?;
        let params = [
            ("start", format!("{} 00:00", query.start.format("%Y-%m-%d"))),
            ("end", format!("{} 00:00", query.end.format("%Y-%m-%d"))),
        ];

        let body: CostRowsPage = self.get_json(url, &params).await?;
        let rows: Vec<AppTokenCostRow> = body.data.into_iter().map(|r| r.into_row(query)).collect();

        debug!(app_id = %query.app_id, rows = rows.len(), "fetched token costs");
        Ok(rows)
    }
}
