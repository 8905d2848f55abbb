//! OrgMeter REST client.
//!
//! Pages are requested as `GET {base_url}/{path}?page=N&limit=M` with a bearer
//! token. Transient failures (network, 429, 5xx) are retried with exponential
//! backoff; a `Retry-After` header on 429 takes precedence.

use crate::config::toml_config::{FunderConfig, SyncConfig};
use crate::domain::model::{EntityKind, ExtractedPage, RawRecord};
use crate::domain::ports::PageSource;
use crate::utils::error::{ImportError, Result};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub api_key: String,
    pub funder: String,
    pub page_size: u32,
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// Entity kind → URL path segment.
    pub paths: HashMap<EntityKind, String>,
}

impl ClientSettings {
    pub fn for_funder(config: &SyncConfig, funder: &FunderConfig) -> Self {
        let paths = EntityKind::ALL
            .iter()
            .map(|kind| (*kind, config.entity_path(*kind)))
            .collect();

        Self {
            base_url: config.base_url_for(funder).to_string(),
            api_key: funder.api_key.clone(),
            funder: funder.id.clone(),
            page_size: config.orgmeter.page_size,
            timeout: Duration::from_secs(config.orgmeter.timeout_seconds),
            retry_attempts: config.orgmeter.retry_attempts,
            retry_delay: Duration::from_millis(config.orgmeter.retry_delay_ms),
            paths,
        }
    }

    fn url_for(&self, entity: EntityKind) -> String {
        let path = self
            .paths
            .get(&entity)
            .map(String::as_str)
            .unwrap_or_else(|| entity.default_path());
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

pub struct OrgMeterClient {
    client: Client,
    settings: ClientSettings,
}

impl OrgMeterClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("orgmeter-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, settings })
    }

    async fn get_page_json(&self, url: &str, page: u32) -> Result<serde_json::Value> {
        let mut attempt: u32 = 0;

        loop {
            match self.send_once(url, page).await {
                Ok(value) => return Ok(value),
                Err(RequestFailure::Fatal(error)) => return Err(error),
                Err(RequestFailure::Transient { error, retry_after }) => {
                    if attempt >= self.settings.retry_attempts {
                        return Err(error);
                    }
                    let backoff = retry_after.unwrap_or_else(|| {
                        self.settings.retry_delay * 2u32.saturating_pow(attempt)
                    });
                    attempt += 1;
                    tracing::warn!(
                        "⏳ {} page {}: {} (retry {}/{} in {:?})",
                        url,
                        page,
                        error,
                        attempt,
                        self.settings.retry_attempts,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        page: u32,
    ) -> std::result::Result<serde_json::Value, RequestFailure> {
        tracing::debug!("Making API request to: {} (page {})", url, page);

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.settings.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[
                ("page", page.to_string()),
                ("limit", self.settings.page_size.to_string()),
            ])
            .send()
            .await
            .map_err(|e| RequestFailure::classify(e.into(), None))?;

        let status = response.status();
        tracing::debug!("API response status: {}", status);

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RequestFailure::Fatal(ImportError::AuthenticationError {
                funder: self.settings.funder.clone(),
                status: status.as_u16(),
            }));
        }

        if !status.is_success() {
            let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                parse_retry_after(response.headers())
            } else {
                None
            };
            let body = response.text().await.unwrap_or_default();
            let error = ImportError::ApiStatusError {
                status: status.as_u16(),
                url: url.to_string(),
                body: truncate(&body, 200),
            };
            return Err(RequestFailure::classify(error, retry_after));
        }

        let text = response
            .text()
            .await
            .map_err(|e| RequestFailure::classify(e.into(), None))?;

        serde_json::from_str(&text).map_err(|e| {
            RequestFailure::Fatal(ImportError::ResponseFormatError {
                url: url.to_string(),
                message: format!("body is not JSON: {}", e),
            })
        })
    }
}

enum RequestFailure {
    Transient {
        error: ImportError,
        retry_after: Option<Duration>,
    },
    Fatal(ImportError),
}

impl RequestFailure {
    fn classify(error: ImportError, retry_after: Option<Duration>) -> Self {
        if error.is_retryable() {
            RequestFailure::Transient { error, retry_after }
        } else {
            RequestFailure::Fatal(error)
        }
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

/// Splits an OrgMeter list response into items and the total page count, if reported.
pub fn parse_page_body(url: &str, body: serde_json::Value) -> Result<(Vec<RawRecord>, Option<u32>)> {
    match body {
        serde_json::Value::Array(items) => Ok((items, None)),
        serde_json::Value::Object(mut obj) => {
            let total_pages = total_pages_of(&obj);
            for key in ["data", "items", "results"] {
                if let Some(serde_json::Value::Array(items)) = obj.remove(key) {
                    return Ok((items, total_pages));
                }
            }
            Err(ImportError::ResponseFormatError {
                url: url.to_string(),
                message: "object has no data, items or results array".to_string(),
            })
        }
        other => Err(ImportError::ResponseFormatError {
            url: url.to_string(),
            message: format!("expected an array or object, got {}", json_type(&other)),
        }),
    }
}

fn total_pages_of(obj: &serde_json::Map<String, serde_json::Value>) -> Option<u32> {
    let lookups: [(&str, &str); 3] = [
        ("pagination", "total_pages"),
        ("pagination", "pages"),
        ("meta", "last_page"),
    ];

    lookups
        .iter()
        .find_map(|(outer, inner)| obj.get(*outer).and_then(|v| v.get(*inner)))
        .or_else(|| obj.get("total_pages"))
        .or_else(|| obj.get("last_page"))
        .and_then(|v| v.as_u64())
        .and_then(|n| u32::try_from(n).ok())
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl PageSource for OrgMeterClient {
    async fn fetch_page(&self, entity: EntityKind, page: u32) -> Result<ExtractedPage> {
        let url = self.settings.url_for(entity);
        let body = self.get_page_json(&url, page).await?;
        let (records, total_pages) = parse_page_body(&url, body)?;

        let short_page = records.len() < self.settings.page_size as usize;
        let past_total = total_pages.is_some_and(|total| page >= total);
        let is_last = records.is_empty() || short_page || past_total;

        tracing::debug!(
            "📡 {} {} page {}: {} records (total pages: {:?}, last: {})",
            self.settings.funder,
            entity,
            page,
            records.len(),
            total_pages,
            is_last
        );

        Ok(ExtractedPage {
            page,
            records,
            total_pages,
            is_last,
        })
    }
}
