//! Client for the paginated timeseries endpoint.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::{debug, warn};

use vitals_types::{Sample, rfc3339_to_ms};

use crate::error::{Error, Result};
use crate::retry::{RetryConfig, with_retry};

/// One page of samples from the remote API.
#[derive(Debug, Clone)]
pub struct Page {
    /// Normalized samples, already filtered for data quality.
    pub samples: Vec<Sample>,
    /// Cursor for the next page within the same window. `None` is
    /// authoritative for "no more pages", regardless of any `has_more`
    /// flag the backend also sends.
    pub next_cursor: Option<String>,
    /// Raw samples dropped for data-quality reasons (missing name, bad
    /// timestamp, null/NaN/infinite value, filtered point).
    pub skipped: usize,
}

/// Remote timeseries source.
///
/// Workers take this trait instead of [`ApiClient`] so tests can script
/// pages, cursors, and failures without a network.
#[async_trait]
pub trait TimeseriesApi: Send + Sync {
    /// Fetch one page of the window `[start, end]` (RFC 3339 UTC strings).
    ///
    /// `point_names` restricts the result to the given points; an empty
    /// slice means unfiltered.
    async fn fetch_page(
        &self,
        site: &str,
        start: &str,
        end: &str,
        cursor: Option<&str>,
        point_names: &[String],
    ) -> Result<Page>;

    /// List site names known to the remote API.
    async fn list_sites(&self) -> Result<Vec<String>>;
}

/// Construction parameters for [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// API base URL, e.g. `https://flightdeck.example.cloud/api`.
    pub base_url: String,
    /// Bearer token.
    pub token: String,
    /// Samples per page requested from the paginated endpoint.
    pub page_size: usize,
    /// Largest point-name filter sent on the wire. Beyond this the filter
    /// is omitted from the request and applied client-side, since the
    /// backend rejects oversized point lists.
    pub point_chunk_size: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            page_size: 5000,
            point_chunk_size: 400,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client for the remote timeseries API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    page_size: usize,
    point_chunk_size: usize,
}

impl ApiClient {
    /// Build a client. The bearer token is installed as a default header so
    /// every request carries it; the header name is the lowercase
    /// `authorization` the backend expects.
    pub fn new(config: ApiClientConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(Error::InvalidUrl("base URL is empty".to_string()));
        }

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|e| Error::InvalidToken(e.to_string()))?;
        headers.insert(HeaderName::from_static("authorization"), bearer);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            point_chunk_size: config.point_chunk_size,
        })
    }

    async fn fetch_page_once(
        &self,
        site: &str,
        start: &str,
        end: &str,
        cursor: Option<&str>,
        point_names: &[String],
    ) -> Result<Page> {
        let url = format!("{}/sites/{}/timeseries/paginated", self.base_url, site);

        let page_size = self.page_size.to_string();
        let mut params: Vec<(&str, String)> = vec![
            ("start_time", start.to_string()),
            ("end_time", end.to_string()),
            ("page_size", page_size),
            ("raw_data", "true".to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }

        // Small filters ride along as a query parameter. Oversized ones are
        // omitted from the request and applied after parsing, because the
        // backend rejects unfiltered point lists at scale.
        let post_filter = if point_names.is_empty() {
            None
        } else if point_names.len() <= self.point_chunk_size {
            params.push(("point_names", point_names.join(",")));
            None
        } else {
            Some(point_names.iter().cloned().collect::<HashSet<_>>())
        };

        debug!("fetching page: site={}, cursor={:?}", site, cursor);
        let response = self.http.get(&url).query(&params).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let raw: RawPage = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        let page = parse_page(site, raw, post_filter.as_ref());
        if page.skipped > 0 {
            warn!("skipped {} invalid samples for {}", page.skipped, site);
        }
        Ok(page)
    }
}

#[async_trait]
impl TimeseriesApi for ApiClient {
    async fn fetch_page(
        &self,
        site: &str,
        start: &str,
        end: &str,
        cursor: Option<&str>,
        point_names: &[String],
    ) -> Result<Page> {
        with_retry(&RetryConfig::for_fetch(), "fetch_page", || {
            self.fetch_page_once(site, start, end, cursor, point_names)
        })
        .await
    }

    async fn list_sites(&self) -> Result<Vec<String>> {
        let url = format!("{}/sites", self.base_url);
        let op = || async {
            let response = self.http.get(&url).send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Http {
                    status: status.as_u16(),
                    body: body.chars().take(200).collect(),
                });
            }
            let raw: RawSites = response
                .json()
                .await
                .map_err(|e| Error::InvalidResponse(e.to_string()))?;
            Ok(raw.sites.into_iter().filter_map(|s| s.name).collect())
        };
        with_retry(&RetryConfig::for_fetch(), "list_sites", op).await
    }
}

#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(default)]
    point_samples: Vec<RawSample>,
    #[serde(default)]
    next_cursor: Option<String>,
    // The backend also sends `has_more`; `next_cursor` is authoritative
    // when they disagree, so it is not even deserialized.
}

/// The backend is inconsistent about field names across endpoint variants;
/// accept all the spellings seen in the wild.
#[derive(Debug, Deserialize)]
struct RawSample {
    #[serde(alias = "point", alias = "point_name")]
    name: Option<String>,
    #[serde(alias = "timestamp", alias = "ts")]
    time: Option<serde_json::Value>,
    value: Option<serde_json::Value>,
}

fn parse_page(site: &str, raw: RawPage, post_filter: Option<&HashSet<String>>) -> Page {
    let mut samples = Vec::with_capacity(raw.point_samples.len());
    let mut skipped = 0usize;

    for raw_sample in raw.point_samples {
        let Some(name) = raw_sample.name.filter(|n| !n.is_empty()) else {
            skipped += 1;
            continue;
        };
        if let Some(filter) = post_filter {
            if !filter.contains(&name) {
                skipped += 1;
                continue;
            }
        }
        let Some(ts) = raw_sample.time.as_ref().and_then(parse_timestamp_ms) else {
            skipped += 1;
            continue;
        };
        let Some(value) = raw_sample.value.as_ref().and_then(parse_value) else {
            skipped += 1;
            continue;
        };
        samples.push(Sample::new(site, name, ts, value));
    }

    Page {
        samples,
        next_cursor: raw.next_cursor.filter(|c| !c.is_empty()),
        skipped,
    }
}

/// Parse a timestamp value: integers are milliseconds since the epoch,
/// strings are RFC 3339.
fn parse_timestamp_ms(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => rfc3339_to_ms(s).ok(),
        _ => None,
    }
}

/// Parse a sample value, rejecting anything non-numeric or non-finite.
fn parse_value(value: &serde_json::Value) -> Option<f64> {
    let v = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if matches!(
                trimmed.to_ascii_lowercase().as_str(),
                "nan" | "inf" | "+inf" | "-inf" | "infinity"
            ) {
                return None;
            }
            trimmed.parse::<f64>().ok()?
        }
        serde_json::Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => return None,
    };
    v.is_finite().then_some(v)
}

#[derive(Debug, Deserialize)]
struct RawSites {
    #[serde(default)]
    sites: Vec<RawSite>,
}

#[derive(Debug, Deserialize)]
struct RawSite {
    name: Option<String>,
}
