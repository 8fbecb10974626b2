//! Source adapters: the paginated calendar crawler and the remote
//! classification model client.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evsync_core::Event;
use evsync_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

mod model;

pub use model::{strip_code_fence, AnthropicClient, ClassificationModel, CompletionRequest, ModelError};

pub const CRATE_NAME: &str = "evsync-adapters";

pub const DEFAULT_CALENDAR_API_BASE: &str = "https://api2.luma.com";
pub const DEFAULT_CALENDAR_API_ID: &str = "cal-4dWxlBFjW9Cd6ou";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Past,
    Future,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Past => "past",
            Period::Future => "future",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarApiEvent {
    #[serde(default)]
    pub api_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub start_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarApiEntry {
    pub event: CalendarApiEvent,
    #[serde(default, deserialize_with = "lenient_guest_count")]
    pub guest_count: Option<u32>,
}

/// Negative, fractional or non-numeric counts read as absent.
fn lenient_guest_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(serde_json::Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX)))
}

/// Entries stay raw so one malformed record cannot fail the whole page.
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarApiPage {
    #[serde(default)]
    pub entries: Vec<serde_json::Value>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("entry {name:?} has unparseable start_at {start_at:?}")]
    InvalidStartTime { name: String, start_at: String },
    #[error("malformed calendar entry: {0}")]
    MalformedEntry(String),
    #[error("invalid calendar api base {0:?}")]
    InvalidBaseUrl(String),
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("page consumer failed: {0:#}")]
    Sink(anyhow::Error),
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

pub fn parse_entry(entry: &CalendarApiEntry) -> Result<Event, AdapterError> {
    let evt = &entry.event;
    let start_time = DateTime::parse_from_rfc3339(evt.start_at.trim())
        .map_err(|_| AdapterError::InvalidStartTime {
            name: evt.name.clone(),
            start_at: evt.start_at.clone(),
        })?
        .with_timezone(&Utc);

    let mut event = Event::new(evt.name.clone(), start_time).with_guest_count(entry.guest_count.unwrap_or(0));
    event.external_id = non_empty(evt.api_id.as_deref());
    event.description = non_empty(evt.description.as_deref());
    Ok(event)
}

/// Decode one raw page entry; shape errors become [`AdapterError::MalformedEntry`].
pub fn decode_entry(raw: &serde_json::Value) -> Result<Event, AdapterError> {
    let entry: CalendarApiEntry =
        serde_json::from_value(raw.clone()).map_err(|err| AdapterError::MalformedEntry(err.to_string()))?;
    parse_entry(&entry)
}

/// Keys seen during one crawl.
///
/// Accepting an event marks both its identity key and its composite key, so a
/// later record with a *different* external id but the same title and start
/// time is treated as a duplicate.
#[derive(Debug, Default)]
pub struct SeenKeys {
    keys: HashSet<String>,
}

impl SeenKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and marks the event's keys when neither was seen before.
    pub fn admit(&mut self, event: &Event) -> bool {
        let identity = event.identity_key().to_string();
        let composite = event.composite_key();
        if self.keys.contains(&identity) || self.keys.contains(&composite) {
            return false;
        }
        self.keys.insert(identity);
        self.keys.insert(composite);
        true
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Consumer of accepted pages. Awaited before the next page is requested.
#[async_trait]
pub trait PageSink: Send {
    async fn on_page(&mut self, events: &[Event]) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopPageSink;

#[async_trait]
impl PageSink for NoopPageSink {
    async fn on_page(&mut self, _events: &[Event]) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CalendarSourceConfig {
    pub api_base: String,
    pub calendar_api_id: String,
    pub page_size: u32,
    pub periods: Vec<Period>,
    pub page_delay: Duration,
}

impl Default for CalendarSourceConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_CALENDAR_API_BASE.to_string(),
            calendar_api_id: DEFAULT_CALENDAR_API_ID.to_string(),
            page_size: 50,
            periods: vec![Period::Past],
            page_delay: Duration::from_millis(200),
        }
    }
}

pub struct CalendarCrawler {
    http: HttpFetcher,
    config: CalendarSourceConfig,
}

impl CalendarCrawler {
    pub fn new(http: HttpFetcher, config: CalendarSourceConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &CalendarSourceConfig {
        &self.config
    }

    pub fn page_url(&self, period: Period, cursor: Option<&str>) -> Result<String, AdapterError> {
        let base = format!("{}/calendar/get-items", self.config.api_base.trim_end_matches('/'));
        let mut url = reqwest::Url::parse(&base)
            .map_err(|_| AdapterError::InvalidBaseUrl(self.config.api_base.clone()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("calendar_api_id", &self.config.calendar_api_id)
                .append_pair("pagination_limit", &self.config.page_size.to_string())
                .append_pair("period", period.as_str());
            if let Some(cursor) = cursor {
                query.append_pair("pagination_cursor", cursor);
            }
        }
        Ok(url.to_string())
    }

    /// Walk every configured period and return the accepted events sorted by
    /// ascending start time. Each non-empty page is handed to `sink` first.
    pub async fn crawl(
        &self,
        after: Option<DateTime<Utc>>,
        sink: &mut dyn PageSink,
    ) -> Result<Vec<Event>, CrawlError> {
        let mut seen = SeenKeys::new();
        let mut results = Vec::new();

        for period in &self.config.periods {
            self.crawl_period(*period, after, &mut seen, &mut results, sink)
                .await?;
        }

        results.sort_by_key(|e| e.start_time);
        info!(total = results.len(), "calendar crawl complete");
        Ok(results)
    }

    async fn crawl_period(
        &self,
        period: Period,
        after: Option<DateTime<Utc>>,
        seen: &mut SeenKeys,
        results: &mut Vec<Event>,
        sink: &mut dyn PageSink,
    ) -> Result<(), CrawlError> {
        let mut cursor: Option<String> = None;

        loop {
            let url = self.page_url(period, cursor.as_deref())?;
            info!(period = period.as_str(), %url, "fetching calendar page");
            let page: CalendarApiPage = self.http.fetch_json(&url).await?.body;

            let mut accepted = Vec::new();
            for entry in &page.entries {
                let event = match decode_entry(entry) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "dropping calendar entry");
                        continue;
                    }
                };
                if after.is_some_and(|cutoff| event.start_time <= cutoff) {
                    continue;
                }
                if seen.admit(&event) {
                    accepted.push(event);
                }
            }

            results.extend(accepted.iter().cloned());
            info!(
                entries = page.entries.len(),
                new = accepted.len(),
                total = results.len(),
                "calendar page processed"
            );

            if !accepted.is_empty() {
                sink.on_page(&accepted).await.map_err(CrawlError::Sink)?;
            }

            match page.next_cursor {
                Some(next) if page.has_more && !next.is_empty() => cursor = Some(next),
                _ => break,
            }

            if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        Ok(())
    }
}
