//! Core domain model for evsync: events, identity keys, sync cursor,
//! batch checkpoints and the cached stats snapshot.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evsync-core";

/// Settings key holding the RFC 3339 timestamp of the newest event seen by a completed sync.
pub const SETTING_LAST_FETCHED_DATE: &str = "luma_last_fetched_date";
/// Settings key holding the serialized [`StatsSnapshot`].
pub const SETTING_EVENT_STATS_CACHE: &str = "event_stats_cache";

/// Closed set of event categories. Serialized by display label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum EventCategory {
    #[serde(rename = "Education & Learning")]
    EducationLearning,
    #[serde(rename = "Fitness & Sports")]
    FitnessSports,
    #[serde(rename = "Health & Wellness")]
    HealthWellness,
    #[serde(rename = "Social & Community")]
    SocialCommunity,
    #[serde(rename = "Business & Startups")]
    BusinessStartups,
    #[serde(rename = "AI & Data")]
    AiData,
    #[serde(rename = "Tech & Engineering")]
    TechEngineering,
    #[serde(rename = "Creative & Arts")]
    CreativeArts,
    #[serde(rename = "Outdoor & Adventure")]
    OutdoorAdventure,
    #[serde(rename = "Governance & Policy")]
    GovernancePolicy,
    #[serde(rename = "Conference & Summit")]
    ConferenceSummit,
    #[serde(rename = "Food & Dining")]
    FoodDining,
    #[default]
    #[serde(rename = "Other")]
    Other,
}

impl EventCategory {
    pub const ALL: [EventCategory; 13] = [
        EventCategory::EducationLearning,
        EventCategory::FitnessSports,
        EventCategory::HealthWellness,
        EventCategory::SocialCommunity,
        EventCategory::BusinessStartups,
        EventCategory::AiData,
        EventCategory::TechEngineering,
        EventCategory::CreativeArts,
        EventCategory::OutdoorAdventure,
        EventCategory::GovernancePolicy,
        EventCategory::ConferenceSummit,
        EventCategory::FoodDining,
        EventCategory::Other,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EventCategory::EducationLearning => "Education & Learning",
            EventCategory::FitnessSports => "Fitness & Sports",
            EventCategory::HealthWellness => "Health & Wellness",
            EventCategory::SocialCommunity => "Social & Community",
            EventCategory::BusinessStartups => "Business & Startups",
            EventCategory::AiData => "AI & Data",
            EventCategory::TechEngineering => "Tech & Engineering",
            EventCategory::CreativeArts => "Creative & Arts",
            EventCategory::OutdoorAdventure => "Outdoor & Adventure",
            EventCategory::GovernancePolicy => "Governance & Policy",
            EventCategory::ConferenceSummit => "Conference & Summit",
            EventCategory::FoodDining => "Food & Dining",
            EventCategory::Other => "Other",
        }
    }

    /// Exact label match against the enumeration.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.label() == label)
    }

    /// Like [`EventCategory::from_label`] but unknown labels fall back to `Other`.
    pub fn coerce(label: &str) -> Self {
        Self::from_label(label.trim()).unwrap_or(EventCategory::Other)
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Composite identity used when an event carries no external id.
pub fn composite_key(title: &str, start_time: DateTime<Utc>) -> String {
    format!(
        "{}|{}",
        title,
        start_time.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Identity of an event: the source's own id when present, else `title|start_time`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKey {
    External(String),
    Composite(String),
}

impl EventKey {
    pub fn as_str(&self) -> &str {
        match self {
            EventKey::External(id) => id,
            EventKey::Composite(key) => key,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An occurrence fetched from the calendar source, before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub external_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub guest_count: u32,
    #[serde(default)]
    pub category: EventCategory,
}

impl Event {
    pub fn new(title: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            external_id: None,
            title: title.into(),
            description: None,
            start_time,
            guest_count: 0,
            category: EventCategory::Other,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_guest_count(mut self, guest_count: u32) -> Self {
        self.guest_count = guest_count;
        self
    }

    pub fn identity_key(&self) -> EventKey {
        match &self.external_id {
            Some(id) => EventKey::External(id.clone()),
            None => EventKey::Composite(self.composite_key()),
        }
    }

    /// Always the `title|start_time` key, even when an external id exists.
    pub fn composite_key(&self) -> String {
        composite_key(&self.title, self.start_time)
    }
}

/// A persisted event row. `category` is free text: storage may hold labels
/// that are no longer part of [`EventCategory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub guest_count: u32,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn identity_key(&self) -> EventKey {
        match &self.external_id {
            Some(id) => EventKey::External(id.clone()),
            None => EventKey::Composite(composite_key(&self.title, self.start_time)),
        }
    }
}

/// Newest event timestamp observed by completed sync runs; `None` means full sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    pub last_fetched: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn full() -> Self {
        Self { last_fetched: None }
    }

    pub fn at(last_fetched: DateTime<Utc>) -> Self {
        Self {
            last_fetched: Some(last_fetched),
        }
    }

    /// Cursor after a completed crawl, or `None` when nothing was fetched.
    pub fn advanced_by(&self, events: &[Event]) -> Option<SyncCursor> {
        let newest = events.iter().map(|e| e.start_time).max()?;
        let next = match self.last_fetched {
            Some(current) if current > newest => current,
            _ => newest,
        };
        Some(SyncCursor::at(next))
    }

    pub fn encode(&self) -> Option<String> {
        self.last_fetched
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Unparseable stored values decode as a full-sync cursor.
    pub fn decode(raw: Option<&str>) -> Self {
        let last_fetched = raw
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|t| t.with_timezone(&Utc));
        Self { last_fetched }
    }
}

/// Resume point of a batch pipeline plus whatever it has accumulated so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress<A> {
    pub next_index: usize,
    pub accumulator: A,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthBucket {
    pub month: String,
    pub total: u64,
    #[serde(flatten)]
    pub categories: BTreeMap<String, u64>,
}

impl MonthBucket {
    pub fn empty(month: impl Into<String>) -> Self {
        Self {
            month: month.into(),
            total: 0,
            categories: EventCategory::ALL
                .iter()
                .map(|c| (c.label().to_string(), 0))
                .collect(),
        }
    }

    pub fn category(&self, category: EventCategory) -> u64 {
        self.categories.get(category.label()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayBucket {
    pub date: String,
    pub total: u64,
}

/// Derived cache of event rollups. Always rebuilt whole, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub monthly_data: Vec<MonthBucket>,
    pub daily_data: Vec<DayBucket>,
    pub category_totals: Vec<(String, u64)>,
    pub total_events: u64,
    pub total_registrations: u64,
    pub monthly_registration_data: Vec<MonthBucket>,
    pub daily_registration_data: Vec<DayBucket>,
    pub category_registration_totals: Vec<(String, u64)>,
    pub last_updated: DateTime<Utc>,
}

impl StatsSnapshot {
    pub fn month(&self, month: &str) -> Option<&MonthBucket> {
        self.monthly_data.iter().find(|m| m.month == month)
    }

    pub fn registration_month(&self, month: &str) -> Option<&MonthBucket> {
        self.monthly_registration_data
            .iter()
            .find(|m| m.month == month)
    }
}

/// One row of a community chat export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChatMessage {
    #[serde(rename = "AuthorID", default)]
    pub author_id: String,
    #[serde(rename = "Author", default)]
    pub author: String,
    #[serde(rename = "Date", default)]
    pub date: String,
    #[serde(rename = "Content", default)]
    pub content: String,
    #[serde(rename = "Attachments", default)]
    pub attachments: String,
    #[serde(rename = "Reactions", default)]
    pub reactions: String,
}

impl ChatMessage {
    /// `YYYY-MM-DD` part of the message timestamp, if any.
    pub fn day(&self) -> Option<&str> {
        let day = self.date.split('T').next().unwrap_or_default().trim();
        if day.is_empty() {
            None
        } else {
            Some(day)
        }
    }
}
