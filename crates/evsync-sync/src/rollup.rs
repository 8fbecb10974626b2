//! Monthly, daily and per-category rollups over the stored event log.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use evsync_core::{DayBucket, EventCategory, EventRecord, MonthBucket, StatsSnapshot, SETTING_EVENT_STATS_CACHE};
use evsync_storage::{EventStore, SettingsStore};
use tracing::{info, warn};

fn sorted_totals(counts: &BTreeMap<EventCategory, u64>) -> Vec<(String, u64)> {
    let mut totals = EventCategory::ALL
        .iter()
        .map(|c| (*c, counts.get(c).copied().unwrap_or(0)))
        .collect::<Vec<_>>();
    // stable: equal counts stay in enumeration order
    totals.sort_by(|a, b| b.1.cmp(&a.1));
    totals
        .into_iter()
        .map(|(c, n)| (c.label().to_string(), n))
        .collect()
}

fn bump(bucket: &mut MonthBucket, category: Option<EventCategory>, by: u64) {
    bucket.total += by;
    if let Some(category) = category {
        *bucket
            .categories
            .entry(category.label().to_string())
            .or_insert(0) += by;
    }
}

/// Single pass over `records`; UTC month (`YYYY-MM`) and day (`YYYY-MM-DD`)
/// buckets, with a guest-count weighted mirror of every series.
pub fn compute_snapshot(records: &[EventRecord], now: DateTime<Utc>) -> StatsSnapshot {
    let mut months: BTreeMap<String, MonthBucket> = BTreeMap::new();
    let mut reg_months: BTreeMap<String, MonthBucket> = BTreeMap::new();
    let mut days: BTreeMap<String, u64> = BTreeMap::new();
    let mut reg_days: BTreeMap<String, u64> = BTreeMap::new();
    let mut category_counts: BTreeMap<EventCategory, u64> = BTreeMap::new();
    let mut category_registrations: BTreeMap<EventCategory, u64> = BTreeMap::new();
    let mut total_registrations = 0u64;

    for record in records {
        let month = record.start_time.format("%Y-%m").to_string();
        let day = record.start_time.format("%Y-%m-%d").to_string();
        let category = EventCategory::from_label(&record.category);
        let guests = u64::from(record.guest_count);

        bump(
            months
                .entry(month.clone())
                .or_insert_with(|| MonthBucket::empty(month.clone())),
            category,
            1,
        );
        bump(
            reg_months
                .entry(month.clone())
                .or_insert_with(|| MonthBucket::empty(month)),
            category,
            guests,
        );
        *days.entry(day.clone()).or_insert(0) += 1;
        *reg_days.entry(day).or_insert(0) += guests;

        if let Some(category) = category {
            *category_counts.entry(category).or_insert(0) += 1;
            *category_registrations.entry(category).or_insert(0) += guests;
        }
        total_registrations += guests;
    }

    let to_days = |m: BTreeMap<String, u64>| {
        m.into_iter()
            .map(|(date, total)| DayBucket { date, total })
            .collect::<Vec<_>>()
    };

    StatsSnapshot {
        monthly_data: months.into_values().collect(),
        daily_data: to_days(days),
        category_totals: sorted_totals(&category_counts),
        total_events: records.len() as u64,
        total_registrations,
        monthly_registration_data: reg_months.into_values().collect(),
        daily_registration_data: to_days(reg_days),
        category_registration_totals: sorted_totals(&category_registrations),
        last_updated: now,
    }
}

/// Reads and rebuilds the cached [`StatsSnapshot`] in the settings store.
#[derive(Clone)]
pub struct StatsCache {
    events: Arc<dyn EventStore>,
    settings: Arc<dyn SettingsStore>,
}

impl StatsCache {
    pub fn new(events: Arc<dyn EventStore>, settings: Arc<dyn SettingsStore>) -> Self {
        Self { events, settings }
    }

    /// Recompute from the full event log and overwrite the cache in one write.
    pub async fn refresh(&self) -> anyhow::Result<StatsSnapshot> {
        let records = self.events.all_events().await.context("loading events for stats")?;
        let snapshot = compute_snapshot(&records, Utc::now());
        let raw = serde_json::to_string(&snapshot).context("serializing stats snapshot")?;
        self.settings
            .set_setting(SETTING_EVENT_STATS_CACHE, &raw)
            .await
            .context("writing stats cache")?;
        info!(
            total_events = snapshot.total_events,
            total_registrations = snapshot.total_registrations,
            months = snapshot.monthly_data.len(),
            "stats cache updated"
        );
        Ok(snapshot)
    }

    pub async fn load(&self) -> anyhow::Result<Option<StatsSnapshot>> {
        let Some(raw) = self.settings.get_setting(SETTING_EVENT_STATS_CACHE).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) => {
                warn!(error = %err, "cached stats snapshot is undecodable");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evsync_core::Event;
    use evsync_storage::MemoryStore;
    use uuid::Uuid;

    fn record(category: &str, guests: u32, day: u32) -> EventRecord {
        let at = Utc.with_ymd_and_hms(2025, 1, day, 23, 30, 0).single().unwrap();
        EventRecord {
            id: Uuid::new_v4(),
            external_id: None,
            title: format!("{category} {day}"),
            description: None,
            start_time: at,
            guest_count: guests,
            category: category.to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn month_and_registration_buckets_agree() {
        let records = vec![
            record("AI & Data", 2, 3),
            record("AI & Data", 3, 3),
            record("AI & Data", 5, 20),
            record("Food & Dining", 0, 31),
        ];
        let snap = compute_snapshot(&records, Utc::now());

        let jan = snap.month("2025-01").unwrap();
        assert_eq!(jan.total, 4);
        assert_eq!(jan.category(EventCategory::AiData), 3);
        assert_eq!(jan.category(EventCategory::FoodDining), 1);

        let reg = snap.registration_month("2025-01").unwrap();
        assert_eq!(reg.total, 10);
        assert_eq!(reg.category(EventCategory::AiData), 10);
        assert_eq!(reg.category(EventCategory::FoodDining), 0);

        assert_eq!(snap.total_events, 4);
        assert_eq!(snap.total_registrations, 10);
        assert_eq!(snap.daily_data[0], DayBucket { date: "2025-01-03".into(), total: 2 });
        assert_eq!(snap.daily_registration_data[0].total, 5);
    }

    #[test]
    fn totals_sort_descending_with_enumeration_tiebreak() {
        let records = vec![
            record("Food & Dining", 1, 1),
            record("Food & Dining", 1, 2),
            record("Fitness & Sports", 9, 3),
            record("Education & Learning", 1, 4),
        ];
        let snap = compute_snapshot(&records, Utc::now());

        assert_eq!(snap.category_totals.len(), EventCategory::ALL.len());
        assert_eq!(snap.category_totals[0], ("Food & Dining".to_string(), 2));
        assert_eq!(snap.category_totals[1], ("Education & Learning".to_string(), 1));
        assert_eq!(snap.category_totals[2], ("Fitness & Sports".to_string(), 1));
        assert_eq!(snap.category_registration_totals[0], ("Fitness & Sports".to_string(), 9));
    }

    #[test]
    fn unrecognized_labels_only_count_towards_total() {
        let snap = compute_snapshot(&[record("Retro Gaming", 4, 9)], Utc::now());
        let jan = snap.month("2025-01").unwrap();

        assert_eq!(jan.total, 1);
        assert_eq!(jan.categories.values().sum::<u64>(), 0);
        assert!(snap.category_totals.iter().all(|(_, n)| *n == 0));
        assert_eq!(snap.total_registrations, 4);
    }

    #[tokio::test]
    async fn refresh_writes_cache_that_load_reads_back() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_by_composite_key(&[Event::new(
                "Coffee",
                Utc.with_ymd_and_hms(2025, 2, 14, 9, 0, 0).single().unwrap(),
            )
            .with_guest_count(6)])
            .await
            .unwrap();
        let cache = StatsCache::new(store.clone(), store.clone());

        assert!(cache.load().await.unwrap().is_none());
        let fresh = cache.refresh().await.unwrap();
        let cached = cache.load().await.unwrap().unwrap();

        assert_eq!(cached, fresh);
        assert_eq!(cached.month("2025-02").unwrap().category(EventCategory::Other), 1);
    }

    #[tokio::test]
    async fn undecodable_cache_reads_as_absent() {
        let store = Arc::new(MemoryStore::new());
        store.set_setting(SETTING_EVENT_STATS_CACHE, "{oops").await.unwrap();
        let cache = StatsCache::new(store.clone(), store);
        assert!(cache.load().await.unwrap().is_none());
    }
}
