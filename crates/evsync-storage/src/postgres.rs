use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evsync_core::{Event, EventRecord};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::store::{EventStore, SettingsStore, UpsertOutcome};

const UPSERT_BY_EXTERNAL_ID: &str = r#"
    INSERT INTO events (id, external_id, title, description, start_time, guest_count, category)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (external_id) WHERE external_id IS NOT NULL
    DO UPDATE SET guest_count = GREATEST(events.guest_count, EXCLUDED.guest_count),
                  updated_at = NOW()
    RETURNING (xmax = 0) AS inserted
"#;

const UPSERT_BY_COMPOSITE_KEY: &str = r#"
    INSERT INTO events (id, external_id, title, description, start_time, guest_count, category)
    VALUES ($1, NULL, $2, $3, $4, $5, $6)
    ON CONFLICT (title, start_time) WHERE external_id IS NULL
    DO UPDATE SET guest_count = GREATEST(events.guest_count, EXCLUDED.guest_count),
                  updated_at = NOW()
    RETURNING (xmax = 0) AS inserted
"#;

/// Postgres-backed event and settings store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("migrations applied");
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> anyhow::Result<EventRecord> {
    let guest_count: i64 = row.try_get("guest_count")?;
    Ok(EventRecord {
        id: row.try_get::<Uuid, _>("id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        start_time: row.try_get::<DateTime<Utc>, _>("start_time")?,
        guest_count: u32::try_from(guest_count)
            .with_context(|| format!("guest_count {guest_count} out of range"))?,
        category: row.try_get("category")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl EventStore for PgStore {
    async fn upsert_by_external_id(&self, events: &[Event]) -> anyhow::Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await.context("opening upsert transaction")?;
        let mut outcome = UpsertOutcome::default();
        for event in events {
            let Some(external_id) = event.external_id.as_deref() else {
                anyhow::bail!("event {:?} has no external id", event.title);
            };
            let row = sqlx::query(UPSERT_BY_EXTERNAL_ID)
                .bind(Uuid::new_v4())
                .bind(external_id)
                .bind(&event.title)
                .bind(event.description.as_deref())
                .bind(event.start_time)
                .bind(i64::from(event.guest_count))
                .bind(event.category.label())
                .fetch_one(&mut *tx)
                .await
                .with_context(|| format!("upserting event {external_id}"))?;
            if row.try_get::<bool, _>("inserted")? {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }
        tx.commit().await.context("committing upsert transaction")?;
        Ok(outcome)
    }

    async fn upsert_by_composite_key(&self, events: &[Event]) -> anyhow::Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await.context("opening upsert transaction")?;
        let mut outcome = UpsertOutcome::default();
        for event in events {
            let row = sqlx::query(UPSERT_BY_COMPOSITE_KEY)
                .bind(Uuid::new_v4())
                .bind(&event.title)
                .bind(event.description.as_deref())
                .bind(event.start_time)
                .bind(i64::from(event.guest_count))
                .bind(event.category.label())
                .fetch_one(&mut *tx)
                .await
                .with_context(|| format!("upserting event {}", event.composite_key()))?;
            if row.try_get::<bool, _>("inserted")? {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }
        tx.commit().await.context("committing upsert transaction")?;
        Ok(outcome)
    }

    async fn all_events(&self) -> anyhow::Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, title, description, start_time, guest_count,
                   category, created_at, updated_at
              FROM events
             ORDER BY start_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("scanning events")?;

        rows.iter().map(record_from_row).collect()
    }

    async fn existing_keys(&self) -> anyhow::Result<HashSet<String>> {
        let rows = sqlx::query("SELECT external_id, title, start_time FROM events")
            .fetch_all(&self.pool)
            .await
            .context("loading event keys")?;

        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            let external_id: Option<String> = row.try_get("external_id")?;
            let key = match external_id {
                Some(id) => id,
                None => {
                    let title: String = row.try_get("title")?;
                    let start_time: DateTime<Utc> = row.try_get("start_time")?;
                    evsync_core::composite_key(&title, start_time)
                }
            };
            keys.insert(key);
        }
        Ok(keys)
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading setting {key}"))?;
        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .map_err(Into::into)
    }

    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing setting {key}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Connects and migrates when `DATABASE_URL` points at a scratch database.
    async fn scratch_store() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PgStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        Some(store)
    }

    async fn delete_run_rows(store: &PgStore, marker: &str) {
        sqlx::query("DELETE FROM events WHERE title LIKE $1")
            .bind(format!("{marker}%"))
            .execute(store.pool())
            .await
            .expect("cleanup");
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a scratch postgres"]
    async fn partial_index_upserts_count_inserts_and_keep_larger_guest_count() {
        let Some(store) = scratch_store().await else {
            return;
        };
        let marker = format!("pg-test-{}", Uuid::new_v4());
        let at = Utc.with_ymd_and_hms(2025, 5, 1, 18, 0, 0).single().unwrap();
        let external_id = format!("{marker}-evt");

        let keyed = Event::new(format!("{marker} Meetup"), at)
            .with_external_id(external_id.clone())
            .with_guest_count(5);
        let unkeyed = Event::new(format!("{marker} Meetup"), at).with_guest_count(2);

        let first = store.upsert_by_external_id(&[keyed.clone()]).await.unwrap();
        assert_eq!(first, UpsertOutcome { inserted: 1, updated: 0 });
        // Same title and time without an external id is a separate row.
        let composite = store.upsert_by_composite_key(&[unkeyed.clone()]).await.unwrap();
        assert_eq!(composite, UpsertOutcome { inserted: 1, updated: 0 });

        let lower = store
            .upsert_by_external_id(&[keyed.clone().with_guest_count(1)])
            .await
            .unwrap();
        assert_eq!(lower, UpsertOutcome { inserted: 0, updated: 1 });
        let higher = store
            .upsert_by_composite_key(&[unkeyed.with_guest_count(9)])
            .await
            .unwrap();
        assert_eq!(higher, UpsertOutcome { inserted: 0, updated: 1 });

        let rows = store
            .all_events()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.title.starts_with(&marker))
            .collect::<Vec<_>>();
        assert_eq!(rows.len(), 2);
        let by_id = rows.iter().find(|r| r.external_id.is_some()).unwrap();
        let by_key = rows.iter().find(|r| r.external_id.is_none()).unwrap();
        assert_eq!(by_id.guest_count, 5);
        assert_eq!(by_key.guest_count, 9);

        let keys = store.existing_keys().await.unwrap();
        assert!(keys.contains(&external_id));
        assert!(keys.contains(&keyed.composite_key()));

        delete_run_rows(&store, &marker).await;
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a scratch postgres"]
    async fn settings_overwrite_in_place() {
        let Some(store) = scratch_store().await else {
            return;
        };
        let key = format!("pg-test-{}", Uuid::new_v4());

        assert!(store.get_setting(&key).await.unwrap().is_none());
        store.set_setting(&key, "a").await.unwrap();
        store.set_setting(&key, "b").await.unwrap();
        assert_eq!(store.get_setting(&key).await.unwrap().as_deref(), Some("b"));

        sqlx::query("DELETE FROM settings WHERE key = $1")
            .bind(&key)
            .execute(store.pool())
            .await
            .unwrap();
    }
}
