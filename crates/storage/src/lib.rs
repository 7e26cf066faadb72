mod error;
mod persistence;
mod ranking;
mod sessions;

use std::str::FromStr;

use anyhow::{Context, Result};
use atlas_core::{ChatSession, ConversationMessage, LlmInteraction, PoiDetail, RankedPoi};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

pub use error::{PersistStep, StorageError};
pub use persistence::{is_domain_specific_reply, SavedInteraction};
pub use ranking::{rank_by_distance, DistanceQuery};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Interaction log plus everything `save_interaction` derives from it.
pub trait InteractionRepository: Send + Sync {
    async fn save_interaction(&self, interaction: &LlmInteraction)
        -> StorageResult<SavedInteraction>;
    async fn save_llm_suggested_pois_batch(
        &self,
        user_id: Uuid,
        interaction_id: Uuid,
        city_id: Option<Uuid>,
        pois: &[PoiDetail],
    ) -> StorageResult<Vec<Uuid>>;
}

pub trait PoiRepository: Send + Sync {
    async fn find_city_id_by_name(&self, name: &str) -> StorageResult<Option<Uuid>>;
    async fn get_or_create_poi(&self, poi: &PoiDetail, city_id: Uuid) -> StorageResult<Uuid>;
    async fn pois_by_distance(&self, query: &DistanceQuery) -> StorageResult<Vec<RankedPoi>>;
}

pub trait ChatSessionRepository: Send + Sync {
    async fn create_session(&self, session: &ChatSession) -> StorageResult<()>;
    async fn load_session(&self, session_id: Uuid) -> StorageResult<Option<ChatSession>>;
    /// Overwrites everything but the history, which only `append_message` writes.
    async fn update_session(&self, session: &ChatSession) -> StorageResult<()>;
    async fn append_message(
        &self,
        session_id: Uuid,
        message: &ConversationMessage,
    ) -> StorageResult<()>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<u64>;
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cities (
      id TEXT PRIMARY KEY,
      name TEXT NOT NULL UNIQUE,
      country TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS llm_interactions (
      id TEXT PRIMARY KEY,
      user_id TEXT NOT NULL,
      session_id TEXT,
      city_name TEXT,
      prompt TEXT NOT NULL,
      response_text TEXT NOT NULL,
      model_name TEXT NOT NULL,
      prompt_tokens INTEGER NOT NULL,
      completion_tokens INTEGER NOT NULL,
      total_tokens INTEGER NOT NULL,
      latency_ms INTEGER NOT NULL,
      reply_domain TEXT,
      log_only INTEGER NOT NULL DEFAULT 0,
      created_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS points_of_interest (
      id TEXT PRIMARY KEY,
      name TEXT NOT NULL,
      city_id TEXT NOT NULL REFERENCES cities(id),
      longitude REAL NOT NULL,
      latitude REAL NOT NULL,
      category TEXT NOT NULL,
      description TEXT NOT NULL,
      created_at TEXT NOT NULL,
      UNIQUE (name, city_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS llm_suggested_pois (
      id TEXT PRIMARY KEY,
      user_id TEXT NOT NULL,
      llm_interaction_id TEXT NOT NULL REFERENCES llm_interactions(id),
      city_id TEXT REFERENCES cities(id),
      name TEXT NOT NULL,
      longitude REAL NOT NULL,
      latitude REAL NOT NULL,
      category TEXT NOT NULL,
      description TEXT NOT NULL,
      created_at TEXT NOT NULL,
      UNIQUE (name, latitude, longitude)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS itineraries (
      id TEXT PRIMARY KEY,
      user_id TEXT NOT NULL,
      city_id TEXT NOT NULL REFERENCES cities(id),
      source_llm_interaction_id TEXT REFERENCES llm_interactions(id),
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      UNIQUE (user_id, city_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS itinerary_pois (
      itinerary_id TEXT NOT NULL REFERENCES itineraries(id),
      poi_id TEXT NOT NULL REFERENCES points_of_interest(id),
      order_index INTEGER NOT NULL,
      ai_description TEXT NOT NULL,
      PRIMARY KEY (itinerary_id, poi_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_sessions (
      id TEXT PRIMARY KEY,
      user_id TEXT NOT NULL,
      profile_id TEXT,
      city_name TEXT NOT NULL,
      current_itinerary_json TEXT,
      history_json TEXT NOT NULL,
      context_json TEXT NOT NULL,
      status TEXT NOT NULL,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      expires_at TEXT NOT NULL
    );
    "#,
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        if database_url.contains(":memory:") || database_url.contains("mode=memory") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url {}", database_url))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("failed connecting to sqlite at {}", database_url))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Private in-memory database. One connection, kept open for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed opening in-memory sqlite")?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed applying sqlite schema")?;
        }
        Ok(())
    }

    /// Inserts the city or refreshes its country; returns the stable id.
    pub async fn upsert_city(&self, name: &str, country: &str) -> StorageResult<Uuid> {
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO cities (id, name, country)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET country = excluded.country
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(country)
        .fetch_one(&self.pool)
        .await?;

        parse_uuid("cities", &id)
    }
}

pub(crate) fn parse_uuid(table: &'static str, value: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(value).map_err(|err| StorageError::CorruptRow {
        table,
        detail: format!("bad uuid {value:?}: {err}"),
    })
}

pub(crate) fn parse_timestamp(table: &'static str, value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::CorruptRow {
            table,
            detail: format!("bad timestamp {value:?}: {err}"),
        })
}

