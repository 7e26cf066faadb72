use std::collections::HashSet;

use atlas_core::prompts::reply_domain_from_prompt;
use atlas_core::{
    extract_itinerary, extract_pois, Domain, Itinerary, ItineraryPoi, LlmInteraction, PoiDetail,
};
use chrono::Utc;
use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, Transaction};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{at, PersistStep, StorageError};
use crate::{parse_timestamp, parse_uuid, InteractionRepository, SqliteStore, StorageResult};

/// What one `save_interaction` call wrote.
#[derive(Debug, Clone, Serialize)]
pub struct SavedInteraction {
    pub interaction_id: Uuid,
    pub city_id: Option<Uuid>,
    pub itinerary_id: Option<Uuid>,
    pub linked_pois: usize,
}

/// Dining, accommodation and activity replies are never linked into itineraries.
/// The typed flag and the literal prompt markers are both honoured.
pub fn is_domain_specific_reply(interaction: &LlmInteraction) -> bool {
    interaction
        .reply_domain
        .map(Domain::is_domain_specific)
        .unwrap_or(false)
        || reply_domain_from_prompt(&interaction.prompt).is_some()
}

impl InteractionRepository for SqliteStore {
    #[instrument(skip(self, interaction), fields(interaction_id = %interaction.id, user_id = %interaction.user_id))]
    async fn save_interaction(
        &self,
        interaction: &LlmInteraction,
    ) -> StorageResult<SavedInteraction> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(at(PersistStep::BeginTransaction))?;

        match save_interaction_tx(&mut tx, interaction).await {
            Ok(saved) => {
                tx.commit().await.map_err(at(PersistStep::Commit))?;
                info!(
                    city_id = ?saved.city_id,
                    itinerary_id = ?saved.itinerary_id,
                    linked_pois = saved.linked_pois,
                    "llm interaction saved"
                );
                Ok(saved)
            }
            Err(err) => {
                rollback(tx, &err).await;
                Err(err)
            }
        }
    }

    #[instrument(skip(self, pois), fields(count = pois.len()))]
    async fn save_llm_suggested_pois_batch(
        &self,
        user_id: Uuid,
        interaction_id: Uuid,
        city_id: Option<Uuid>,
        pois: &[PoiDetail],
    ) -> StorageResult<Vec<Uuid>> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(at(PersistStep::BeginTransaction))?;

        let result = async {
            if !interaction_exists(&mut tx, interaction_id).await? {
                return Err(StorageError::InteractionNotFound(interaction_id));
            }
            insert_suggested_pois(&mut tx, user_id, interaction_id, city_id, pois).await
        }
        .await;

        match result {
            Ok(ids) => {
                tx.commit().await.map_err(at(PersistStep::Commit))?;
                info!(saved = ids.len(), "suggested POIs saved");
                Ok(ids)
            }
            Err(err) => {
                rollback(tx, &err).await;
                Err(err)
            }
        }
    }
}

impl SqliteStore {
    pub async fn load_interaction(&self, id: Uuid) -> StorageResult<Option<LlmInteraction>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, session_id, city_name, prompt, response_text, model_name,
                   prompt_tokens, completion_tokens, total_tokens, latency_ms, reply_domain, log_only,
                   created_at
            FROM llm_interactions
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let session_id = row
            .try_get::<Option<String>, _>("session_id")?
            .map(|value| parse_uuid("llm_interactions", &value))
            .transpose()?;
        let reply_domain = row
            .try_get::<Option<String>, _>("reply_domain")?
            .and_then(|value| Domain::parse(&value));

        Ok(Some(LlmInteraction {
            id: parse_uuid("llm_interactions", &row.try_get::<String, _>("id")?)?,
            user_id: parse_uuid("llm_interactions", &row.try_get::<String, _>("user_id")?)?,
            session_id,
            city_name: row.try_get("city_name")?,
            prompt: row.try_get("prompt")?,
            response_text: row.try_get("response_text")?,
            model_name: row.try_get("model_name")?,
            prompt_tokens: row.try_get("prompt_tokens")?,
            completion_tokens: row.try_get("completion_tokens")?,
            total_tokens: row.try_get("total_tokens")?,
            latency_ms: row.try_get("latency_ms")?,
            reply_domain,
            log_only: row.try_get("log_only")?,
            created_at: parse_timestamp(
                "llm_interactions",
                &row.try_get::<String, _>("created_at")?,
            )?,
        }))
    }

    pub async fn find_itinerary(
        &self,
        user_id: Uuid,
        city_id: Uuid,
    ) -> StorageResult<Option<Itinerary>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, city_id, source_llm_interaction_id, created_at, updated_at
            FROM itineraries
            WHERE user_id = ?1 AND city_id = ?2
            "#,
        )
        .bind(user_id.to_string())
        .bind(city_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Itinerary {
            id: parse_uuid("itineraries", &row.try_get::<String, _>("id")?)?,
            user_id: parse_uuid("itineraries", &row.try_get::<String, _>("user_id")?)?,
            city_id: parse_uuid("itineraries", &row.try_get::<String, _>("city_id")?)?,
            source_llm_interaction_id: row
                .try_get::<Option<String>, _>("source_llm_interaction_id")?
                .map(|value| parse_uuid("itineraries", &value))
                .transpose()?,
            created_at: parse_timestamp("itineraries", &row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_timestamp("itineraries", &row.try_get::<String, _>("updated_at")?)?,
        }))
    }

    pub async fn itinerary_pois(&self, itinerary_id: Uuid) -> StorageResult<Vec<ItineraryPoi>> {
        let rows = sqlx::query(
            r#"
            SELECT itinerary_id, poi_id, order_index, ai_description
            FROM itinerary_pois
            WHERE itinerary_id = ?1
            ORDER BY order_index
            "#,
        )
        .bind(itinerary_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ItineraryPoi {
                    itinerary_id: parse_uuid(
                        "itinerary_pois",
                        &row.try_get::<String, _>("itinerary_id")?,
                    )?,
                    poi_id: parse_uuid("itinerary_pois", &row.try_get::<String, _>("poi_id")?)?,
                    order_index: row.try_get("order_index")?,
                    ai_description: row.try_get("ai_description")?,
                })
            })
            .collect()
    }
}

async fn save_interaction_tx(
    tx: &mut Transaction<'_, Sqlite>,
    interaction: &LlmInteraction,
) -> StorageResult<SavedInteraction> {
    let interaction_id = insert_interaction(tx, interaction)
        .await
        .map_err(at(PersistStep::InsertInteraction))?;

    let mut saved = SavedInteraction {
        interaction_id,
        city_id: None,
        itinerary_id: None,
        linked_pois: 0,
    };

    let Some(city_name) = interaction.city_name.as_deref() else {
        debug!("interaction has no city, skipping itinerary");
        return Ok(saved);
    };

    let Some(city_id) = find_city_id(tx, city_name).await? else {
        warn!(city = city_name, "city not found, skipping itinerary");
        return Ok(saved);
    };
    saved.city_id = Some(city_id);

    if interaction.log_only {
        debug!("log-only interaction, itinerary untouched");
        return Ok(saved);
    }

    let itinerary_id = upsert_itinerary(tx, interaction.user_id, city_id, interaction_id)
        .await
        .map_err(at(PersistStep::UpsertItinerary))?;
    saved.itinerary_id = Some(itinerary_id);

    if is_domain_specific_reply(interaction) {
        debug!("domain-specific reply, skipping POI extraction");
        return Ok(saved);
    }

    // An itinerary payload defines the visiting order; loose POIs go after the existing stops.
    let (pois, first_index) = match extract_itinerary(&interaction.response_text) {
        Some(itinerary) => (itinerary.points_of_interest, 1),
        None => {
            let pois = extract_pois(&interaction.response_text);
            let last = max_order_index(tx, itinerary_id)
                .await
                .map_err(at(PersistStep::LinkItineraryPois))?;
            (pois, last + 1)
        }
    };
    if pois.is_empty() {
        debug!("no POIs in response");
        return Ok(saved);
    }

    let mut seen = HashSet::new();
    let mut links = Vec::with_capacity(pois.len());
    for poi in pois.iter().filter(|poi| !poi.name.trim().is_empty()) {
        let poi_id = get_or_create_poi_tx(tx, poi, city_id).await?;
        if seen.insert(poi_id) {
            links.push(ItineraryPoi {
                itinerary_id,
                poi_id,
                order_index: first_index + links.len() as i64,
                ai_description: poi.description_poi.clone(),
            });
        }
    }

    link_itinerary_pois(tx, &links)
        .await
        .map_err(at(PersistStep::LinkItineraryPois))?;
    saved.linked_pois = links.len();

    Ok(saved)
}

async fn rollback(tx: Transaction<'_, Sqlite>, cause: &StorageError) {
    if let Err(rollback_err) = tx.rollback().await {
        error!(error = %rollback_err, cause = %cause, "transaction rollback failed");
    }
}

async fn insert_interaction(
    conn: &mut SqliteConnection,
    interaction: &LlmInteraction,
) -> Result<Uuid, sqlx::Error> {
    let id: String = sqlx::query_scalar(
        r#"
        INSERT INTO llm_interactions (
          id, user_id, session_id, city_name, prompt, response_text, model_name,
          prompt_tokens, completion_tokens, total_tokens, latency_ms, reply_domain, log_only,
          created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        RETURNING id
        "#,
    )
    .bind(interaction.id.to_string())
    .bind(interaction.user_id.to_string())
    .bind(interaction.session_id.map(|id| id.to_string()))
    .bind(interaction.city_name.as_deref())
    .bind(&interaction.prompt)
    .bind(&interaction.response_text)
    .bind(&interaction.model_name)
    .bind(interaction.prompt_tokens)
    .bind(interaction.completion_tokens)
    .bind(interaction.total_tokens)
    .bind(interaction.latency_ms)
    .bind(interaction.reply_domain.map(|domain| domain.as_code()))
    .bind(interaction.log_only)
    .bind(interaction.created_at.to_rfc3339())
    .fetch_one(&mut *conn)
    .await?;

    Uuid::parse_str(&id).map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

/// Exact, case-sensitive match on the city name.
pub(crate) async fn find_city_id(
    conn: &mut SqliteConnection,
    name: &str,
) -> StorageResult<Option<Uuid>> {
    let id: Option<String> = sqlx::query_scalar("SELECT id FROM cities WHERE name = ?1")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(at(PersistStep::ResolveCity))?;

    id.map(|value| parse_uuid("cities", &value)).transpose()
}

async fn upsert_itinerary(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    city_id: Uuid,
    interaction_id: Uuid,
) -> Result<Uuid, sqlx::Error> {
    let now = Utc::now().to_rfc3339();
    let id: String = sqlx::query_scalar(
        r#"
        INSERT INTO itineraries (id, user_id, city_id, source_llm_interaction_id, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        ON CONFLICT(user_id, city_id) DO UPDATE SET
          updated_at = excluded.updated_at,
          source_llm_interaction_id = excluded.source_llm_interaction_id
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id.to_string())
    .bind(city_id.to_string())
    .bind(interaction_id.to_string())
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Uuid::parse_str(&id).map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

/// Single statement: inserts the POI or hands back the id already stored for (name, city).
pub(crate) async fn get_or_create_poi_tx(
    conn: &mut SqliteConnection,
    poi: &PoiDetail,
    city_id: Uuid,
) -> StorageResult<Uuid> {
    let id: String = sqlx::query_scalar(
        r#"
        INSERT INTO points_of_interest (id, name, city_id, longitude, latitude, category, description, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(name, city_id) DO UPDATE SET name = excluded.name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(poi.name.trim())
    .bind(city_id.to_string())
    .bind(poi.longitude)
    .bind(poi.latitude)
    .bind(&poi.category)
    .bind(&poi.description_poi)
    .bind(Utc::now().to_rfc3339())
    .fetch_one(&mut *conn)
    .await
    .map_err(at(PersistStep::ResolvePoi))?;

    parse_uuid("points_of_interest", &id)
}

async fn max_order_index(
    conn: &mut SqliteConnection,
    itinerary_id: Uuid,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COALESCE(MAX(order_index), 0) FROM itinerary_pois WHERE itinerary_id = ?1",
    )
    .bind(itinerary_id.to_string())
    .fetch_one(&mut *conn)
    .await
}

async fn link_itinerary_pois(
    conn: &mut SqliteConnection,
    links: &[ItineraryPoi],
) -> Result<(), sqlx::Error> {
    if links.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "INSERT INTO itinerary_pois (itinerary_id, poi_id, order_index, ai_description) ",
    );
    builder.push_values(links, |mut row, link| {
        row.push_bind(link.itinerary_id.to_string())
            .push_bind(link.poi_id.to_string())
            .push_bind(link.order_index)
            .push_bind(link.ai_description.clone());
    });
    builder.push(
        " ON CONFLICT(itinerary_id, poi_id) DO UPDATE SET \
         order_index = excluded.order_index, ai_description = excluded.ai_description",
    );

    builder.build().execute(&mut *conn).await?;
    Ok(())
}

async fn interaction_exists(
    conn: &mut SqliteConnection,
    interaction_id: Uuid,
) -> StorageResult<bool> {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM llm_interactions WHERE id = ?1)")
        .bind(interaction_id.to_string())
        .fetch_one(&mut *conn)
        .await
        .map_err(at(PersistStep::CheckInteraction))
}

async fn insert_suggested_pois(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    interaction_id: Uuid,
    city_id: Option<Uuid>,
    pois: &[PoiDetail],
) -> StorageResult<Vec<Uuid>> {
    let pois = pois
        .iter()
        .filter(|poi| !poi.name.trim().is_empty())
        .collect::<Vec<_>>();
    if pois.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now().to_rfc3339();
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "INSERT INTO llm_suggested_pois (id, user_id, llm_interaction_id, city_id, name, \
         longitude, latitude, category, description, created_at) ",
    );
    builder.push_values(pois, |mut row, poi| {
        row.push_bind(Uuid::new_v4().to_string())
            .push_bind(user_id.to_string())
            .push_bind(interaction_id.to_string())
            .push_bind(city_id.map(|id| id.to_string()))
            .push_bind(poi.name.trim().to_string())
            .push_bind(poi.longitude)
            .push_bind(poi.latitude)
            .push_bind(poi.category.clone())
            .push_bind(poi.description_poi.clone())
            .push_bind(now.clone());
    });
    builder.push(
        " ON CONFLICT(name, latitude, longitude) DO UPDATE SET \
         llm_interaction_id = excluded.llm_interaction_id, \
         category = excluded.category, description = excluded.description \
         RETURNING id",
    );

    let ids: Vec<String> = builder
        .build_query_scalar()
        .fetch_all(&mut *conn)
        .await
        .map_err(at(PersistStep::InsertSuggestedPois))?;

    ids.iter()
        .map(|id| parse_uuid("llm_suggested_pois", id))
        .collect()
}
