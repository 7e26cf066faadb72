use atlas_core::{haversine_distance_meters, GeoPoint, PoiDetail, RankedPoi};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::persistence::{find_city_id, get_or_create_poi_tx};
use crate::{parse_uuid, PoiRepository, SqliteStore, StorageResult};

/// Reference point plus optional filters for the distance-ranked read.
#[derive(Debug, Clone, Copy)]
pub struct DistanceQuery {
    pub reference: GeoPoint,
    pub city_id: Option<Uuid>,
    /// Ranks the suggestions of one interaction instead of canonical POIs.
    pub interaction_id: Option<Uuid>,
    pub limit: Option<usize>,
}

impl DistanceQuery {
    pub fn around(reference: GeoPoint) -> Self {
        Self {
            reference,
            city_id: None,
            interaction_id: None,
            limit: None,
        }
    }

    pub fn in_city(mut self, city_id: Uuid) -> Self {
        self.city_id = Some(city_id);
        self
    }

    pub fn for_interaction(mut self, interaction_id: Uuid) -> Self {
        self.interaction_id = Some(interaction_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Attaches distances to `reference` and sorts nearest first.
pub fn rank_by_distance(reference: GeoPoint, mut pois: Vec<RankedPoi>) -> Vec<RankedPoi> {
    for poi in &mut pois {
        poi.distance_meters = haversine_distance_meters(reference, poi.location);
    }
    pois.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
    pois
}

impl PoiRepository for SqliteStore {
    async fn find_city_id_by_name(&self, name: &str) -> StorageResult<Option<Uuid>> {
        let mut conn = self.pool().acquire().await?;
        find_city_id(&mut conn, name).await
    }

    async fn get_or_create_poi(&self, poi: &PoiDetail, city_id: Uuid) -> StorageResult<Uuid> {
        let mut conn = self.pool().acquire().await?;
        get_or_create_poi_tx(&mut conn, poi, city_id).await
    }

    async fn pois_by_distance(&self, query: &DistanceQuery) -> StorageResult<Vec<RankedPoi>> {
        let city_filter = query.city_id.map(|id| id.to_string());

        let (table, rows) = match query.interaction_id {
            Some(interaction_id) => (
                "llm_suggested_pois",
                sqlx::query(
                    r#"
                    SELECT id, name, category, description, longitude, latitude
                    FROM llm_suggested_pois
                    WHERE llm_interaction_id = ?1 AND (?2 IS NULL OR city_id = ?2)
                    "#,
                )
                .bind(interaction_id.to_string())
                .bind(city_filter)
                .fetch_all(self.pool())
                .await?,
            ),
            None => (
                "points_of_interest",
                sqlx::query(
                    r#"
                    SELECT id, name, category, description, longitude, latitude
                    FROM points_of_interest
                    WHERE (?1 IS NULL OR city_id = ?1)
                    "#,
                )
                .bind(city_filter)
                .fetch_all(self.pool())
                .await?,
            ),
        };

        let pois = rows
            .into_iter()
            .map(|row| {
                Ok(RankedPoi {
                    id: parse_uuid(table, &row.try_get::<String, _>("id")?)?,
                    name: row.try_get("name")?,
                    category: row.try_get("category")?,
                    description: row.try_get("description")?,
                    location: GeoPoint::new(row.try_get("longitude")?, row.try_get("latitude")?),
                    distance_meters: 0.0,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let mut ranked = rank_by_distance(query.reference, pois);
        if let Some(limit) = query.limit {
            ranked.truncate(limit);
        }
        debug!(table, returned = ranked.len(), "ranked POIs by distance");
        Ok(ranked)
    }
}
