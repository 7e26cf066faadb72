use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::{Domain, Intent};

/// WGS84 coordinate, longitude first like the storage columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }
}

/// One row per generation call. Never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmInteraction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    pub city_name: Option<String>,
    pub prompt: String,
    pub response_text: String,
    pub model_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    /// Typed form of the domain markers carried in `prompt`.
    pub reply_domain: Option<Domain>,
    /// Chat-session turns: logged, never linked into the persisted itinerary.
    #[serde(default)]
    pub log_only: bool,
    pub created_at: DateTime<Utc>,
}

impl LlmInteraction {
    pub fn new(
        user_id: Uuid,
        city_name: Option<String>,
        prompt: impl Into<String>,
        response_text: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            session_id: None,
            city_name,
            prompt: prompt.into(),
            response_text: response_text.into(),
            model_name: model_name.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            latency_ms: 0,
            reply_domain: None,
            log_only: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct City {
    pub id: Uuid,
    pub name: String,
    pub country: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Itinerary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub city_id: Uuid,
    pub source_llm_interaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// POI as the model emits it. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoiDetail {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub category: String,
    #[serde(default, alias = "description")]
    pub description_poi: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening_hours: Option<String>,
}

impl PoiDetail {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.longitude, self.latitude)
    }
}

/// Canonical POI row, deduplicated on (name, city).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointOfInterest {
    pub id: Uuid,
    pub name: String,
    pub city_id: Uuid,
    pub location: GeoPoint,
    pub category: String,
    pub description: String,
}

/// Exploratory POI tied to the interaction that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedPoi {
    pub id: Uuid,
    pub user_id: Uuid,
    pub llm_interaction_id: Uuid,
    pub city_id: Option<Uuid>,
    pub name: String,
    pub location: GeoPoint,
    pub category: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItineraryPoi {
    pub itinerary_id: Uuid,
    pub poi_id: Uuid,
    pub order_index: i64,
    pub ai_description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedPoi {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub description: String,
    pub location: GeoPoint,
    pub distance_meters: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralCityData {
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state_province: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub center_latitude: f64,
    #[serde(default)]
    pub center_longitude: f64,
    #[serde(default)]
    pub population: String,
    #[serde(default)]
    pub area: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub weather: String,
    #[serde(default)]
    pub attractions: String,
    #[serde(default)]
    pub history: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiItineraryResponse {
    #[serde(default)]
    pub itinerary_name: String,
    #[serde(default)]
    pub overall_description: String,
    #[serde(default)]
    pub points_of_interest: Vec<PoiDetail>,
}

/// Full city payload: facts, generic POIs and a personalised itinerary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiCityResponse {
    #[serde(default)]
    pub general_city_data: GeneralCityData,
    #[serde(default)]
    pub points_of_interest: Vec<PoiDetail>,
    #[serde(default)]
    pub itinerary_response: AiItineraryResponse,
}

/// What the personalised prompt is built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TravelProfile {
    pub user_id: Uuid,
    pub profile_id: Option<Uuid>,
    pub interests: Vec<String>,
    pub tags: Vec<String>,
    pub preferences: Vec<String>,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub intent: Option<Intent>,
    pub domain: Option<Domain>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            intent: None,
            domain: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub intent: Intent,
    pub description: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    pub city_name: String,
    pub interests: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub preferences: Vec<String>,
    pub modification_history: Vec<ModificationRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
    Expired,
}

impl SessionStatus {
    pub fn as_code(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub profile_id: Option<Uuid>,
    pub city_name: String,
    pub current_itinerary: Option<AiCityResponse>,
    pub conversation_history: Vec<ConversationMessage>,
    pub session_context: SessionContext,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn open(user_id: Uuid, city_name: impl Into<String>, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        let city_name = city_name.into();
        Self {
            id: Uuid::new_v4(),
            user_id,
            profile_id: None,
            city_name: city_name.clone(),
            current_itinerary: None,
            conversation_history: Vec::new(),
            session_context: SessionContext {
                city_name,
                ..SessionContext::default()
            },
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }
}
