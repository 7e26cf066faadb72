use atlas_core::prompts::{itinerary_revision_prompt, poi_detail_prompt, question_prompt};
use atlas_core::{
    extract_itinerary, extract_pois, AiCityResponse, ChatSession, Classification,
    ConversationMessage, Intent, ModificationRecord, SessionStatus, TravelProfile,
};
use atlas_storage::{ChatSessionRepository, InteractionRepository, StorageError};
use chrono::{Duration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::client::GenerationClient;
use crate::orchestrator::{CityDataRequest, GenerationOrchestrator, OrchestratorError};

pub const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize)]
pub struct SessionReply {
    pub session_id: Uuid,
    pub classification: Classification,
    pub reply: String,
    pub itinerary: Option<AiCityResponse>,
}

impl<C, S> GenerationOrchestrator<C, S>
where
    C: GenerationClient,
    S: InteractionRepository + ChatSessionRepository,
{
    /// Opens a session, optionally seeded with an already generated itinerary.
    pub async fn start_session(
        &self,
        profile: &TravelProfile,
        city: &str,
        initial: Option<AiCityResponse>,
    ) -> Result<ChatSession, OrchestratorError> {
        let ttl = Duration::hours(SESSION_TTL_HOURS);
        let mut session = ChatSession::open(profile.user_id, city, ttl);
        session.profile_id = profile.profile_id;
        session.session_context.interests = profile.interests.clone();
        session.session_context.tags = profile.tags.clone();
        session.session_context.preferences = profile.preferences.clone();
        session.current_itinerary = initial;

        self.store.create_session(&session).await?;
        info!(session_id = %session.id, city, "chat session opened");
        Ok(session)
    }

    /// Classifies `message` and applies its intent to the session itinerary.
    #[instrument(skip(self, message, cancel))]
    pub async fn continue_session(
        &self,
        session_id: Uuid,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionReply, OrchestratorError> {
        let mut session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or(StorageError::SessionNotFound(session_id))?;
        if session.expires_at < Utc::now() || session.status != SessionStatus::Active {
            return Err(OrchestratorError::SessionInactive(session_id));
        }

        let classification = self.classifier.classify(message);
        let mut user_message = ConversationMessage::user(message);
        user_message.intent = Some(classification.intent);
        user_message.domain = Some(classification.domain);
        self.store.append_message(session_id, &user_message).await?;
        session.conversation_history.push(user_message);

        let request = CityDataRequest {
            user_id: session.user_id,
            city: session.city_name.clone(),
            profile: session_profile(&session),
            session_id: Some(session_id),
        };

        let reply = match classification.intent {
            Intent::AddPoi => self.add_poi(&request, &mut session, message, cancel).await?,
            Intent::RemovePoi => remove_poi(&mut session, message),
            Intent::AskQuestion => {
                let itinerary = session
                    .current_itinerary
                    .as_ref()
                    .map(|current| &current.itinerary_response);
                let prompt = question_prompt(&request.city, itinerary, message);
                let generated = self.generate_cancellable(&prompt, cancel).await?;
                self.record_session_interaction(&request, &prompt, &generated)
                    .await;
                generated.text
            }
            Intent::ModifyItinerary => {
                self.revise_itinerary(&request, &mut session, message, cancel)
                    .await?
            }
        };

        let mut assistant_message = ConversationMessage::assistant(reply.clone());
        assistant_message.intent = Some(classification.intent);
        assistant_message.domain = Some(classification.domain);
        self.store
            .append_message(session_id, &assistant_message)
            .await?;
        session.conversation_history.push(assistant_message);

        if classification.intent != Intent::AskQuestion {
            session
                .session_context
                .modification_history
                .push(ModificationRecord {
                    intent: classification.intent,
                    description: message.to_string(),
                    at: Utc::now(),
                });
        }
        self.store.update_session(&session).await?;

        info!(intent = ?classification.intent, domain = ?classification.domain, "session message handled");
        Ok(SessionReply {
            session_id,
            classification,
            reply,
            itinerary: session.current_itinerary,
        })
    }

    async fn add_poi(
        &self,
        request: &CityDataRequest,
        session: &mut ChatSession,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let prompt = poi_detail_prompt(&request.city, message);
        let generated = self.generate_cancellable(&prompt, cancel).await?;
        self.record_session_interaction(request, &prompt, &generated)
            .await;

        let Some(poi) = extract_pois(&generated.text).into_iter().next() else {
            return Ok("I could not identify that place.".to_string());
        };

        let itinerary = &mut session
            .current_itinerary
            .get_or_insert_with(AiCityResponse::default)
            .itinerary_response;
        if itinerary
            .points_of_interest
            .iter()
            .any(|existing| existing.name.eq_ignore_ascii_case(&poi.name))
        {
            return Ok(format!("{} is already in your itinerary.", poi.name));
        }

        let reply = format!("Added {} to your itinerary.", poi.name);
        itinerary.points_of_interest.push(poi);
        Ok(reply)
    }

    async fn revise_itinerary(
        &self,
        request: &CityDataRequest,
        session: &mut ChatSession,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let current = session
            .current_itinerary
            .as_ref()
            .map(|current| &current.itinerary_response);
        let prompt = itinerary_revision_prompt(&request.city, &request.profile, current, message);
        let generated = self.generate_cancellable(&prompt, cancel).await?;
        self.record_session_interaction(request, &prompt, &generated)
            .await;

        let Some(revised) = extract_itinerary(&generated.text) else {
            return Ok("I could not revise the itinerary this time.".to_string());
        };

        let reply = format!(
            "Updated \"{}\" with {} stops.",
            revised.itinerary_name,
            revised.points_of_interest.len()
        );
        session
            .current_itinerary
            .get_or_insert_with(AiCityResponse::default)
            .itinerary_response = revised;
        Ok(reply)
    }

    async fn record_session_interaction(
        &self,
        request: &CityDataRequest,
        prompt: &str,
        generated: &crate::orchestrator::Generated,
    ) {
        if let Err(err) = self
            .record_interaction(request, prompt, generated, None)
            .await
        {
            warn!(error = %err, step = ?err.step(), "session interaction not saved");
        }
    }
}

fn session_profile(session: &ChatSession) -> TravelProfile {
    TravelProfile {
        user_id: session.user_id,
        profile_id: session.profile_id,
        interests: session.session_context.interests.clone(),
        tags: session.session_context.tags.clone(),
        preferences: session.session_context.preferences.clone(),
        ..TravelProfile::default()
    }
}

/// Drops every stop whose name appears in the message, case-insensitively.
fn remove_poi(session: &mut ChatSession, message: &str) -> String {
    let needle = message.to_lowercase();
    let Some(current) = session.current_itinerary.as_mut() else {
        return "There is no itinerary to remove places from yet.".to_string();
    };

    let stops = &mut current.itinerary_response.points_of_interest;
    let before = stops.len();
    let mut removed = Vec::new();
    stops.retain(|poi| {
        let matched = !poi.name.trim().is_empty() && needle.contains(&poi.name.to_lowercase());
        if matched {
            removed.push(poi.name.clone());
        }
        !matched
    });

    if stops.len() == before {
        "None of the places mentioned are in your itinerary.".to_string()
    } else {
        format!("Removed {} from your itinerary.", removed.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use atlas_core::MessageRole;
    use atlas_storage::SqliteStore;

    use super::*;
    use crate::orchestrator::OrchestratorConfig;
    use crate::testing::{
        orchestrator, ScriptedClient, CITY_JSON, CITY_NEEDLE, GENERIC_JSON, GENERIC_NEEDLE,
        ITINERARY_JSON, PERSONALIZED_NEEDLE,
    };

    fn profile() -> TravelProfile {
        TravelProfile {
            user_id: Uuid::new_v4(),
            interests: vec!["food".to_string()],
            ..TravelProfile::default()
        }
    }

    fn seeded() -> AiCityResponse {
        let mut seeded = AiCityResponse::default();
        seeded.itinerary_response = extract_itinerary(ITINERARY_JSON).unwrap();
        seeded
    }

    #[tokio::test]
    async fn add_poi_appends_to_itinerary_and_history() {
        let store = SqliteStore::in_memory().await.unwrap();
        let client = ScriptedClient::new().reply(
            "wants to add a place",
            r#"{"name": "Serralves", "latitude": 41.1596, "longitude": -8.6598}"#,
        );
        let orchestrator = orchestrator(client, store.clone(), OrchestratorConfig::default());
        let session = orchestrator
            .start_session(&profile(), "Porto", Some(seeded()))
            .await
            .unwrap();

        let reply = orchestrator
            .continue_session(
                session.id,
                "please add the Serralves museum",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(reply.classification.intent, Intent::AddPoi);
        let stops = &reply.itinerary.unwrap().itinerary_response.points_of_interest;
        assert_eq!(stops.len(), 3);
        assert_eq!(stops[2].name, "Serralves");

        let stored = store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.conversation_history.len(), 2);
        assert_eq!(stored.conversation_history[0].role, MessageRole::User);
        assert_eq!(stored.conversation_history[1].role, MessageRole::Assistant);
        assert_eq!(stored.session_context.modification_history.len(), 1);
    }

    #[tokio::test]
    async fn remove_poi_needs_no_model_call() {
        let store = SqliteStore::in_memory().await.unwrap();
        let orchestrator =
            orchestrator(ScriptedClient::new(), store.clone(), OrchestratorConfig::default());
        let session = orchestrator
            .start_session(&profile(), "Porto", Some(seeded()))
            .await
            .unwrap();

        let reply = orchestrator
            .continue_session(session.id, "remove ribeira please", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.reply, "Removed Ribeira from your itinerary.");
        let stops = &reply.itinerary.unwrap().itinerary_response.points_of_interest;
        assert_eq!(stops.len(), 1);
        assert_eq!(orchestrator.metrics().snapshot().generation_calls_total, 0);
    }

    #[tokio::test]
    async fn question_is_answered_in_plain_text() {
        let store = SqliteStore::in_memory().await.unwrap();
        let client = ScriptedClient::new().reply(
            "Answer the traveller's question",
            "Trams run until midnight.",
        );
        let orchestrator = orchestrator(client, store.clone(), OrchestratorConfig::default());
        let session = orchestrator
            .start_session(&profile(), "Porto", None)
            .await
            .unwrap();

        let reply = orchestrator
            .continue_session(session.id, "when do the trams stop?", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.classification.intent, Intent::AskQuestion);
        assert_eq!(reply.reply, "Trams run until midnight.");
        let stored = store.load_session(session.id).await.unwrap().unwrap();
        assert!(stored.session_context.modification_history.is_empty());
    }

    #[tokio::test]
    async fn modification_replaces_the_itinerary() {
        let store = SqliteStore::in_memory().await.unwrap();
        let client = ScriptedClient::new().reply(
            "Revise the traveller's itinerary",
            r#"{"itinerary_name": "Slower Porto", "points_of_interest": [{"name": "Foz"}]}"#,
        );
        let orchestrator = orchestrator(client, store, OrchestratorConfig::default());
        let session = orchestrator
            .start_session(&profile(), "Porto", Some(seeded()))
            .await
            .unwrap();

        let reply = orchestrator
            .continue_session(session.id, "make it more relaxed", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.classification.intent, Intent::ModifyItinerary);
        let itinerary = reply.itinerary.unwrap().itinerary_response;
        assert_eq!(itinerary.itinerary_name, "Slower Porto");
        assert_eq!(itinerary.points_of_interest.len(), 1);
    }

    #[tokio::test]
    async fn revision_prompt_keeps_profile_tags() {
        let store = SqliteStore::in_memory().await.unwrap();
        let client = ScriptedClient::new().reply(
            "Tags: rainy-day.",
            r#"{"itinerary_name": "Indoor Porto", "points_of_interest": [{"name": "Serralves"}]}"#,
        );
        let orchestrator = orchestrator(client, store, OrchestratorConfig::default());
        let profile = TravelProfile {
            tags: vec!["rainy-day".to_string()],
            ..profile()
        };
        let session = orchestrator
            .start_session(&profile, "Porto", Some(seeded()))
            .await
            .unwrap();

        let reply = orchestrator
            .continue_session(session.id, "make it more relaxed", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            reply.itinerary.unwrap().itinerary_response.itinerary_name,
            "Indoor Porto"
        );
    }

    #[tokio::test]
    async fn chat_turns_leave_the_persisted_itinerary_alone() {
        let store = SqliteStore::in_memory().await.unwrap();
        let porto = store.upsert_city("Porto", "Portugal").await.unwrap();
        let client = ScriptedClient::new()
            .reply(CITY_NEEDLE, CITY_JSON)
            .reply(GENERIC_NEEDLE, GENERIC_JSON)
            .reply(PERSONALIZED_NEEDLE, ITINERARY_JSON)
            .reply(
                "wants to add a place",
                r#"{"name": "Serralves", "latitude": 41.1596, "longitude": -8.6598}"#,
            );
        let orchestrator = orchestrator(client, store.clone(), OrchestratorConfig::default());
        let profile = profile();
        let request = CityDataRequest::new(profile.user_id, "Porto", profile.clone());

        let bundle = orchestrator
            .generate_city_data(&request, &CancellationToken::new())
            .await
            .unwrap();
        let source = bundle
            .personalized
            .as_ref()
            .and_then(|personalized| personalized.interaction_id);
        let session = orchestrator
            .start_session(&profile, "Porto", Some(bundle.to_city_response()))
            .await
            .unwrap();

        for message in ["please add the Serralves museum", "remove ribeira please"] {
            orchestrator
                .continue_session(session.id, message, &CancellationToken::new())
                .await
                .unwrap();
        }

        let itinerary = store
            .find_itinerary(profile.user_id, porto)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(itinerary.source_llm_interaction_id, source);
        let links = store.itinerary_pois(itinerary.id).await.unwrap();
        assert_eq!(
            links.iter().map(|link| link.order_index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(orchestrator.metrics().snapshot().interactions_saved_total, 2);
    }

    #[tokio::test]
    async fn closed_or_missing_sessions_are_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let orchestrator =
            orchestrator(ScriptedClient::new(), store.clone(), OrchestratorConfig::default());

        let err = orchestrator
            .continue_session(Uuid::new_v4(), "hello", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Storage(StorageError::SessionNotFound(_))
        ));

        let mut session = orchestrator
            .start_session(&profile(), "Porto", None)
            .await
            .unwrap();
        session.status = SessionStatus::Closed;
        store.update_session(&session).await.unwrap();

        let err = orchestrator
            .continue_session(session.id, "hello", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::SessionInactive(_)));
    }
}
