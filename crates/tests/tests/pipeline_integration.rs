use std::sync::Arc;

use anyhow::{anyhow, Result};
use atlas_agents::{
    CityDataRequest, GenerateResponse, GenerationClient, GenerationConfig,
    GenerationOrchestrator, OrchestratorConfig, ReplyOutcome,
};
use atlas_core::{Domain, GeoPoint, MessageClassifier, TravelProfile};
use atlas_observability::AppMetrics;
use atlas_storage::{DistanceQuery, PoiRepository, SqliteStore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Canned model replies keyed by a phrase each prompt is known to contain.
struct CannedModel;

impl GenerationClient for CannedModel {
    fn model_name(&self) -> &str {
        "canned"
    }

    async fn generate(&self, prompt: &str, _config: &GenerationConfig) -> Result<GenerateResponse> {
        let text = if prompt.contains("Describe the city of") {
            r#"{"city": "Porto", "country": "Portugal", "timezone": "Europe/Lisbon"}"#
        } else if prompt.contains("well-known points of interest") {
            r#"Here you go:
```json
{"points_of_interest": [
  {"name": "Livraria Lello", "latitude": 41.1468, "longitude": -8.6148},
  {"name": "Serralves", "latitude": 41.1596, "longitude": -8.6598},
]}
```"#
        } else if prompt.contains("personalised one-day itinerary") {
            r#"{"data": {"itinerary_name": "Douro day", "overall_description": "Wine and views",
               "points_of_interest": [
                 {"name": "Ribeira", "latitude": 41.1408, "longitude": -8.6131, "description_poi": "Start by the river"},
                 {"name": "Caves Sandeman", "latitude": 41.1373, "longitude": -8.6136, "description_poi": "Port tasting"},
                 {"name": "Jardim do Morro", "latitude": 41.1379, "longitude": -8.6091, "description_poi": "Sunset"}
               ]}}"#
        } else if prompt.contains("restaurant recommendations") {
            r#"{"restaurants": [
                 {"name": "Taberna dos Mercadores", "latitude": 41.1411, "longitude": -8.6140},
                 {"name": "Cafe Santiago", "latitude": 41.1462, "longitude": -8.6061}
               ]}"#
        } else {
            return Err(anyhow!("unexpected prompt"));
        };

        Ok(GenerateResponse::from_text(text))
    }
}

struct Harness {
    store: SqliteStore,
    orchestrator: GenerationOrchestrator<CannedModel, SqliteStore>,
    porto: Uuid,
}

async fn harness(config: OrchestratorConfig) -> Harness {
    let store = SqliteStore::in_memory().await.expect("in-memory store");
    let porto = store.upsert_city("Porto", "Portugal").await.expect("seed city");
    let orchestrator = GenerationOrchestrator::new(
        Arc::new(CannedModel),
        Arc::new(store.clone()),
        Arc::new(MessageClassifier::new().expect("classifier")),
        AppMetrics::shared(),
        config,
    );

    Harness {
        store,
        orchestrator,
        porto,
    }
}

fn request(user_id: Uuid) -> CityDataRequest {
    CityDataRequest::new(
        user_id,
        "Porto",
        TravelProfile {
            user_id,
            interests: vec!["port wine".to_string()],
            ..TravelProfile::default()
        },
    )
}

#[tokio::test]
async fn itinerary_message_flows_from_classifier_to_ranking() {
    let harness = harness(OrchestratorConfig::default()).await;
    let user_id = Uuid::new_v4();

    let reply = harness
        .orchestrator
        .respond_to_message(
            &request(user_id),
            "Plan my trip around the port cellars",
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(reply.classification.domain, Domain::Itinerary);
    let ReplyOutcome::CityData(bundle) = reply.outcome else {
        panic!("expected the full fan-out");
    };
    assert_eq!(bundle.succeeded(), 3);
    assert_eq!(bundle.city.unwrap().timezone, "Europe/Lisbon");
    assert_eq!(bundle.generic_pois.unwrap().len(), 2);

    let itinerary = harness
        .store
        .find_itinerary(user_id, harness.porto)
        .await
        .unwrap()
        .expect("itinerary row");
    let links = harness.store.itinerary_pois(itinerary.id).await.unwrap();
    assert_eq!(
        links.iter().map(|link| link.order_index).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(links[1].ai_description, "Port tasting");

    let query = DistanceQuery::around(GeoPoint::new(-8.6136, 41.1373))
        .in_city(harness.porto)
        .limit(2);
    let ranked = harness.store.pois_by_distance(&query).await.unwrap();
    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].name, "Caves Sandeman");
    assert!(ranked[0].distance_meters <= ranked[1].distance_meters);
}

#[tokio::test]
async fn dining_message_is_logged_but_never_linked() {
    let harness = harness(OrchestratorConfig::default()).await;
    let user_id = Uuid::new_v4();

    let reply = harness
        .orchestrator
        .respond_to_message(
            &request(user_id),
            "Any good restaurants for dinner?",
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let ReplyOutcome::DomainSuggestions { domain, pois, .. } = reply.outcome else {
        panic!("expected domain suggestions");
    };
    assert_eq!(domain, Domain::Dining);
    assert_eq!(pois.len(), 2);

    let ranked = harness
        .store
        .pois_by_distance(&DistanceQuery::around(GeoPoint::new(-8.61, 41.14)))
        .await
        .unwrap();
    assert!(ranked.is_empty());
}

#[tokio::test]
async fn repeated_generation_keeps_one_itinerary_and_stable_pois() {
    let harness = harness(OrchestratorConfig::default()).await;
    let user_id = Uuid::new_v4();
    let cancel = CancellationToken::new();

    let mut latest = None;
    for _ in 0..3 {
        let bundle = harness
            .orchestrator
            .generate_city_data(&request(user_id), &cancel)
            .await
            .unwrap();
        latest = bundle.personalized.and_then(|personalized| personalized.interaction_id);
    }

    let itinerary = harness
        .store
        .find_itinerary(user_id, harness.porto)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(itinerary.source_llm_interaction_id, latest);

    let query = DistanceQuery::around(GeoPoint::new(-8.61, 41.14)).in_city(harness.porto);
    let canonical = harness.store.pois_by_distance(&query).await.unwrap();
    assert_eq!(canonical.len(), 3);
    assert_eq!(harness.orchestrator.metrics().snapshot().interactions_saved_total, 3);
}

#[tokio::test]
async fn suggestions_are_ranked_per_interaction() {
    let harness = harness(OrchestratorConfig {
        persist_suggestions: true,
        ..OrchestratorConfig::default()
    })
    .await;

    let bundle = harness
        .orchestrator
        .generate_city_data(&request(Uuid::new_v4()), &CancellationToken::new())
        .await
        .unwrap();
    let interaction_id = bundle
        .personalized
        .and_then(|personalized| personalized.interaction_id)
        .expect("personalized interaction saved");

    let query =
        DistanceQuery::around(GeoPoint::new(-8.6598, 41.1596)).for_interaction(interaction_id);
    let ranked = harness.store.pois_by_distance(&query).await.unwrap();
    assert_eq!(
        ranked.iter().map(|poi| poi.name.as_str()).collect::<Vec<_>>(),
        vec!["Serralves", "Livraria Lello"]
    );
}
