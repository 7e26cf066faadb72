use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use atlas_core::MessageClassifier;
use atlas_observability::AppMetrics;
use atlas_storage::SqliteStore;

use crate::client::{GenerateResponse, GenerationClient, GenerationConfig, UsageMetadata};
use crate::orchestrator::{GenerationOrchestrator, OrchestratorConfig};

pub const CITY_NEEDLE: &str = "Describe the city of";
pub const GENERIC_NEEDLE: &str = "well-known points of interest";
pub const PERSONALIZED_NEEDLE: &str = "personalised one-day itinerary";

pub const CITY_JSON: &str = r#"```json
{"city": "Porto", "country": "Portugal", "description": "River city", "center_latitude": 41.1496, "center_longitude": -8.611}
```"#;

pub const GENERIC_JSON: &str = r#"{"points_of_interest": [
  {"name": "Livraria Lello", "latitude": 41.1468, "longitude": -8.6148, "category": "Bookshop"},
  {"name": "Clerigos Tower", "latitude": 41.1457, "longitude": -8.6143, "category": "Landmark"},
]}"#;

pub const ITINERARY_JSON: &str = r#"{"itinerary_name": "Port and azulejos", "overall_description": "A slow day",
  "points_of_interest": [
    {"name": "Sao Bento Station", "latitude": 41.1456, "longitude": -8.6105, "description_poi": "Tiles first"},
    {"name": "Ribeira", "latitude": 41.1408, "longitude": -8.6131, "description_poi": "Lunch by the river"}
  ]}"#;

/// Answers by the first needle contained in the prompt; anything else fails.
#[derive(Default)]
pub struct ScriptedClient {
    script: Vec<(&'static str, Result<String, String>)>,
    delay: Option<Duration>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, needle: &'static str, text: impl Into<String>) -> Self {
        self.script.push((needle, Ok(text.into())));
        self
    }

    pub fn fail(mut self, needle: &'static str, message: impl Into<String>) -> Self {
        self.script.push((needle, Err(message.into())));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl GenerationClient for ScriptedClient {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str, _config: &GenerationConfig) -> Result<GenerateResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let (_, answer) = self
            .script
            .iter()
            .find(|(needle, _)| prompt.contains(needle))
            .ok_or_else(|| anyhow!("no scripted reply for prompt"))?;

        match answer {
            Ok(text) => {
                let mut response = GenerateResponse::from_text(text.clone());
                response.usage_metadata = Some(UsageMetadata {
                    prompt_token_count: 10,
                    candidates_token_count: 32,
                    total_token_count: 42,
                });
                Ok(response)
            }
            Err(message) => Err(anyhow!(message.clone())),
        }
    }
}

pub fn orchestrator(
    client: ScriptedClient,
    store: SqliteStore,
    config: OrchestratorConfig,
) -> GenerationOrchestrator<ScriptedClient, SqliteStore> {
    let classifier = MessageClassifier::new().expect("classifier patterns compile");
    GenerationOrchestrator::new(
        Arc::new(client),
        Arc::new(store),
        Arc::new(classifier),
        AppMetrics::shared(),
        config,
    )
}
