use std::sync::Arc;
use std::time::{Duration, Instant};

use atlas_core::normalize::parse_loose_collections;
use atlas_core::prompts::{
    city_description_prompt, domain_prompt, generic_pois_prompt, personalized_itinerary_prompt,
};
use atlas_core::{
    clean_json_response, extract_city_data, extract_itinerary, extract_pois, AiCityResponse,
    AiItineraryResponse, Classification, Domain, GeneralCityData, LlmInteraction,
    MessageClassifier, PoiDetail, TravelProfile,
};
use atlas_observability::AppMetrics;
use atlas_storage::{
    InteractionRepository, PoiRepository, SavedInteraction, StorageError, StorageResult,
};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::client::{GenerationClient, GenerationConfig, UsageMetadata};
use crate::stream::{deliver_with_timeout, DeliveryError, DEFAULT_SEND_TIMEOUT};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub generation: GenerationConfig,
    /// Deadline for handing one streamed result to the consumer.
    pub send_timeout: Duration,
    /// Store generic POIs as suggestions of the personalized interaction.
    pub persist_suggestions: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            persist_suggestions: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    CityDescription,
    GenericPois,
    PersonalizedPois,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [
        WorkerKind::CityDescription,
        WorkerKind::GenericPois,
        WorkerKind::PersonalizedPois,
    ];

    pub fn as_code(self) -> &'static str {
        match self {
            Self::CityDescription => "city_description",
            Self::GenericPois => "generic_pois",
            Self::PersonalizedPois => "personalized_pois",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(String),
    #[error("model returned an empty response")]
    EmptyResponse,
    #[error("could not decode model output: {0}")]
    Decode(String),
    #[error("generation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("all generation workers failed ({} errors)", .0.len())]
    AllTasksFailed(Vec<WorkerFailure>),
    #[error("request cancelled")]
    Cancelled,
    #[error("session {0} is no longer active")]
    SessionInactive(Uuid),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CityDataRequest {
    pub user_id: Uuid,
    pub city: String,
    pub profile: TravelProfile,
    /// Set for chat-session turns, whose interactions are logged but never linked.
    pub session_id: Option<Uuid>,
}

impl CityDataRequest {
    pub fn new(user_id: Uuid, city: impl Into<String>, profile: TravelProfile) -> Self {
        Self {
            user_id,
            city: city.into(),
            profile,
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonalizedItinerary {
    pub itinerary: AiItineraryResponse,
    /// `None` when the interaction row could not be written.
    pub interaction_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkerOutput {
    City(GeneralCityData),
    GenericPois(Vec<PoiDetail>),
    Personalized(PersonalizedItinerary),
}

/// Exactly one per worker, tagged so arrival order never matters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerResult {
    pub kind: WorkerKind,
    pub outcome: Result<WorkerOutput, GenerationError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerFailure {
    pub kind: WorkerKind,
    pub error: GenerationError,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CityDataBundle {
    pub city: Option<GeneralCityData>,
    pub generic_pois: Option<Vec<PoiDetail>>,
    pub personalized: Option<PersonalizedItinerary>,
    pub errors: Vec<WorkerFailure>,
}

impl CityDataBundle {
    pub fn merge(results: impl IntoIterator<Item = WorkerResult>) -> Self {
        let mut bundle = Self::default();
        for result in results {
            match result.outcome {
                Ok(WorkerOutput::City(city)) => bundle.city = Some(city),
                Ok(WorkerOutput::GenericPois(pois)) => bundle.generic_pois = Some(pois),
                Ok(WorkerOutput::Personalized(personalized)) => {
                    bundle.personalized = Some(personalized)
                }
                Err(error) => bundle.errors.push(WorkerFailure {
                    kind: result.kind,
                    error,
                }),
            }
        }
        bundle
    }

    pub fn error_for(&self, kind: WorkerKind) -> Option<&GenerationError> {
        self.errors
            .iter()
            .find(|failure| failure.kind == kind)
            .map(|failure| &failure.error)
    }

    pub fn succeeded(&self) -> usize {
        usize::from(self.city.is_some())
            + usize::from(self.generic_pois.is_some())
            + usize::from(self.personalized.is_some())
    }

    /// Flattens whatever succeeded into the session snapshot shape.
    pub fn to_city_response(&self) -> AiCityResponse {
        AiCityResponse {
            general_city_data: self.city.clone().unwrap_or_default(),
            points_of_interest: self.generic_pois.clone().unwrap_or_default(),
            itinerary_response: self
                .personalized
                .as_ref()
                .map(|personalized| personalized.itinerary.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyOutcome {
    CityData(CityDataBundle),
    DomainSuggestions {
        domain: Domain,
        pois: Vec<PoiDetail>,
        interaction_id: Uuid,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageReply {
    pub classification: Classification,
    pub outcome: ReplyOutcome,
}

pub(crate) struct Generated {
    pub(crate) text: String,
    pub(crate) usage: UsageMetadata,
    pub(crate) latency: Duration,
}

pub struct GenerationOrchestrator<C, S> {
    pub(crate) client: Arc<C>,
    pub(crate) store: Arc<S>,
    pub(crate) classifier: Arc<MessageClassifier>,
    pub(crate) metrics: Arc<AppMetrics>,
    pub(crate) config: OrchestratorConfig,
}

impl<C, S> GenerationOrchestrator<C, S>
where
    C: GenerationClient,
    S: InteractionRepository + PoiRepository,
{
    pub fn new(
        client: Arc<C>,
        store: Arc<S>,
        classifier: Arc<MessageClassifier>,
        metrics: Arc<AppMetrics>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            store,
            classifier,
            metrics,
            config,
        }
    }

    pub fn classifier(&self) -> &MessageClassifier {
        &self.classifier
    }

    pub fn metrics(&self) -> &AppMetrics {
        &self.metrics
    }

    /// Runs the three generation workers concurrently and merges their results.
    ///
    /// A failing worker never cancels its siblings; only the failure of all
    /// three is an error.
    #[instrument(skip(self, request, cancel), fields(city = %request.city, user_id = %request.user_id))]
    pub async fn generate_city_data(
        &self,
        request: &CityDataRequest,
        cancel: &CancellationToken,
    ) -> Result<CityDataBundle, OrchestratorError> {
        let (city, generic, personalized) = tokio::join!(
            self.run_worker(WorkerKind::CityDescription, request, cancel),
            self.run_worker(WorkerKind::GenericPois, request, cancel),
            self.run_worker(WorkerKind::PersonalizedPois, request, cancel),
        );

        let bundle = CityDataBundle::merge([city, generic, personalized]);
        if bundle.succeeded() == 0 {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            return Err(OrchestratorError::AllTasksFailed(bundle.errors));
        }

        if self.config.persist_suggestions {
            self.persist_suggestions(request, &bundle).await;
        }

        info!(
            succeeded = bundle.succeeded(),
            failed = bundle.errors.len(),
            "city data generated"
        );
        Ok(bundle)
    }

    /// Same workers as [`Self::generate_city_data`], each result delivered to
    /// `tx` as soon as it completes. Returns the number of delivered results.
    #[instrument(skip(self, request, tx, cancel), fields(city = %request.city))]
    pub async fn stream_city_data(
        &self,
        request: &CityDataRequest,
        tx: &mpsc::Sender<WorkerResult>,
        cancel: &CancellationToken,
    ) -> Result<usize, OrchestratorError> {
        let mut pending = WorkerKind::ALL
            .into_iter()
            .map(|kind| self.run_worker(kind, request, cancel))
            .collect::<FuturesUnordered<_>>();

        let mut delivered = 0;
        let mut failures = Vec::new();
        while let Some(result) = pending.next().await {
            if let Err(error) = &result.outcome {
                failures.push(WorkerFailure {
                    kind: result.kind,
                    error: error.clone(),
                });
            }

            let kind = result.kind;
            if let Err(err) = deliver_with_timeout(tx, result, self.config.send_timeout).await {
                warn!(worker = kind.as_code(), error = %err, "stopping stream delivery");
                return Err(err.into());
            }
            delivered += 1;
        }

        if failures.len() == WorkerKind::ALL.len() {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            return Err(OrchestratorError::AllTasksFailed(failures));
        }
        Ok(delivered)
    }

    /// Classifies `message` and routes it: itinerary and general requests run
    /// the full fan-out, the other domains a single domain generation.
    #[instrument(skip(self, request, message, cancel), fields(city = %request.city))]
    pub async fn respond_to_message(
        &self,
        request: &CityDataRequest,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<MessageReply, OrchestratorError> {
        let classification = self.classifier.classify(message);
        info!(domain = ?classification.domain, intent = ?classification.intent, "message classified");

        let outcome = match classification.domain {
            Domain::Itinerary | Domain::General => {
                ReplyOutcome::CityData(self.generate_city_data(request, cancel).await?)
            }
            domain => {
                let prompt = domain_prompt(domain, &request.city, &request.profile, message);
                let generated = match self.generate_cancellable(&prompt, cancel).await {
                    Ok(generated) => generated,
                    Err(err) => {
                        self.metrics.inc_generation_failure();
                        return Err(err.into());
                    }
                };

                let pois = parse_loose_collections(&clean_json_response(&generated.text))
                    .unwrap_or_default();
                let saved = self
                    .record_interaction(request, &prompt, &generated, Some(domain))
                    .await?;

                ReplyOutcome::DomainSuggestions {
                    domain,
                    pois,
                    interaction_id: saved.interaction_id,
                }
            }
        };

        Ok(MessageReply {
            classification,
            outcome,
        })
    }

    async fn run_worker(
        &self,
        kind: WorkerKind,
        request: &CityDataRequest,
        cancel: &CancellationToken,
    ) -> WorkerResult {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            outcome = self.execute_worker(kind, request) => outcome,
        };

        if let Err(err) = &outcome {
            self.metrics.inc_generation_failure();
            warn!(worker = kind.as_code(), error = %err, "generation worker failed");
        }
        WorkerResult { kind, outcome }
    }

    async fn execute_worker(
        &self,
        kind: WorkerKind,
        request: &CityDataRequest,
    ) -> Result<WorkerOutput, GenerationError> {
        match kind {
            WorkerKind::CityDescription => {
                let generated = self.generate(&city_description_prompt(&request.city)).await?;
                extract_city_data(&generated.text)
                    .map(WorkerOutput::City)
                    .map_err(|err| GenerationError::Decode(err.to_string()))
            }
            WorkerKind::GenericPois => {
                let generated = self.generate(&generic_pois_prompt(&request.city)).await?;
                let pois = extract_pois(&generated.text);
                if pois.is_empty() {
                    return Err(GenerationError::Decode(
                        "no points of interest in response".to_string(),
                    ));
                }
                Ok(WorkerOutput::GenericPois(pois))
            }
            WorkerKind::PersonalizedPois => {
                let prompt = personalized_itinerary_prompt(&request.city, &request.profile);
                let generated = self.generate(&prompt).await?;
                let itinerary = extract_itinerary(&generated.text).ok_or_else(|| {
                    GenerationError::Decode("no itinerary in response".to_string())
                })?;

                // Own transaction, independent of any caller-side persistence.
                let interaction_id = match self
                    .record_interaction(request, &prompt, &generated, None)
                    .await
                {
                    Ok(saved) => Some(saved.interaction_id),
                    Err(err) => {
                        warn!(error = %err, step = ?err.step(), "personalized interaction not saved");
                        None
                    }
                };

                Ok(WorkerOutput::Personalized(PersonalizedItinerary {
                    itinerary,
                    interaction_id,
                }))
            }
        }
    }

    async fn persist_suggestions(&self, request: &CityDataRequest, bundle: &CityDataBundle) {
        let (Some(personalized), Some(pois)) = (&bundle.personalized, &bundle.generic_pois) else {
            return;
        };
        let Some(interaction_id) = personalized.interaction_id else {
            return;
        };

        let result: StorageResult<Vec<Uuid>> = async {
            let city_id = self.store.find_city_id_by_name(&request.city).await?;
            self.store
                .save_llm_suggested_pois_batch(request.user_id, interaction_id, city_id, pois)
                .await
        }
        .await;

        match result {
            Ok(ids) => info!(%interaction_id, saved = ids.len(), "suggested POIs stored"),
            Err(err) => warn!(%interaction_id, error = %err, "suggested POIs not stored"),
        }
    }
}

impl<C, S> GenerationOrchestrator<C, S>
where
    C: GenerationClient,
    S: InteractionRepository,
{
    /// One model call: first text part, non-empty, with usage and latency.
    pub(crate) async fn generate(&self, prompt: &str) -> Result<Generated, GenerationError> {
        let started = Instant::now();
        self.metrics.inc_generation_call();

        let response = self
            .client
            .generate(prompt, &self.config.generation)
            .await
            .map_err(|err| GenerationError::Request(format!("{err:#}")))?;
        let latency = started.elapsed();
        self.metrics.observe_generation_latency(latency);

        let text = response
            .first_text()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or(GenerationError::EmptyResponse)?
            .to_string();
        let usage = response.usage_metadata.unwrap_or_default();
        self.metrics.add_tokens(usage.total_token_count);

        Ok(Generated {
            text,
            usage,
            latency,
        })
    }

    pub(crate) async fn generate_cancellable(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Generated, GenerationError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            generated = self.generate(prompt) => generated,
        }
    }

    pub(crate) async fn record_interaction(
        &self,
        request: &CityDataRequest,
        prompt: &str,
        generated: &Generated,
        reply_domain: Option<Domain>,
    ) -> StorageResult<SavedInteraction> {
        let mut interaction = LlmInteraction::new(
            request.user_id,
            Some(request.city.clone()),
            prompt,
            generated.text.as_str(),
            self.client.model_name(),
        );
        interaction.session_id = request.session_id;
        interaction.log_only = request.session_id.is_some();
        interaction.prompt_tokens = generated.usage.prompt_token_count;
        interaction.completion_tokens = generated.usage.candidates_token_count;
        interaction.total_tokens = generated.usage.total_token_count;
        interaction.latency_ms = i64::try_from(generated.latency.as_millis()).unwrap_or(i64::MAX);
        interaction.reply_domain = reply_domain;

        let saved = self.store.save_interaction(&interaction).await?;
        self.metrics.record_saved_interaction(saved.linked_pois);
        Ok(saved)
    }
}
