use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Stage of a multi-statement write, reported with the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStep {
    BeginTransaction,
    InsertInteraction,
    ResolveCity,
    UpsertItinerary,
    ResolvePoi,
    LinkItineraryPois,
    CheckInteraction,
    InsertSuggestedPois,
    Commit,
}

impl fmt::Display for PersistStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BeginTransaction => "begin transaction",
            Self::InsertInteraction => "insert llm interaction",
            Self::ResolveCity => "resolve city",
            Self::UpsertItinerary => "upsert itinerary",
            Self::ResolvePoi => "resolve point of interest",
            Self::LinkItineraryPois => "link itinerary points of interest",
            Self::CheckInteraction => "check llm interaction",
            Self::InsertSuggestedPois => "insert suggested points of interest",
            Self::Commit => "commit",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{step} failed: {source}")]
    Step {
        step: PersistStep,
        #[source]
        source: sqlx::Error,
    },
    #[error("llm interaction {0} does not exist")]
    InteractionNotFound(Uuid),
    #[error("chat session {0} does not exist")]
    SessionNotFound(Uuid),
    #[error("corrupt {table} row: {detail}")]
    CorruptRow { table: &'static str, detail: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn step(&self) -> Option<PersistStep> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

pub(crate) fn at(step: PersistStep) -> impl FnOnce(sqlx::Error) -> StorageError {
    move |source| StorageError::Step { step, source }
}
