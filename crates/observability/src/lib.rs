use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, Default)]
pub struct AppMetrics {
    generation_calls_total: AtomicU64,
    generation_failures_total: AtomicU64,
    tokens_total: AtomicU64,
    interactions_saved_total: AtomicU64,
    pois_linked_total: AtomicU64,
    total_generation_latency_millis: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generation_calls_total: u64,
    pub generation_failures_total: u64,
    pub tokens_total: u64,
    pub interactions_saved_total: u64,
    pub pois_linked_total: u64,
    pub avg_generation_latency_millis: f64,
}

impl AppMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_generation_call(&self) {
        self.generation_calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_generation_failure(&self) {
        self.generation_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tokens(&self, tokens: i64) {
        self.tokens_total
            .fetch_add(tokens.max(0) as u64, Ordering::Relaxed);
    }

    pub fn record_saved_interaction(&self, linked_pois: usize) {
        self.interactions_saved_total
            .fetch_add(1, Ordering::Relaxed);
        self.pois_linked_total
            .fetch_add(linked_pois as u64, Ordering::Relaxed);
    }

    pub fn observe_generation_latency(&self, duration: Duration) {
        self.total_generation_latency_millis
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let calls = self.generation_calls_total.load(Ordering::Relaxed);
        let latency = self.total_generation_latency_millis.load(Ordering::Relaxed);

        MetricsSnapshot {
            generation_calls_total: calls,
            generation_failures_total: self.generation_failures_total.load(Ordering::Relaxed),
            tokens_total: self.tokens_total.load(Ordering::Relaxed),
            interactions_saved_total: self.interactions_saved_total.load(Ordering::Relaxed),
            pois_linked_total: self.pois_linked_total.load(Ordering::Relaxed),
            avg_generation_latency_millis: if calls == 0 {
                0.0
            } else {
                latency as f64 / calls as f64
            },
        }
    }
}

pub fn init_tracing(service_name: &str) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}=info,atlas_agents=info,atlas_storage=info",
                service_name
            ))
        });

        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(true)
            .init();
    });
}
