use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use atlas_agents::{
    CityDataRequest, GeminiClient, GenerationConfig, GenerationOrchestrator, OrchestratorConfig,
    DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL,
};
use atlas_core::{normalize_text, GeoPoint, MessageClassifier, TravelProfile};
use atlas_observability::{init_tracing, AppMetrics};
use atlas_storage::{DistanceQuery, PoiRepository, SqliteStore};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Orchestrator = GenerationOrchestrator<GeminiClient, SqliteStore>;

#[derive(Debug, Parser)]
#[command(name = "concierge")]
#[command(about = "Atlas itinerary pipeline CLI")]
struct Cli {
    #[arg(long, env = "ATLAS_DATABASE_URL", default_value = "sqlite::memory:", global = true)]
    database_url: String,

    #[arg(long, env = "ATLAS_GEMINI_API_KEY", hide_env_values = true, global = true)]
    gemini_api_key: Option<String>,

    #[arg(long, env = "ATLAS_GEMINI_MODEL", default_value = DEFAULT_GEMINI_MODEL, global = true)]
    gemini_model: String,

    #[arg(long, env = "ATLAS_GEMINI_BASE_URL", default_value = DEFAULT_GEMINI_BASE_URL, global = true)]
    gemini_base_url: String,

    #[arg(long, env = "ATLAS_STREAM_SEND_TIMEOUT_MS", default_value_t = 2500, global = true)]
    stream_send_timeout_ms: u64,

    #[arg(long, env = "ATLAS_PERSIST_SUGGESTIONS", global = true)]
    persist_suggestions: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Classify {
        text: String,
    },
    SeedCity {
        #[arg(long)]
        name: String,
        #[arg(long)]
        country: String,
    },
    Generate {
        #[arg(long)]
        city: String,
        #[arg(long)]
        user_id: Uuid,
        #[arg(long = "interest")]
        interests: Vec<String>,
        #[arg(long)]
        stream: bool,
    },
    Ask {
        #[arg(long)]
        city: String,
        #[arg(long)]
        user_id: Uuid,
        message: String,
    },
    Chat {
        #[arg(long)]
        city: String,
        #[arg(long)]
        user_id: Uuid,
    },
    Nearby {
        #[arg(long)]
        lat: f64,
        #[arg(long)]
        lon: f64,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        interaction: Option<Uuid>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("atlas_cli");
    let cli = Cli::parse();

    if let Command::Classify { text } = &cli.command {
        let classifier = MessageClassifier::new().context("failed compiling classifier")?;
        let classification = classifier.classify(&normalize_text(text));
        println!("{}", serde_json::to_string_pretty(&classification)?);
        return Ok(());
    }

    let store = SqliteStore::connect(&cli.database_url).await?;

    match &cli.command {
        Command::Classify { .. } => {}
        Command::SeedCity { name, country } => {
            let city_id = store.upsert_city(name, country).await?;
            println!("{}", serde_json::json!({ "city_id": city_id, "name": name }));
        }
        Command::Generate {
            city,
            user_id,
            interests,
            stream,
        } => {
            let orchestrator = build_orchestrator(&cli, store)?;
            let request = CityDataRequest::new(*user_id, city, profile(*user_id, interests));
            let cancel = cancel_on_ctrl_c();

            if *stream {
                run_stream(&orchestrator, &request, &cancel).await?;
            } else {
                let bundle = orchestrator.generate_city_data(&request, &cancel).await?;
                println!("{}", serde_json::to_string_pretty(&bundle)?);
            }
        }
        Command::Ask {
            city,
            user_id,
            message,
        } => {
            let orchestrator = build_orchestrator(&cli, store)?;
            let request = CityDataRequest::new(*user_id, city, profile(*user_id, &[]));
            let reply = orchestrator
                .respond_to_message(&request, &normalize_text(message), &cancel_on_ctrl_c())
                .await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Command::Chat { city, user_id } => {
            let orchestrator = build_orchestrator(&cli, store)?;
            run_chat(&orchestrator, city, *user_id).await?;
        }
        Command::Nearby {
            lat,
            lon,
            city,
            interaction,
            limit,
        } => {
            let mut query = DistanceQuery::around(GeoPoint::new(*lon, *lat));
            if let Some(city) = city {
                let city_id = store
                    .find_city_id_by_name(city)
                    .await?
                    .with_context(|| format!("unknown city {city}"))?;
                query = query.in_city(city_id);
            }
            if let Some(interaction) = interaction {
                query = query.for_interaction(*interaction);
            }
            if let Some(limit) = limit {
                query = query.limit(*limit);
            }

            let ranked = store.pois_by_distance(&query).await?;
            println!("{}", serde_json::to_string_pretty(&ranked)?);
        }
    }

    Ok(())
}

fn build_orchestrator(cli: &Cli, store: SqliteStore) -> Result<Orchestrator> {
    let api_key = cli
        .gemini_api_key
        .as_deref()
        .context("ATLAS_GEMINI_API_KEY is required for generation")?;
    let client = GeminiClient::new(api_key, &cli.gemini_model, &cli.gemini_base_url)?;
    let classifier = MessageClassifier::new().context("failed compiling classifier")?;

    Ok(GenerationOrchestrator::new(
        Arc::new(client),
        Arc::new(store),
        Arc::new(classifier),
        AppMetrics::shared(),
        OrchestratorConfig {
            generation: GenerationConfig::default(),
            send_timeout: Duration::from_millis(cli.stream_send_timeout_ms),
            persist_suggestions: cli.persist_suggestions,
        },
    ))
}

fn profile(user_id: Uuid, interests: &[String]) -> TravelProfile {
    TravelProfile {
        user_id,
        interests: interests.to_vec(),
        ..TravelProfile::default()
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

async fn run_stream(
    orchestrator: &Orchestrator,
    request: &CityDataRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(4);

    let producer = async {
        let delivered = orchestrator.stream_city_data(request, &tx, cancel).await;
        drop(tx);
        delivered
    };
    let consumer = async {
        while let Some(result) = rx.recv().await {
            println!("{}", serde_json::to_string(&result)?);
        }
        Ok::<_, anyhow::Error>(())
    };

    let (delivered, printed) = tokio::join!(producer, consumer);
    printed?;
    delivered?;
    Ok(())
}

async fn run_chat(orchestrator: &Orchestrator, city: &str, user_id: Uuid) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let profile = profile(user_id, &[]);
    let request = CityDataRequest::new(user_id, city, profile.clone());

    let initial = match orchestrator.generate_city_data(&request, &cancel).await {
        Ok(bundle) => Some(bundle.to_city_response()),
        Err(err) => {
            eprintln!("starting without an itinerary: {err}");
            None
        }
    };
    let session = orchestrator.start_session(&profile, city, initial).await?;

    println!("Atlas itinerary chat for {city}. type 'exit' to quit.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }

        let message = normalize_text(&line);
        if message.eq_ignore_ascii_case("exit") || message.eq_ignore_ascii_case("quit") {
            break;
        }

        if message.is_empty() {
            continue;
        }

        let reply = orchestrator
            .continue_session(session.id, &message, &cancel)
            .await?;
        println!("\n{}\n", reply.reply);

        if let Some(itinerary) = &reply.itinerary {
            let stops = itinerary
                .itinerary_response
                .points_of_interest
                .iter()
                .map(|poi| poi.name.as_str())
                .collect::<Vec<_>>();
            if !stops.is_empty() {
                println!("Stops: {}\n", stops.join(" -> "));
            }
        }
    }

    Ok(())
}
