use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoLocal;
use viva_api::config::Config;
use viva_api::{AppState, question_bank, router};
use viva_core::credentials::JwtCredentials;
use viva_core::evaluator::EvaluatorClient;
use viva_core::ledger::{MemoryLedger, ScoreLedger};
use viva_core::postgres::PgStore;
use viva_core::question_store::{MemoryQuestionStore, QuestionStore};
use viva_core::transcriber::WhisperClient;
use viva_core::{Collaborators, Identity, SessionRegistry};

#[derive(Parser)]
#[command(version, about = "Spoken-answer quiz server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket server (the default).
    Serve,
    /// Print a signed credential for an identity.
    Token {
        identity: String,
        /// Minutes until the credential expires.
        #[arg(long, default_value_t = 60)]
        minutes: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Parse Command-Line Arguments ---
    let cli = Cli::parse();

    // --- 2. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 3. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    let credentials = JwtCredentials::new(config.jwt_secret.expose_secret().as_bytes());

    match cli.command.unwrap_or(Command::Serve) {
        Command::Token { identity, minutes } => {
            let token = credentials
                .issue(&Identity::new(identity), chrono::Duration::minutes(minutes))
                .context("Failed to sign credential")?;
            println!("{token}");
            Ok(())
        }
        Command::Serve => serve(config, credentials).await,
    }
}

async fn serve(config: Config, credentials: JwtCredentials) -> Result<()> {
    tracing::info!("Configuration loaded successfully. Starting quiz service...");

    // --- 4. Storage ---
    let questions: Arc<dyn QuestionStore>;
    let ledger: Arc<dyn ScoreLedger>;
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url.expose_secret(), config.database_max_connections).await?;
            store.ensure_schema().await?;
            tracing::info!("Using Postgres for questions and scores");
            let store = Arc::new(store);
            questions = store.clone();
            ledger = store;
        }
        None => {
            tracing::warn!("DATABASE_URL is not set; questions and scores are kept in memory");
            questions = Arc::new(MemoryQuestionStore::new());
            ledger = Arc::new(MemoryLedger::new());
        }
    }

    if let Some(dir) = &config.question_bank_dir {
        let seeded = question_bank::seed(questions.as_ref(), dir)
            .await
            .context("Failed to load question banks")?;
        tracing::info!("Loaded question banks for {} identities.", seeded);
    }

    // --- 5. Initialize API Clients ---
    let api_key = config.require_openai_key()?.expose_secret().to_string();
    let transcriber = WhisperClient::with_base_url(
        api_key.clone(),
        config.transcription_model.clone(),
        config.openai_base_url.clone(),
    );
    let evaluator = EvaluatorClient::with_base_url(
        api_key,
        config.chat_model.clone(),
        config.openai_base_url.clone(),
    );

    // --- 6. Application Setup ---
    let deps = Collaborators {
        questions,
        transcriber: Arc::new(transcriber),
        evaluator: Arc::new(evaluator),
        ledger,
    };
    let state = AppState {
        registry: Arc::new(SessionRegistry::new(deps, config.session.clone())),
        credentials: Arc::new(credentials),
    };
    let app = router(state);

    tracing::info!("Starting WebSocket server, listening on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}
