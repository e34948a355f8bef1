use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};

use mediq::config::ClinicProfile;
use mediq::db::{self, AppointmentStore};
use mediq::engine::{ChatRequest, Engine, EngineConfig, EngineDeps};
use mediq::eval;
use mediq::knowledge::KnowledgeStore;
use mediq::llm::OllamaClient;
use mediq::retrieval::{ingest, HashEmbedder, InMemoryVectorIndex, LexicalReranker};
use mediq::GuardrailTier;

#[derive(Parser)]
#[command(name = "mediq", version, about = "Multi-agent medical triage and consultation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Guardrail tier to run with.
    #[arg(long, global = true, default_value = "advanced")]
    tier: Tier,

    /// Ollama-compatible endpoint.
    #[arg(long, global = true, default_value = "http://localhost:11434")]
    ollama_url: String,

    /// Model served by the endpoint.
    #[arg(long, global = true, default_value = "llama3.2")]
    model: String,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Tier {
    Simple,
    Intermediate,
    Advanced,
}

impl From<Tier> for GuardrailTier {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Simple => Self::Simple,
            Tier::Intermediate => Self::Intermediate,
            Tier::Advanced => Self::Advanced,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine behind a line-oriented stdin transport.
    Serve {
        /// SQLite database for appointments, history and incidents.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Document corpus ingested into the vector index at startup.
        #[arg(long)]
        corpus: Option<PathBuf>,
    },

    /// Run an evaluation dataset against the public chat interface.
    Evaluate {
        #[arg(long)]
        dataset: PathBuf,

        #[arg(long)]
        output: PathBuf,
    },

    /// Validate and report on a document corpus (offline, not the turn path).
    Ingest {
        #[arg(long)]
        source: PathBuf,
    },
}

fn build_engine(cli: &Cli, db_path: Option<&PathBuf>, corpus: Option<&PathBuf>) -> anyhow::Result<Engine> {
    let profile = ClinicProfile::default();
    let embedder = Arc::new(HashEmbedder::default());
    let index = Arc::new(InMemoryVectorIndex::new());

    if let Some(corpus) = corpus {
        let count = ingest::ingest_directory(corpus, &*embedder, &index)?;
        eprintln!("Indexed {count} chunks from {}", corpus.display());
    }

    let appointment_conn = match db_path {
        Some(path) => db::open_database(path)?,
        None => db::open_memory_database()?,
    };
    let history_db = match db_path {
        Some(path) => Some(Arc::new(Mutex::new(db::open_database(path)?))),
        None => None,
    };

    Ok(Engine::new(
        EngineConfig { guardrail_tier: cli.tier.into(), ..Default::default() },
        EngineDeps {
            llm: Arc::new(OllamaClient::new(&cli.ollama_url, &cli.model, 15)),
            embedder,
            index,
            reranker: Arc::new(LexicalReranker::new()),
            knowledge: Arc::new(KnowledgeStore::new(profile.clone())),
            appointments: Arc::new(AppointmentStore::new(appointment_conn, profile)),
            history_db,
        },
    ))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mediq=info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Serve { db, corpus } => {
            let engine = build_engine(&cli, db.as_ref(), corpus.as_ref())?;
            serve(engine)
        }
        Command::Evaluate { dataset, output } => {
            let engine = build_engine(&cli, None, None)?;
            let cases = eval::load_dataset(dataset)?;
            let summary = eval::run_cases(&engine, cases)?;
            eval::write_summary(&summary, output)?;
            println!(
                "{} cases: {} passed, {} failed → {}",
                summary.total,
                summary.passed,
                summary.failed,
                output.display()
            );
            Ok(())
        }
        Command::Ingest { source } => {
            let embedder = HashEmbedder::default();
            let index = InMemoryVectorIndex::new();
            let count = ingest::ingest_directory(source, &embedder, &index)?;
            println!("{count} chunks indexed from {}", source.display());
            Ok(())
        }
    }
}

fn serve(engine: Engine) -> anyhow::Result<()> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    eprintln!("mediq ready — type a message, :report for the compliance report, :quit to exit");
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == ":quit" {
            break;
        }
        if line == ":report" {
            match engine.compliance_report(None) {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                None => println!("compliance reporting requires the advanced guardrail tier"),
            }
            continue;
        }

        match engine.chat(ChatRequest::text(session_id.clone(), line)) {
            Ok(outcome) => println!("{}\n", outcome.response),
            Err(e) => eprintln!("error ({:?}): {e}", e.code()),
        }
    }
    Ok(())
}
