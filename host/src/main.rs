//! matchproof - CLI and HTTP server
//!
//! Usage:
//!   matchproof serve [--port <port>] [policy options]
//!   matchproof migrate --database-url <url>
//!   matchproof signer [--key <spec>]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use matchproof_host::chain::{
    ChainMirror, HttpLedgerNode, KeySource, LedgerNode, SimulatedLedger, TxSigner,
};
use matchproof_host::events::LogSink;
use matchproof_host::roles::Roster;
use matchproof_host::server::{build_router, AppState};
use matchproof_host::{Engine, EngineConfig, MemoryStore, PgStore, PolicyArgs, Store};

#[derive(Parser)]
#[command(name = "matchproof", about = "Match result attestation service", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP attestation service
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "PORT", default_value = "8080")]
        port: u16,
        /// PostgreSQL URL; an in-memory store is used when absent
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        #[arg(long, env = "MATCHPROOF_DB_MAX_CONNECTIONS", default_value_t = 10)]
        db_max_connections: u32,
        /// Shared key expected in X-Api-Key; auth is disabled when absent
        #[arg(long, env = "MATCHPROOF_API_KEY")]
        api_key: Option<String>,
        /// Ledger node base URL; a simulated ledger is used when absent
        #[arg(long, env = "LEDGER_NODE_URL")]
        ledger_url: Option<String>,
        #[arg(long, env = "LEDGER_NODE_TOKEN")]
        ledger_token: Option<String>,
        /// Signing key: ed25519://<seed> or a path to a key file
        #[arg(long, env = "CHAIN_SIGNER_KEY")]
        signer_key: Option<String>,
        /// Role assignments, e.g. ref-jane=REFEREE,coach-bo=COACH
        #[arg(long, env = "MATCHPROOF_ROLES", value_delimiter = ',')]
        roles: Vec<String>,
        #[command(flatten)]
        policy: PolicyArgs,
    },
    /// Apply database migrations and exit
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Print the ledger account address for a signing key
    Signer {
        #[arg(long, env = "CHAIN_SIGNER_KEY")]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            database_url,
            db_max_connections,
            api_key,
            ledger_url,
            ledger_token,
            signer_key,
            roles,
            policy,
        } => {
            let config = EngineConfig::from(policy);

            let store: Arc<dyn Store> = match database_url {
                Some(url) => {
                    let store = PgStore::connect(&url, db_max_connections)
                        .await
                        .context("connecting to database")?;
                    store.migrate().await.context("applying migrations")?;
                    tracing::info!("Connected to database");
                    Arc::new(store)
                }
                None => {
                    tracing::warn!("DATABASE_URL not set, using in-memory store");
                    Arc::new(MemoryStore::new())
                }
            };

            let node: Arc<dyn LedgerNode> = match ledger_url {
                Some(url) => Arc::new(
                    HttpLedgerNode::new(&url, ledger_token).context("building ledger client")?,
                ),
                None => {
                    tracing::warn!("LEDGER_NODE_URL not set, mirroring to a simulated ledger");
                    Arc::new(SimulatedLedger::new())
                }
            };

            let signer = TxSigner::load(&KeySource::from_spec(signer_key.as_deref()))
                .context("loading signing key")?;
            let mirror = Arc::new(ChainMirror::new(node, signer, store.clone(), config.mirror.clone()));
            tracing::info!(
                ledger = mirror.node_name(),
                account = %mirror.signer_address(),
                "Chain mirror ready"
            );

            let roster = Roster::from_entries(&roles)
                .context("parsing MATCHPROOF_ROLES")?;
            if config.resolvers.is_empty() {
                tracing::warn!("No resolvers configured; disputes cannot be resolved");
            }

            let engine = Arc::new(Engine::new(
                store,
                mirror,
                Arc::new(roster),
                Arc::new(LogSink),
                config,
            ));

            let app = build_router(AppState {
                engine: engine.clone(),
                api_key,
            });

            // Spawn retry loop
            tokio::spawn(matchproof_host::retry::retry_loop(engine));

            let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
            tracing::info!("Attestation service listening on port {}", port);
            axum::serve(listener, app).await?;
        }
        Commands::Migrate { database_url } => {
            let store = PgStore::connect(&database_url, 1)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("Migrations applied");
        }
        Commands::Signer { key } => {
            let signer = TxSigner::load(&KeySource::from_spec(key.as_deref()))
                .context("loading signing key")?;
            println!("{}", signer.address());
        }
    }

    Ok(())
}
