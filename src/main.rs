//! # kbserve CLI
//!
//! The `kbserve` binary runs the HTTP service and manages tenants, API
//! keys, and usage from the command line.
//!
//! ## Usage
//!
//! ```bash
//! kbserve --config ./kbserve.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbserve init` | Create the SQLite database, run migrations, seed plans |
//! | `kbserve serve` | Start the HTTP API server |
//! | `kbserve create-tenant <email> --plan <name>` | Register a tenant on a plan |
//! | `kbserve assign-plan <tenant-id> <plan>` | Move a tenant to another plan |
//! | `kbserve suspend-tenant <tenant-id>` | Freeze a tenant without deleting data |
//! | `kbserve resume-tenant <tenant-id>` | Lift a suspension |
//! | `kbserve create-key <tenant-id>` | Mint an API key (secret shown once) |
//! | `kbserve list-keys <tenant-id>` | List a tenant's keys |
//! | `kbserve revoke-key <key-id>` | Disable a key, keeping its data |
//! | `kbserve delete-key <key-id>` | Delete a key and everything it owns |
//! | `kbserve usage <tenant-id>` | Print a tenant's current counters |
//! | `kbserve reset-usage <tenant-id>` | Billing-period rollover |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use kbserve::config::{load_config, Config};
use kbserve::db::connect;
use kbserve::embedding::create_embedder;
use kbserve::ledger::UsageLedger;
use kbserve::migrate::{run_migrations, seed_plans};
use kbserve::registry::Registry;
use kbserve::server::run_server;
use kbserve::store::DocumentStore;
use kbserve::vector::SqliteVectorStore;

/// kbserve — multi-tenant retrieval-augmented chat with metered billing.
#[derive(Parser)]
#[command(
    name = "kbserve",
    about = "Multi-tenant retrieval-augmented chat service with metered billing",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./kbserve.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and seed the plan catalog.
    ///
    /// Idempotent; running it against an existing database is safe.
    Init,

    /// Start the HTTP API server.
    Serve,

    /// Register a tenant on a plan. Also creates its usage ledger row.
    CreateTenant {
        email: String,
        /// Plan name: free, pro, or enterprise.
        #[arg(long, default_value = "free")]
        plan: String,
    },

    /// Move a tenant to another plan. Usage counters are untouched.
    AssignPlan {
        tenant_id: String,
        plan: String,
    },

    /// Freeze all of a tenant's operations without deleting any data.
    SuspendTenant { tenant_id: String },

    /// Lift a suspension.
    ResumeTenant { tenant_id: String },

    /// Mint an API key for a tenant. The secret is printed exactly once.
    CreateKey {
        tenant_id: String,
        /// Per-key generator override: groq, openai, or ollama.
        #[arg(long)]
        generator: Option<String>,
    },

    /// List a tenant's API keys (ids only, never secrets).
    ListKeys { tenant_id: String },

    /// Disable a key without deleting its documents.
    RevokeKey { key_id: String },

    /// Delete a key and every document and vector it owns, freeing the
    /// tenant's stored chars.
    DeleteKey { key_id: String },

    /// Print a tenant's current usage counters.
    Usage { tenant_id: String },

    /// Billing-period rollover: zero ingested chars and chat tokens.
    /// Stored chars persist, matching what the tenant still holds.
    ResetUsage { tenant_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = connect(&config.db.path).await?;
            run_migrations(&pool).await?;
            seed_plans(&pool).await?;
            println!("Database initialized at {}", config.db.path.display());
        }
        Commands::Serve => {
            run_server(&config).await?;
        }
        Commands::CreateTenant { email, plan } => {
            let registry = open_registry(&config).await?;
            let tenant = registry.create_tenant(&email, &plan).await?;
            println!("Created tenant {} ({}) on plan '{}'", tenant.id, tenant.email, plan);
        }
        Commands::AssignPlan { tenant_id, plan } => {
            let registry = open_registry(&config).await?;
            let plan = registry.assign_plan(&tenant_id, &plan).await?;
            println!("Tenant {} is now on plan '{}'", tenant_id, plan.name);
        }
        Commands::SuspendTenant { tenant_id } => {
            let registry = open_registry(&config).await?;
            registry.set_tenant_active(&tenant_id, false).await?;
            println!("Suspended tenant {}", tenant_id);
        }
        Commands::ResumeTenant { tenant_id } => {
            let registry = open_registry(&config).await?;
            registry.set_tenant_active(&tenant_id, true).await?;
            println!("Resumed tenant {}", tenant_id);
        }
        Commands::CreateKey {
            tenant_id,
            generator,
        } => {
            let registry = open_registry(&config).await?;
            let raw = registry.create_key(&tenant_id, generator.as_deref()).await?;
            println!("API key (store it now, it will not be shown again):");
            println!("{}", raw);
        }
        Commands::ListKeys { tenant_id } => {
            let registry = open_registry(&config).await?;
            for key in registry.list_keys(&tenant_id).await? {
                let status = if key.is_active { "active" } else { "revoked" };
                let generator = key.generator.as_deref().unwrap_or("default");
                println!("{}  {}  generator={}", key.id, status, generator);
            }
        }
        Commands::RevokeKey { key_id } => {
            let registry = open_registry(&config).await?;
            registry.revoke_key(&key_id).await?;
            println!("Revoked key {}", key_id);
        }
        Commands::DeleteKey { key_id } => {
            let pool = connect(&config.db.path).await?;
            let registry = Registry::new(pool.clone());
            let ledger = UsageLedger::new(pool.clone());

            let key = registry.get_key(&key_id).await?;

            let embedder: Arc<dyn kbserve::embedding::Embedder> =
                Arc::from(create_embedder(&config.embedding)?);
            let vectors = Arc::new(SqliteVectorStore::new(pool.clone()));
            let store = DocumentStore::new(pool, vectors, embedder, config.chunking.max_chars);

            let (deleted, freed) = store.delete_all_for_key(&key.id).await?;
            ledger.decrement_stored(&key.tenant_id, freed).await?;
            registry.delete_key_row(&key.id).await?;

            println!(
                "Deleted key {} with {} documents, freeing {} stored chars",
                key_id, deleted, freed
            );
        }
        Commands::Usage { tenant_id } => {
            let pool = connect(&config.db.path).await?;
            let usage = UsageLedger::new(pool).get(&tenant_id).await?;
            println!("ingested_chars: {}", usage.ingested_chars);
            println!("stored_chars:   {}", usage.stored_chars);
            println!("chat_tokens:    {}", usage.chat_tokens);
        }
        Commands::ResetUsage { tenant_id } => {
            let pool = connect(&config.db.path).await?;
            UsageLedger::new(pool).reset_period(&tenant_id).await?;
            println!("Reset monthly counters for tenant {}", tenant_id);
        }
    }

    Ok(())
}

async fn open_registry(config: &Config) -> anyhow::Result<Registry> {
    let pool = connect(&config.db.path).await?;
    Ok(Registry::new(pool))
}
