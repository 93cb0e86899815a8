use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use shadow_refresh::config::{
    default_catalog, load_catalog, DatabaseConfig, PipelineConfig, DEFAULT_BASE_URL,
};
use shadow_refresh::db::postgres::IMDB_SCHEMA;
use shadow_refresh::db::{init_pool, MetadataStore, PgStore};
use shadow_refresh::metadata::MetadataHandle;
use shadow_refresh::observability::init_tracing;
use shadow_refresh::refresh::{HttpTransport, RefreshOrchestrator, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "shadow-refresh")]
#[command(about = "Keeps a PostgreSQL copy of a published dataset fresh with zero read downtime")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    db: DbArgs,

    #[command(flatten)]
    pipeline: PipelineArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct DbArgs {
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    db_host: String,

    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    db_port: u16,

    #[arg(long, env = "DB_USER", default_value = "postgres")]
    db_user: String,

    #[arg(long, env = "DB_NAME", default_value = "imdb")]
    db_name: String,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 4)]
    db_max_connections: u32,

    /// Leave trigger-based checks active during bulk loads.
    #[arg(long, env = "KEEP_TRIGGERS")]
    keep_triggers: bool,
}

#[derive(Args)]
struct PipelineArgs {
    /// Where downloaded artifacts are kept
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Artifacts at least this old are downloaded again
    #[arg(long, env = "MAX_AGE_DAYS", default_value_t = 7)]
    max_age_days: u32,

    #[arg(long, env = "CHECK_INTERVAL_SECS", default_value_t = 3600)]
    check_interval_secs: u64,

    #[arg(long, env = "STARTUP_DELAY_SECS", default_value_t = 10)]
    startup_delay_secs: u64,

    /// JSON catalog replacing the built-in dataset list
    #[arg(long, env = "CATALOG")]
    catalog: Option<PathBuf>,

    /// Base URL of the built-in dataset list
    #[arg(long, env = "BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh on a schedule until interrupted
    Run {
        /// Download on the first cycle regardless of artifact age
        #[arg(long, env = "FORCE")]
        force: bool,
    },
    /// Run one cycle and exit non-zero if any part of it failed
    Refresh {
        #[arg(long, env = "FORCE")]
        force: bool,
    },
    /// Print the refresh metadata as JSON
    Status,
    /// Create the dataset tables and the metadata table
    Init,
}

impl DbArgs {
    fn config(&self) -> Result<DatabaseConfig> {
        // Never taken from the command line, where it would show up in `ps`.
        let password = std::env::var("DB_PASSWORD").ok();
        let mut config = DatabaseConfig::new(
            self.db_host.clone(),
            self.db_port,
            self.db_user.clone(),
            password,
            self.db_name.clone(),
        )?;
        config.max_connections = self.db_max_connections.max(1);
        Ok(config)
    }
}

impl PipelineArgs {
    fn config(&self) -> Result<PipelineConfig> {
        let datasets = match &self.catalog {
            Some(path) => load_catalog(path)
                .with_context(|| format!("cannot read catalog {}", path.display()))?,
            None => default_catalog(&self.base_url),
        };
        let mut config = PipelineConfig::new(self.data_dir.clone(), datasets);
        config.max_age_days = self.max_age_days;
        config.check_interval = Duration::from_secs(self.check_interval_secs);
        config.startup_delay = Duration::from_secs(self.startup_delay_secs);
        config.validate()?;
        Ok(config)
    }
}

async fn connect(args: &DbArgs) -> Result<Arc<PgStore>> {
    let db = args.config()?;
    let pool = init_pool(&db).await.context("cannot connect to PostgreSQL")?;
    let store = PgStore::new(pool).with_trigger_suspension(!args.keep_triggers);
    store.migrate().await?;
    Ok(Arc::new(store))
}

async fn orchestrator(store: Arc<PgStore>, config: &PipelineConfig) -> Result<RefreshOrchestrator> {
    let metadata = MetadataHandle::open(store.clone()).await?;
    let transport = Arc::new(HttpTransport::new()?);
    Ok(RefreshOrchestrator::new(config, store, metadata, transport))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { force } => {
            let config = cli.pipeline.config()?;
            let store = connect(&cli.db).await?;
            let orchestrator = orchestrator(store.clone(), &config).await?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("shutdown requested"),
                    Err(e) => error!(error = %e, "cannot listen for shutdown signal"),
                }
                on_signal.cancel();
            });

            Scheduler::new(orchestrator, &config)
                .force_first_cycle(force)
                .run(cancel)
                .await;
            store.close().await;
        }
        Command::Refresh { force } => {
            let config = cli.pipeline.config()?;
            let store = connect(&cli.db).await?;
            let mut orchestrator = orchestrator(store.clone(), &config).await?;

            let result = orchestrator.run_cycle(force).await;
            store.close().await;
            let report = result?;

            println!("{}", serde_json::to_string_pretty(orchestrator.metadata())?);
            if !report.is_success() {
                let tables: Vec<&str> = report.failed.iter().map(|(t, _)| t.as_str()).collect();
                bail!("refresh failed for {}", tables.join(", "));
            }
        }
        Command::Status => {
            let store = connect(&cli.db).await?;
            let metadata = store.load_metadata().await;
            store.close().await;
            match metadata? {
                Some(metadata) => println!("{}", serde_json::to_string_pretty(&metadata)?),
                None => println!("no refresh has been recorded yet"),
            }
        }
        Command::Init => {
            let store = connect(&cli.db).await?;
            let applied = async {
                let statements = store.apply_schema(IMDB_SCHEMA).await?;
                let metadata = MetadataHandle::ensure(store.clone()).await?;
                Ok::<_, shadow_refresh::RefreshError>((statements, metadata))
            }
            .await;
            store.close().await;
            let (statements, metadata) = applied?;
            info!(statements, status = %metadata.status, "schema applied");
        }
    }

    Ok(())
}
