mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lowband_store::{LocalStore, Mutation, OperationKind, Priority, Row, Schema};
use lowband_sync::{
    CachingCredentialProvider, DownloadPipeline, HttpBackend, StaticCredentialProvider, SyncConfig,
    SyncEngine, TracingEventSink, UploadPipeline,
};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "lowband")]
#[command(about = "Offline-first sync for low-bandwidth networks", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.lowband/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show queue statistics
    Status,

    /// Apply a local mutation and queue it for upload
    Enqueue {
        table: String,
        row_id: String,
        /// insert, update or delete
        kind: OperationKind,
        /// Row columns as a JSON object
        #[arg(short, long)]
        payload: Option<String>,
        /// Upload ahead of normal-priority operations
        #[arg(long)]
        high: bool,
    },

    /// Upload pending operations once
    Drain {
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Download tables from the remote backend
    Pull {
        /// Tables to pull (defaults to the configured tables)
        tables: Vec<String>,
    },

    /// List operations that could not be saved
    DeadLetters {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Queue a dead-lettered operation again
    Requeue { id: i64 },

    /// Drop a dead-lettered operation
    Discard { id: i64 },

    /// Run the sync engine until Ctrl-C
    Run,
}

struct App {
    config: SyncConfig,
    store: LocalStore,
}

impl App {
    fn open(config: SyncConfig) -> Result<Self> {
        let store = LocalStore::open(&config.store.path, Schema::social())
            .with_context(|| format!("Failed to open store: {}", config.store.path.display()))?;
        Ok(Self { config, store })
    }

    fn pipelines(&self) -> Result<(Arc<UploadPipeline>, Arc<DownloadPipeline>)> {
        let token = config::token()?;
        let credentials = Arc::new(CachingCredentialProvider::new(StaticCredentialProvider::new(
            self.config.remote.endpoint.clone(),
            token,
        )));
        let backend = Arc::new(HttpBackend::new(
            self.config.remote.api_key.clone(),
            self.config.retry.policy().attempt_timeout,
        )?);
        let sink = Arc::new(TracingEventSink);

        let upload = Arc::new(UploadPipeline::new(
            self.store.clone(),
            backend.clone(),
            credentials.clone(),
            sink.clone(),
            self.config.upload_config(),
        ));
        let download = Arc::new(DownloadPipeline::new(
            self.store.clone(),
            backend,
            credentials,
            sink,
            self.config.download_config(),
        ));
        Ok((upload, download))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };

    let open_app = || -> Result<App> { App::open(config::load(&config_path)?) };

    match cli.command {
        Commands::Init { force } => {
            if config_path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", config_path.display());
            }
            config::save(&SyncConfig::default(), &config_path)?;
            println!("Wrote default config to {}", config_path.display());
        }
        Commands::Status => {
            let app = open_app()?;
            let stats = app.store.queue_stats()?;
            println!("Store: {}", app.config.store.path.display());
            println!("Pending operations: {}", stats.pending());
            println!("  high priority:   {}", stats.pending_high);
            println!("  normal priority: {}", stats.pending_normal);
            println!("Dead letters: {}", stats.dead_letters);
        }
        Commands::Enqueue {
            table,
            row_id,
            kind,
            payload,
            high,
        } => {
            let app = open_app()?;
            let payload: Row = match payload {
                Some(json) => serde_json::from_str(&json).context("Payload must be a JSON object")?,
                None => Row::new(),
            };
            let priority = if high { Priority::High } else { Priority::Normal };
            let mutation = Mutation::new(table, row_id, kind, payload)
                .priority(priority)
                .max_attempts(app.config.upload.max_attempts);
            let op = app.store.apply_mutation(mutation)?;
            println!("Queued operation {} ({} {}/{})", op.id, op.kind, op.table, op.row_id);
        }
        Commands::Drain { batch_size } => {
            let app = open_app()?;
            let (upload, _) = app.pipelines()?;
            let result = upload
                .drain(batch_size.unwrap_or(app.config.upload.batch_size))
                .await?;
            println!(
                "Uploaded {}, requeued {}, dead-lettered {}, deferred {}",
                result.uploaded, result.requeued, result.dead_lettered, result.deferred
            );
            if result.credential_failure {
                bail!("Drain stopped: no valid credential");
            }
        }
        Commands::Pull { tables } => {
            let app = open_app()?;
            let tables = if tables.is_empty() {
                app.config.tables(app.store.schema())?
            } else {
                tables
            };
            let (_, download) = app.pipelines()?;
            let report = download
                .sync_tables(&tables, app.config.download.page_size)
                .await;
            for synced in &report.synced {
                println!(
                    "{}: {} rows in {} pages ({} kept for pending local changes)",
                    synced.table, synced.rows_applied, synced.pages, synced.rows_skipped
                );
            }
            for failure in &report.failures {
                println!("{}: failed: {}", failure.table, failure.error);
            }
            if !report.is_success() {
                bail!("{} table(s) failed to sync", report.failures.len());
            }
        }
        Commands::DeadLetters { limit } => {
            let app = open_app()?;
            let letters = app.store.list_dead_letters(limit)?;
            if letters.is_empty() {
                println!("No dead letters");
            }
            for letter in letters {
                println!(
                    "#{} {} {}/{} after {} attempts at {}: {}",
                    letter.id,
                    letter.operation.kind,
                    letter.operation.table,
                    letter.operation.row_id,
                    letter.operation.attempts,
                    letter.failed_at.to_rfc3339(),
                    letter.error
                );
            }
        }
        Commands::Requeue { id } => {
            let app = open_app()?;
            let op = app.store.requeue_dead_letter(id)?;
            println!("Requeued as operation {}", op.id);
        }
        Commands::Discard { id } => {
            let app = open_app()?;
            let letter = app.store.discard_dead_letter(id)?;
            println!(
                "Discarded {} {}/{}",
                letter.operation.kind, letter.operation.table, letter.operation.row_id
            );
        }
        Commands::Run => {
            let app = open_app()?;
            let (upload, download) = app.pipelines()?;
            let engine_config = app.config.engine_config(app.store.schema())?;
            // No connectivity monitor here; failed requests are retried on the next tick
            let (_online, connectivity) = watch::channel(true);

            let engine = SyncEngine::spawn(upload, download, connectivity, engine_config);
            info!("Sync engine running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            engine.shutdown().await;
        }
    }

    Ok(())
}
