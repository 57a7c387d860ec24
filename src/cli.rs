use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::app::App;
use crate::config::RelayConfig;
use crate::email::{IngestOutcome, SyncResult};

/// relaymail - mailbox synchronization and storage engine
#[derive(Parser)]
#[command(name = "relaymail")]
#[command(about = "Pulls alias mailboxes into a searchable message store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sync scheduler until interrupted
    Run,

    /// Sync mailboxes once and print the results
    Sync(SyncArgs),

    /// Store a raw .eml file for an alias
    Import(ImportArgs),

    /// Remove attachment files no message refers to
    Sweep,

    /// Show store statistics
    Stats,
}

#[derive(Args)]
pub struct SyncArgs {
    /// Only sync this alias address
    #[arg(long)]
    pub alias: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ImportArgs {
    /// Alias address that receives the message
    pub alias: String,

    /// Path to the raw message
    pub file: PathBuf,
}

/// Runs CLI commands against an opened engine
pub struct CliHandler {
    app: App,
}

impl CliHandler {
    pub async fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config = RelayConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
        let app = App::open(config).await.context("Failed to open the message store")?;
        Ok(Self { app })
    }

    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Run => self.handle_run().await,
            Commands::Sync(args) => self.handle_sync(args).await,
            Commands::Import(args) => self.handle_import(args).await,
            Commands::Sweep => self.handle_sweep().await,
            Commands::Stats => self.handle_stats().await,
        }
    }

    async fn handle_run(&self) -> Result<()> {
        let scheduler = self.app.scheduler();
        scheduler.start().await?;
        if !scheduler.is_running().await {
            println!("Automatic sync is disabled in the configuration");
            return Ok(());
        }

        println!("Syncing every {}s, press Ctrl-C to stop", self.app.config().sync.interval_seconds);
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
        scheduler.stop().await;

        let stats = scheduler.get_stats().await;
        println!(
            "Stopped after {} ticks: {} mailbox syncs, {} failed, {} messages stored",
            stats.total_ticks,
            stats.total_syncs_completed + stats.total_syncs_failed,
            stats.total_syncs_failed,
            stats.messages_stored
        );
        Ok(())
    }

    async fn handle_sync(&self, args: SyncArgs) -> Result<()> {
        let results = match args.alias {
            Some(alias) => vec![self.app.ingest(&alias).await],
            None => self.app.ingest_all_active_mailboxes().await?,
        };

        if args.json {
            println!("{}", serde_json::to_string_pretty(&results)?);
            return Ok(());
        }

        if results.is_empty() {
            println!("No active mailboxes");
        }
        for result in &results {
            print_result(result);
        }
        Ok(())
    }

    async fn handle_import(&self, args: ImportArgs) -> Result<()> {
        let raw = tokio::fs::read(&args.file)
            .await
            .with_context(|| format!("Failed to read {}", args.file.display()))?;

        match self.app.import(&args.alias, &raw).await? {
            IngestOutcome::Stored {
                id,
                message_id,
                attachments_stored,
                attachment_failures,
            } => {
                println!("✅ Stored {} as #{} with {} attachments", message_id, id, attachments_stored);
                for failure in attachment_failures {
                    println!("   ⚠️  {}", failure);
                }
            }
            IngestOutcome::Duplicate { message_id } => {
                println!("Already stored: {}", message_id);
            }
        }
        Ok(())
    }

    async fn handle_sweep(&self) -> Result<()> {
        let report = self.app.sweep_orphans().await?;
        println!("Scanned {} blobs, removed {}", report.scanned, report.removed.len());
        Ok(())
    }

    async fn handle_stats(&self) -> Result<()> {
        let stats = self.app.stats().await?;
        println!("📊 Store statistics");
        println!("   Users:       {}", stats.user_count);
        println!("   Aliases:     {}", stats.alias_count);
        println!("   Messages:    {} ({} unread, {} deleted)", stats.message_count, stats.unread_count, stats.tombstone_count);
        println!("   Attachments: {}", stats.attachment_count);
        println!("   Size:        {} bytes", stats.db_size_bytes);
        Ok(())
    }
}

fn print_result(result: &SyncResult) {
    let marker = if result.is_failed() { "❌" } else { "✅" };
    println!(
        "{} {}: fetched {}, stored {}, skipped {}",
        marker, result.alias_email, result.fetched, result.stored, result.skipped
    );
    for failure in &result.errors {
        println!("   {}", failure);
    }
}
