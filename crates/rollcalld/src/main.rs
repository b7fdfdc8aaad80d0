use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rollcall_core::{EmbeddingCache, EmbeddingRecord};
use rollcalld::{Config, EmbeddingStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall enrolled-embedding administration")]
struct Cli {
    /// TOML config file; ROLLCALL_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll embeddings from a JSON file
    Import {
        /// JSON array of {identity_id, display_name, values, enrolled_at?}
        file: PathBuf,
    },
    /// List enrolled identities as JSON
    List,
    /// Remove every embedding of an identity
    Remove {
        /// Identity id to remove
        identity: String,
    },
    /// Load the whole roster into a cache and print its stats as JSON
    Preload,
}

/// One entry of an import file.
#[derive(Deserialize)]
struct ImportEntry {
    identity_id: String,
    display_name: String,
    values: Vec<f32>,
    enrolled_at: Option<DateTime<Utc>>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let store = EmbeddingStore::open(&config.db_path)
        .with_context(|| format!("opening embedding store at {}", config.db_path.display()))?;

    match cli.command {
        Commands::Import { file } => import(&store, &file)?,
        Commands::List => {
            let identities = store.list_identities()?;
            println!("{}", serde_json::to_string_pretty(&identities)?);
        }
        Commands::Remove { identity } => {
            let removed = store.remove_identity(&identity)?;
            if removed == 0 {
                bail!("identity '{identity}' is not enrolled");
            }
            tracing::info!(identity = %identity, removed, "identity removed");
            println!("removed {removed} embedding(s) for {identity}");
        }
        Commands::Preload => {
            let cache = EmbeddingCache::new(Box::new(Arc::new(store)), config.pipeline.max_cached_embeddings);
            let report = cache.load_all();
            if !report.failed_identities.is_empty() || report.rejected_embeddings > 0 {
                tracing::warn!(
                    failed = report.failed_identities.len(),
                    rejected = report.rejected_embeddings,
                    "preload incomplete"
                );
            }
            if cache.is_empty() {
                tracing::warn!("cache is empty after preload");
            }
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
    }

    Ok(())
}

fn import(store: &EmbeddingStore, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let entries: Vec<ImportEntry> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;

    let mut imported = 0usize;
    let mut rejected = 0usize;
    for entry in entries {
        let record = EmbeddingRecord {
            identity_id: entry.identity_id,
            display_name: entry.display_name,
            values: entry.values,
            enrolled_at: entry.enrolled_at.unwrap_or_else(Utc::now),
        };
        match store.insert(&record) {
            Ok(_) => imported += 1,
            Err(e) => {
                tracing::warn!(identity = %record.identity_id, error = %e, "embedding rejected");
                rejected += 1;
            }
        }
    }

    tracing::info!(imported, rejected, total = store.count_all()?, "import finished");
    if imported == 0 && rejected > 0 {
        bail!("no embeddings imported ({rejected} rejected)");
    }
    println!("imported {imported} embedding(s), rejected {rejected}");
    Ok(())
}
