//! Refinery CLI
//!
//! Feeds NDJSON fact messages through the batch coordinator into a graph
//! store: one message per line, validated at the boundary, merged in atomic
//! batches. `--memory` runs against the in-process store for dry runs; the
//! default target is a bolt endpoint. A queue consumer plugs in at the same
//! coordinator seam this binary uses.

use anyhow::{Context, Result};
use clap::Parser;
use refinery_model::validate::validate;
use refinery_model::Message;
use refinery_service::{BatchCoordinator, Disposition, RefineryConfig, SubmitError};
use refinery_store::{GraphStore, MemoryGraph, Neo4jStore};
use std::io::Read;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "refinery",
    version,
    about = "Merges harvester fact messages into a shared property graph"
)]
struct Cli {
    /// NDJSON message file; "-" reads stdin.
    #[arg(long, default_value = "-")]
    input: String,
    /// Run against an in-process store instead of bolt (dry runs, demos).
    #[arg(long)]
    memory: bool,
    /// Bolt URI; overrides config and NEO4J_URL.
    #[arg(long)]
    uri: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    pass: Option<String>,
    /// Messages per batch transaction.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Partial-batch flush interval in milliseconds.
    #[arg(long)]
    linger_ms: Option<u64>,
    /// Keep ISO-8601 strings as plain properties.
    #[arg(long)]
    no_date_inference: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = RefineryConfig::default().from_env();
    if let Some(uri) = &cli.uri {
        config.store_uri = uri.clone();
    }
    if let Some(user) = &cli.user {
        config.store_user = user.clone();
    }
    if let Some(pass) = &cli.pass {
        config.store_pass = pass.clone();
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(linger_ms) = cli.linger_ms {
        config.linger_ms = linger_ms;
    }
    if cli.no_date_inference {
        config.infer_dates = false;
    }

    let raw = read_input(&cli.input)?;

    let store: Arc<dyn GraphStore> = if cli.memory {
        Arc::new(MemoryGraph::new())
    } else {
        Arc::new(
            Neo4jStore::connect(&config.store_uri, &config.store_user, &config.store_pass)
                .await
                .with_context(|| format!("connecting to {}", config.store_uri))?,
        )
    };

    let options = config.batch_options();
    let coordinator = BatchCoordinator::spawn(store, options.clone());
    // Consumption bound: no more messages in flight than fit one batch.
    let limit = Arc::new(Semaphore::new(options.batch_size));

    let mut submissions = JoinSet::new();
    let mut discarded = 0usize;
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message: Message = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                warn!(line = line_no + 1, %err, "malformed message");
                discarded += 1;
                continue;
            }
        };
        if let Err(err) = validate(&message) {
            warn!(line = line_no + 1, %err, "invalid message");
            discarded += 1;
            continue;
        }

        let coordinator = coordinator.clone();
        let limit = Arc::clone(&limit);
        submissions.spawn(async move {
            let _permit = limit
                .acquire_owned()
                .await
                .map_err(|_| SubmitError::Closed)?;
            coordinator.submit(message).await
        });
    }

    let (mut acked, mut requeued) = (0usize, 0usize);
    while let Some(joined) = submissions.join_next().await {
        let outcome = joined.context("submitter task panicked")??;
        match Disposition::from(&outcome) {
            Disposition::Ack => acked += 1,
            Disposition::NackDiscard => discarded += 1,
            Disposition::NackRequeue => requeued += 1,
        }
    }

    info!(acked, discarded, requeued, "ingest complete");
    if requeued > 0 {
        anyhow::bail!("{requeued} message(s) were not committed and need redelivery");
    }
    Ok(())
}

fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {path}"))
    }
}
