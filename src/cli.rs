use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::audio::{AudioBackendConfig, CpalBackend};
use crate::config::Config;
use crate::session::SessionController;
use crate::store::{ChunkStore, UploadStatus};
use crate::upload::{AssistantClient, UploadCoordinator};

#[derive(Debug, Parser)]
#[command(
    name = "loqa-recorder",
    about = "Chunked audio capture with a durable upload queue"
)]
pub struct Cli {
    /// Config file (TOML), given without its extension
    #[arg(long, default_value = "config/loqa-recorder")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record a session from the default microphone until Ctrl-C
    Record {
        /// Stop automatically after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Process pending and failed uploads once, then exit
    Drain,
    /// List recorded sessions
    Sessions,
    /// Show server-side processing status for a session
    Status { session_id: String },
    /// Fetch result artifacts for a session (cached locally)
    Results {
        session_id: String,
        /// Result types to fetch; defaults to every known type
        #[arg(long = "type")]
        types: Vec<String>,
        /// Serve cached content only, without contacting the server
        #[arg(long)]
        local: bool,
    },
    /// Delete a session, its queue records, and its chunk files
    Delete { session_id: String },
    /// Probe the assistant endpoint
    Health,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let store = Arc::new(ChunkStore::open(&config.storage.db_path)?);
    let client = Arc::new(AssistantClient::new(
        &config.server.base_url,
        Duration::from_secs(config.server.connect_timeout_secs),
        Duration::from_secs(config.server.request_timeout_secs),
    )?);
    let coordinator = Arc::new(UploadCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&client),
        &config.upload,
    ));
    let controller = SessionController::new(
        &config,
        Arc::clone(&store),
        Arc::clone(&coordinator),
        Arc::clone(&client),
    );

    match cli.command {
        Command::Record { duration_secs } => {
            controller.recover().await?;
            let sweeper = coordinator.spawn_sweeper(config.upload.sweeper_max_retries);

            let backend = Box::new(CpalBackend::new(AudioBackendConfig {
                target_sample_rate: config.audio.sample_rate,
                target_channels: config.audio.channels,
                buffer_duration_ms: 100,
            }));

            let session_id = controller.start_session(backend).await?;
            println!("Recording session {session_id} (Ctrl-C to stop)");

            match duration_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => {
                    tokio::signal::ctrl_c().await?;
                    println!();
                }
            }

            let stats = controller.stop_session().await?;
            println!(
                "Recorded {} across {} chunks",
                stats.formatted_duration(),
                stats.chunk_count
            );

            flush_queue(&store, &coordinator, config.upload.sweeper_max_retries).await?;
            sweeper.abort();
        }

        Command::Drain => {
            controller.recover().await?;
            flush_queue(&store, &coordinator, config.upload.sweeper_max_retries).await?;
        }

        Command::Sessions => {
            for session in controller.sessions()? {
                let stats = controller.session_stats(&session.id).await?;
                println!(
                    "{}  {}  {}  {}/{} chunks uploaded{}",
                    session.id,
                    session.started_at.format("%Y-%m-%d %H:%M:%S"),
                    stats.formatted_duration(),
                    stats.chunks_completed,
                    stats.chunk_count,
                    if session.is_uploaded { "  [complete]" } else { "" }
                );
            }
        }

        Command::Status { session_id } => {
            let status = controller.processing_status(&session_id).await?;
            let mut entries: Vec<_> = status.into_iter().collect();
            entries.sort();
            for (result_type, ready) in entries {
                println!("{result_type}: {}", if ready { "ready" } else { "processing" });
            }
        }

        Command::Results {
            session_id,
            types,
            local,
        } => {
            let types = if types.is_empty() {
                SessionController::default_result_types()
            } else {
                types
            };
            for (result_type, content) in
                controller.fetch_results(&session_id, &types, local).await?
            {
                println!("=== {result_type} ===");
                println!("{content}");
            }
        }

        Command::Delete { session_id } => {
            controller.delete_session(&session_id)?;
            println!("Deleted session {session_id}");
        }

        Command::Health => {
            client.health().await?;
            println!("{} is healthy", client.base_url());
        }
    }

    Ok(())
}

/// Drain until the queue has no pending work, reporting what remains.
async fn flush_queue(
    store: &Arc<ChunkStore>,
    coordinator: &Arc<UploadCoordinator>,
    max_retries: u32,
) -> Result<()> {
    coordinator.sweep(max_retries).await?;

    // Uploads spawned by submit may still hold claims; wait them out.
    let mut waited_ms = 0u64;
    while store.count_with_status(UploadStatus::InProgress)? > 0 && waited_ms < 30_000 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        waited_ms += 200;
    }
    coordinator.drain_pending().await?;

    let pending = store.count_with_status(UploadStatus::Pending)?;
    let failed = store.count_with_status(UploadStatus::Failed)?;
    if pending == 0 && failed == 0 {
        info!("Upload queue is empty");
    } else {
        println!("{pending} uploads pending, {failed} failed; run `drain` to retry");
    }

    let permanent = store.permanently_failed(max_retries)?;
    for record in permanent {
        println!(
            "Permanently failed after {} attempts: session {} chunk {}",
            record.retry_count, record.session_id, record.chunk_index
        );
    }

    Ok(())
}
