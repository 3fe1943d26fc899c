use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::{Gallery, GalleryEntry, PipelineError};
use facematch_store::{RecognitionMethod, SqliteGallery, DEFAULT_LOG_LIMIT};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{spawn_engine, EngineError, EngineHandle};

#[derive(Parser)]
#[command(name = "facematch", about = "Face identity matching CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face from an image under an identity label
    Enroll {
        /// Identity label (e.g., "Alice")
        #[arg(short, long)]
        name: String,
        /// Image containing the face to enroll
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Identify every face in an image
    Recognize {
        #[arg(short, long)]
        image: PathBuf,
        /// Override the matching threshold for this request
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Where the image came from, for the recognition log
        #[arg(short, long, default_value = "upload")]
        method: RecognitionMethod,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// List enrolled gallery entries
    List {
        #[arg(long)]
        json: bool,
    },
    /// Remove a gallery entry, or every entry of an identity
    Remove {
        /// Entry ID to remove
        #[arg(required_unless_present = "identity", conflicts_with = "identity")]
        id: Option<String>,
        /// Remove all entries enrolled under this identity
        #[arg(long)]
        identity: Option<String>,
    },
    /// Show recent recognition attempts
    Logs {
        #[arg(short, long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show model and gallery status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let store = SqliteGallery::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;

    match cli.command {
        Commands::Enroll { name, image } => {
            let engine = spawn_engine(&config.pipeline, config.timeout)?;
            let entry = enroll_from_file(&engine, &store, name, &image).await?;
            println!("Enrolled {} ({})", entry.identity, entry.id);
        }
        Commands::Recognize {
            image,
            threshold,
            method,
            json,
        } => {
            let image = facematch_core::load_image(&image)?;
            let engine = spawn_engine(&config.pipeline, config.timeout)?;

            let gallery = store.snapshot()?;
            if gallery.is_empty() {
                tracing::warn!("gallery is empty; every face will be reported as unknown");
            }

            let results = engine.recognize(image, gallery, threshold).await?;
            let request_id = store.log_recognition(method, &results)?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "request_id": request_id,
                        "faces": results,
                    }))?
                );
            } else if results.is_empty() {
                println!("No faces detected");
            } else {
                for (i, r) in results.iter().enumerate() {
                    println!(
                        "face {i}: {} (confidence {:.3}) at [{}, {}, {}, {}]",
                        r.identity, r.confidence, r.bbox.x1, r.bbox.y1, r.bbox.x2, r.bbox.y2
                    );
                }
            }
        }
        Commands::List { json } => {
            let entries = store.snapshot()?;
            if json {
                let summary: Vec<_> = entries
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "id": e.id,
                            "identity": e.identity,
                            "embedding_dim": e.embedding.dim(),
                            "image_path": e.image_path,
                            "created_at": e.created_at,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else if entries.is_empty() {
                println!("No faces enrolled");
            } else {
                for e in entries.iter() {
                    println!(
                        "{}  {}  dim={}  {}",
                        e.id,
                        e.identity,
                        e.embedding.dim(),
                        e.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
        Commands::Remove { id, identity } => match (id, identity) {
            (_, Some(identity)) => {
                let removed = store.delete_identity(&identity)?;
                if removed == 0 {
                    anyhow::bail!("no gallery entries for identity {identity}");
                }
                println!("Removed {removed} entries for {identity}");
            }
            (Some(id), None) => {
                if store.remove(&id)? {
                    println!("Removed {id}");
                } else {
                    anyhow::bail!("no gallery entry with id {id}");
                }
            }
            (None, None) => anyhow::bail!("pass an entry id or --identity"),
        },
        Commands::Logs { limit, json } => {
            let logs = store.recent_logs(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&logs)?);
            } else if logs.is_empty() {
                println!("No recognition attempts logged");
            } else {
                for log in &logs {
                    let confidence = log
                        .confidence
                        .map(|c| format!("{c:.3}"))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}  {:<6}  {}  {}  faces={}",
                        log.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        log.method,
                        log.identity.as_deref().unwrap_or("(no face)"),
                        confidence,
                        log.faces_detected
                    );
                }
            }
        }
        Commands::Status => {
            println!("model dir: {}", config.model_dir.display());
            println!("database:  {}", config.db_path.display());
            println!("enrolled:  {} entries", store.len()?);

            match spawn_engine(&config.pipeline, config.timeout) {
                Ok(engine) => {
                    let cap = engine.capability().await?;
                    println!("{}", serde_json::to_string_pretty(&cap)?);
                }
                Err(e) => println!("pipeline:  not loaded ({e})"),
            }
        }
    }

    Ok(())
}

/// Enroll the first face in the image at `path` and store it with its source path.
async fn enroll_from_file(
    engine: &EngineHandle,
    gallery: &dyn Gallery,
    name: String,
    path: &Path,
) -> Result<GalleryEntry> {
    let image = facematch_core::load_image(path)?;

    let entry = match engine.enroll(image, name).await {
        Err(EngineError::Pipeline(PipelineError::NoFaceDetected)) => {
            anyhow::bail!("no face detected in {}", path.display())
        }
        other => other?,
    };
    let entry = entry.with_image_path(path.display().to_string());
    gallery.add(entry.clone())?;
    Ok(entry)
}
