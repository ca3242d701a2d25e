use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facefind_core::{EmbeddingExtractor, ImageInput};
use facefind_store::FaceStore;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod pipeline;

use config::Config;
use pipeline::{FindOutcome, PhotoIndex};

#[derive(Parser)]
#[command(name = "facefind", about = "Find the photos you appear in from a single selfie")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a photographer's photo so its faces can be found later
    Upload {
        /// Image path or http(s) URL
        image: String,
        /// Photographer identity (e.g., email)
        #[arg(short, long)]
        photographer: String,
        /// Public URL to show for this photo (defaults to the image argument)
        #[arg(long)]
        url: Option<String>,
    },
    /// Find photos that contain the face in a selfie
    Find {
        /// Selfie path or http(s) URL
        selfie: String,
        /// Similarity a match must exceed (defaults to FACEFIND_SIMILARITY_THRESHOLD)
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Browse indexed photos, newest first
    Photos {
        /// Only photos from this photographer
        #[arg(short, long)]
        photographer: Option<String>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every photo uploaded by a photographer
    DeleteUser {
        photographer: String,
    },
    /// Delete all photos and face data
    Purge {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Rewrite legacy text-encoded embeddings in the binary format
    Migrate {
        /// Also import photos and encodings from an old upload-service database
        #[arg(long, value_name = "DB")]
        from: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Upload { image, photographer, url } => {
            let mut index = open_index(&config)?;
            let image_url = url.unwrap_or_else(|| image.clone());
            let photo = index
                .upload_photo(&ImageInput::parse(&image), &image_url, &photographer)
                .with_context(|| format!("failed to index {image}"))?;

            if photo.faces == 0 {
                println!("Stored photo {} (no face detected)", photo.photo.photo_id);
            } else {
                println!("Stored photo {} with {} face(s)", photo.photo.photo_id, photo.faces);
            }
        }
        Commands::Find { selfie, threshold, json } => {
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            let mut index = open_index(&config)?;
            let outcome = index
                .find_me(&ImageInput::parse(&selfie), threshold)
                .with_context(|| format!("failed to search with {selfie}"))?;

            match outcome {
                FindOutcome::NoFace if json => println!("{}", serde_json::json!({ "face_detected": false })),
                FindOutcome::NoFace => println!("No face detected in the selfie. Try another image."),
                FindOutcome::Matches(matches) if json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "face_detected": true,
                            "threshold": threshold,
                            "matches": matches,
                        }))?
                    );
                }
                FindOutcome::Matches(matches) if matches.is_empty() => println!("No matching photos found."),
                FindOutcome::Matches(matches) => {
                    println!("Found {} matching photo(s):", matches.len());
                    for m in &matches {
                        println!("  {:.3}  {}", m.score, m.photo.url);
                    }
                }
            }
        }
        Commands::Photos { photographer, json } => {
            let store = open_store(&config)?;
            let photos = store.list_photos(photographer.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&photos)?);
            } else if photos.is_empty() {
                println!("No photos yet.");
            } else {
                for p in &photos {
                    println!(
                        "{}  {}  {} face(s)  {}  {}",
                        p.uploaded_at.format("%Y-%m-%d"),
                        p.photo.photo_id,
                        p.faces,
                        p.photographer,
                        p.photo.url
                    );
                }
            }
        }
        Commands::DeleteUser { photographer } => {
            let store = open_store(&config)?;
            let deleted = store.delete_user_photos(&photographer)?;
            println!("Deleted {deleted} photo(s) from {photographer}");
        }
        Commands::Purge { yes } => {
            if !yes {
                bail!("refusing to delete every photo without --yes");
            }
            let store = open_store(&config)?;
            let deleted = store.delete_all_photos()?;
            println!("Deleted {deleted} photo(s)");
        }
        Commands::Migrate { from } => {
            let mut store = open_store(&config)?;
            if let Some(legacy) = from {
                let imported = store
                    .import_legacy_database(&legacy)
                    .with_context(|| format!("failed to import {}", legacy.display()))?;
                println!(
                    "Imported {} encoding(s) from {}; {} could not be decoded",
                    imported.converted,
                    legacy.display(),
                    imported.skipped
                );
            }
            let report = store.migrate_legacy_encodings()?;
            println!(
                "Converted {} legacy embedding(s); {} could not be decoded",
                report.converted, report.skipped
            );
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<FaceStore> {
    FaceStore::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))
}

/// Load the face models and open the database. Fails fast if either is unavailable.
fn open_index(config: &Config) -> Result<PhotoIndex> {
    let extractor = EmbeddingExtractor::load(&config.model_dir, config.fetch_config())
        .with_context(|| format!("failed to load face models from {}", config.model_dir.display()))?;
    Ok(PhotoIndex::new(extractor, open_store(config)?))
}
