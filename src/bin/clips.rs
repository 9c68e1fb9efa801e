//! clips - inspect and manage recorded clips

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use presence_recorder::{ClipId, ClipStore, SqliteClipStore};

#[derive(Parser, Debug)]
#[command(name = "clips", about = "Inspect and manage recorded clips")]
struct Args {
    /// Path to the clip database.
    #[arg(long, env = "RECORDER_DB_PATH", default_value = "recorder.db")]
    db: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List clips, newest first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Clip count and total size
    Stats,

    /// Delete one clip
    Delete { id: ClipId },

    /// Write a clip's video data to a file
    Export {
        id: ClipId,
        output: PathBuf,
        /// Also write the thumbnail next to the output, if present
        #[arg(long)]
        thumbnail: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut store = SqliteClipStore::open(&args.db)?;

    match args.command {
        Command::List { json } => {
            let clips = store.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&clips)?);
                return Ok(());
            }
            if clips.is_empty() {
                println!("no clips in {}", args.db);
                return Ok(());
            }
            println!(
                "{:>6}  {:>12}  {:>10}  {:<28}  thumb",
                "id", "timestamp", "bytes", "mime"
            );
            for clip in clips {
                println!(
                    "{:>6}  {:>12}  {:>10}  {:<28}  {}",
                    clip.id,
                    clip.timestamp_s,
                    clip.size_bytes,
                    clip.mime_type,
                    if clip.has_thumbnail { "yes" } else { "no" }
                );
            }
        }
        Command::Stats => {
            let stats = store.stats()?;
            println!("clips={} total_bytes={}", stats.count, stats.total_bytes);
        }
        Command::Delete { id } => {
            if !store.delete(id)? {
                return Err(anyhow!("no clip with id {}", id));
            }
            log::info!("deleted clip {}", id);
        }
        Command::Export {
            id,
            output,
            thumbnail,
        } => {
            let clip = store
                .get(id)?
                .ok_or_else(|| anyhow!("no clip with id {}", id))?;
            if !clip.verify_digest() {
                return Err(anyhow!(
                    "clip {} failed its integrity check (sha256 mismatch)",
                    id
                ));
            }
            std::fs::write(&output, &clip.data)
                .map_err(|e| anyhow!("failed to write {}: {}", output.display(), e))?;
            log::info!(
                "exported clip {} ({} bytes, {}) to {}",
                id,
                clip.size_bytes,
                clip.mime_type,
                output.display()
            );
            if thumbnail {
                match clip.thumbnail.as_deref() {
                    Some(bytes) => {
                        let thumb_path = output.with_extension("thumb");
                        std::fs::write(&thumb_path, bytes).map_err(|e| {
                            anyhow!("failed to write {}: {}", thumb_path.display(), e)
                        })?;
                        log::info!("thumbnail written to {}", thumb_path.display());
                    }
                    None => log::warn!("clip {} has no thumbnail", id),
                }
            }
        }
    }
    Ok(())
}
