// MediaOffline - Offline content pipeline for mobile media clients
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::Context;
use clap::{Parser, Subcommand};
use media_offline_core::crypto::{
    is_encrypted_path, DecryptedCache, EncryptionService, FileSecureStore, KeyStore,
};
use media_offline_core::download::{
    DownloadManager, DownloadProgress, DownloadStatus, MediaItem, MediaKind, SpeedTracker,
};
use media_offline_core::session::{ServerContext, StaticSessions};
use media_offline_core::storage::{Database, RecordEvent, RecordStore};
use media_offline_core::PipelineConfig;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Server id used for sessions given on the command line
const CLI_SERVER_ID: &str = "cli";

#[derive(Parser)]
#[command(name = "media-offline-cli")]
#[command(about = "MediaOffline CLI - Desktop testing tool", long_about = None)]
struct Cli {
    /// Data directory (downloads, database, keys, cache)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// JSON configuration file; overrides --root
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ServerArgs {
    /// Server base URL, e.g. https://media.example.com
    #[arg(long)]
    server_url: String,
    /// Access token
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one item and wait for it
    Download {
        #[command(flatten)]
        server: ServerArgs,
        /// Item id on the server
        item_id: String,
        /// audio, book or video
        #[arg(long, default_value = "video")]
        kind: String,
        #[arg(long, default_value = "")]
        name: String,
        /// Book container (epub, pdf, cbz)
        #[arg(long)]
        container: Option<String>,
        /// Known size in bytes
        #[arg(long)]
        size: Option<u64>,
        /// Keep the file encrypted at rest
        #[arg(long)]
        encrypt: bool,
    },
    /// Requeue interrupted and pending downloads and run them
    Resume {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// List tracked downloads
    List,
    /// Show storage usage
    Storage,
    /// Delete a download and its file
    Delete { task_id: String },
    /// Delete every download
    Clear,
    /// Materialize a plaintext copy of an encrypted download
    Decrypt { path: PathBuf },
    /// Remove all materialized plaintext copies
    ClearCache,
}

fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    if let Some(path) = &cli.config {
        return PipelineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    Ok(match &cli.root {
        Some(root) => PipelineConfig::for_root(root),
        None => PipelineConfig::default(),
    })
}

fn sessions(server: Option<&ServerArgs>) -> StaticSessions {
    match server {
        Some(args) => StaticSessions::new().with_server(ServerContext {
            server_id: CLI_SERVER_ID.to_string(),
            base_url: args.server_url.clone(),
            access_token: args.token.clone(),
            user_id: args.user_id.clone(),
        }),
        None => StaticSessions::new(),
    }
}

fn encryption(config: &PipelineConfig) -> EncryptionService {
    let secure_store = Arc::new(FileSecureStore::new(config.key_store_dir.clone()));
    EncryptionService::new(Arc::new(KeyStore::new(secure_store)))
}

async fn open_manager(
    config: PipelineConfig,
    server: Option<&ServerArgs>,
) -> anyhow::Result<DownloadManager> {
    let db = Database::new(&config.database_path)
        .await
        .context("opening download database")?;
    let encryption = encryption(&config);

    let manager = DownloadManager::builder(config, RecordStore::new(&db), Arc::new(sessions(server)))
        .encryption(encryption)
        .build()?;
    Ok(manager)
}

/// Print progress lines until the queue drains
async fn run_until_idle(manager: &DownloadManager) {
    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        let mut speed = SpeedTracker::new();
        let mut current: Option<String> = None;

        while let Ok(event) = events.recv().await {
            let RecordEvent::Updated(task) = event else {
                continue;
            };
            if current.as_deref() != Some(task.id.as_str()) {
                current = Some(task.id.clone());
                speed.reset();
            }
            speed.add_position(task.downloaded_bytes);

            let progress = DownloadProgress::from_task(&task, speed.average_speed());
            print!("\r{:<100}", progress.display_string());
            let _ = std::io::stdout().flush();
            if task.is_terminal() {
                println!();
            }
        }
    });

    manager.wait_for_idle().await;
    printer.abort();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match &cli.command {
        Commands::Download {
            server,
            item_id,
            kind,
            name,
            container,
            size,
            encrypt,
        } => {
            config.encrypt_downloads |= *encrypt;
            let manager = open_manager(config, Some(server)).await?;

            let kind = MediaKind::from_str(kind)?;
            let display_name = if name.is_empty() { item_id.clone() } else { name.clone() };
            let mut item = MediaItem::new(item_id.clone(), display_name, kind);
            if let Some(container) = container {
                item = item.with_container(container.clone());
            }
            if let Some(size) = size {
                item = item.with_size_hint(*size);
            }

            let task_id = manager.start_download(&item, CLI_SERVER_ID).await?;
            run_until_idle(&manager).await;

            let task = manager.get_task(&task_id).await?;
            match task.status {
                DownloadStatus::Completed => {
                    println!("Saved to {}", task.local_path.unwrap_or_default());
                }
                _ => {
                    anyhow::bail!(
                        "download ended as {}: {}",
                        task.status,
                        task.error_message.unwrap_or_default()
                    );
                }
            }
        }
        Commands::Resume { server } => {
            let manager = open_manager(config, Some(server)).await?;
            let recovered = manager.recover_interrupted().await?;
            println!("Requeued {} interrupted download(s)", recovered);
            run_until_idle(&manager).await;
        }
        Commands::List => {
            let manager = open_manager(config, None).await?;
            for task in manager.list_downloads().await? {
                println!(
                    "{}  {:<11}  {:>3}%  {}  {}",
                    task.id,
                    task.status,
                    task.progress_percent(),
                    task.item_id,
                    task.title
                );
            }
        }
        Commands::Storage => {
            let manager = open_manager(config, None).await?;
            let info = manager.get_storage_info().await?;
            println!("Used:      {}", DownloadProgress::bytes_string(info.used));
            println!("Available: {}", DownloadProgress::bytes_string(info.available));
            println!("Total:     {}", DownloadProgress::bytes_string(info.total));
        }
        Commands::Delete { task_id } => {
            let manager = open_manager(config, None).await?;
            manager.delete_download(task_id).await?;
            println!("Deleted {}", task_id);
        }
        Commands::Clear => {
            let manager = open_manager(config, None).await?;
            manager.clear_all_downloads().await?;
            println!("All downloads removed");
        }
        Commands::Decrypt { path } => {
            if !is_encrypted_path(path) {
                anyhow::bail!("{} is not an encrypted download", path.display());
            }
            let cache = DecryptedCache::new(config.cache_dir.clone(), Arc::new(encryption(&config)));
            let plain = cache.get_decrypted_uri(path).await?;
            println!("{}", plain.display());
        }
        Commands::ClearCache => {
            let cache = DecryptedCache::new(config.cache_dir.clone(), Arc::new(encryption(&config)));
            cache.clear_decrypted_cache().await?;
            println!("Decrypted cache cleared");
        }
    }

    Ok(())
}
