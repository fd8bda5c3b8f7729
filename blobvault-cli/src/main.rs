mod config;

use anyhow::Context;
use blobvault_core::{
    BackupCatalog, BackupSetReference, BlobStore, BlobType, DiskBackend, FileMetadata, Hash,
    MetadataNode,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::Config;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "blobvault")]
#[command(about = "Deduplicating content-addressed backup store")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "blobvault.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store one file and print its hash
    Put { file: PathBuf },
    /// Write the blob with the given hash to a file
    Get { hash: String, out: PathBuf },
    /// Snapshot a directory into the configured backup set
    Backup {
        dir: PathBuf,
        #[arg(short, long, default_value = "")]
        message: String,
    },
    /// List backups in the configured backup set
    List,
    /// Remove a backup by hash or unambiguous prefix
    Remove { backup: String },
    /// Restore a backup into a directory
    Restore { backup: String, target: PathBuf },
    /// Show index statistics
    Stats,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blobvault=info,blobvault_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cfg, cli.command).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn open_catalog(cfg: &Config) -> anyhow::Result<BackupCatalog> {
    let backend = Arc::new(DiskBackend::new(cfg.data_dir.clone())?);
    let store = BlobStore::load(backend, cfg.index_order, cfg.chunker_config()).await?;
    let catalog = BackupCatalog::new(Arc::new(store));
    catalog.load_backup_set(&cfg.backup_set).await?;
    tracing::debug!(
        "Opened {:?} with {} blobs",
        cfg.data_dir,
        catalog.blob_store().blob_count()
    );
    Ok(catalog)
}

async fn run(cfg: Config, command: Commands) -> anyhow::Result<()> {
    let catalog = open_catalog(&cfg).await?;
    let set = cfg.backup_set.as_str();

    match command {
        Commands::Put { file } => {
            let reader = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("cannot open {}", file.display()))?;
            let hash = catalog
                .blob_store()
                .store_reader(&BackupSetReference::new(set), reader, BlobType::FileBlob)
                .await?;
            catalog.save().await?;
            println!("{}", hash);
        }
        Commands::Get { hash, out } => {
            let hash: Hash = hash.parse()?;
            let data = catalog.blob_store().retrieve_data(&hash).await?;
            tokio::fs::write(&out, &data)
                .await
                .with_context(|| format!("cannot write {}", out.display()))?;
            tracing::info!("Wrote {} bytes to {}", data.len(), out.display());
        }
        Commands::Backup { dir, message } => {
            let reference = BackupSetReference::new(set);
            let tree = scan_directory(catalog.blob_store(), &reference, dir.clone()).await?;
            let hash = catalog.add_backup(set, &message, &tree).await?;
            catalog.save().await?;
            println!("{}", hash);
        }
        Commands::List => {
            for (entry, record) in catalog.list_backups(set).await? {
                println!(
                    "{}  {}  {}{}",
                    entry.hash.short(),
                    record.backup_time.format("%Y-%m-%d %H:%M:%S"),
                    record.message,
                    if entry.shallow { "  (shallow)" } else { "" }
                );
            }
        }
        Commands::Remove { backup } => {
            let (hash, record) = catalog.get_backup(set, &backup).await?;
            catalog.remove_backup(set, &hash).await?;
            catalog.save().await?;
            println!("removed {} ({})", hash.short(), record.message);
        }
        Commands::Restore { backup, target } => {
            let (hash, record) = catalog.get_backup(set, &backup).await?;
            let tree = catalog.load_tree(&record).await?;
            restore_directory(catalog.blob_store(), &tree, target.clone()).await?;
            tracing::info!("Restored {} into {}", hash.short(), target.display());
        }
        Commands::Stats => {
            let stats = catalog.blob_store().index_stats();
            println!("blobs:            {}", stats.blob_count);
            println!("stored blobs:     {}", stats.stored_blobs);
            println!("stored bytes:     {}", stats.stored_bytes);
            println!("multi-block:      {}", stats.multi_block_blobs);
            for (references, blobs) in &stats.reference_histogram {
                println!("  {:>4} refs:     {}", references, blobs);
            }
            if let Some((hash, _)) = catalog.latest_backup(set).await? {
                let sizes = catalog
                    .blob_store()
                    .reference_sizes(&hash, BlobType::BackupRecord, true)
                    .await?;
                println!(
                    "latest backup {}: {} bytes referenced, {} unique",
                    hash.short(),
                    sizes.all_references,
                    sizes.unique_references
                );
            }
        }
    }
    Ok(())
}

fn to_utc(time: std::io::Result<SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

fn file_metadata(name: String, meta: &std::fs::Metadata) -> FileMetadata {
    let mut file = FileMetadata::new(name);
    file.date_accessed = to_utc(meta.accessed());
    file.date_modified = to_utc(meta.modified());
    file.date_created = to_utc(meta.created());
    file.attributes = u32::from(meta.permissions().readonly());
    file.size = meta.len();
    file
}

type BoxedScan<'a> = Pin<Box<dyn Future<Output = anyhow::Result<MetadataNode>> + 'a>>;

/// Store every regular file below `dir` and build its metadata tree.
fn scan_directory<'a>(
    store: &'a BlobStore,
    set: &'a BackupSetReference,
    dir: PathBuf,
) -> BoxedScan<'a> {
    Box::pin(async move {
        let meta = tokio::fs::metadata(&dir)
            .await
            .with_context(|| format!("cannot stat {}", dir.display()))?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut node = MetadataNode::new(file_metadata(name, &meta));

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                node.add_directory(scan_directory(store, set, path).await?);
            } else if file_type.is_file() {
                let meta = entry.metadata().await?;
                let reader = tokio::fs::File::open(&path).await?;
                let hash = store.store_reader(set, reader, BlobType::FileBlob).await?;
                node.add_file(file_metadata(name, &meta).with_content(hash, meta.len()));
            } else {
                tracing::warn!("Skipping {}: not a regular file", path.display());
            }
        }
        Ok(node)
    })
}

type BoxedRestore<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + 'a>>;

fn restore_directory<'a>(
    store: &'a BlobStore,
    node: &'a MetadataNode,
    target: PathBuf,
) -> BoxedRestore<'a> {
    Box::pin(async move {
        tokio::fs::create_dir_all(&target).await?;
        for file in node.files() {
            let path = checked_join(&target, &file.name)?;
            let Some(hash) = file.file_hash else {
                tracing::warn!("Skipping {}: no content recorded", path.display());
                continue;
            };
            let data = store.retrieve_data(&hash).await?;
            tokio::fs::write(&path, &data)
                .await
                .with_context(|| format!("cannot write {}", path.display()))?;
        }
        for child in node.directories() {
            restore_directory(store, child, checked_join(&target, child.name())?).await?;
        }
        Ok(())
    })
}

/// Names from a stored tree must stay inside the restore target.
fn checked_join(target: &Path, name: &str) -> anyhow::Result<PathBuf> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        anyhow::bail!("refusing to restore entry named {:?}", name);
    }
    Ok(target.join(name))
}
