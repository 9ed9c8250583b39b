//! The grove bootstrap tool: create stores, run the services, take backups.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use grove_cache::PageCache;
use grove_core::GroveConfig;
use grove_merge::{GarbageCollector, MergeQueue, Merger};
use grove_store::{
    apply_ddl_to, CanonicalStore, SchemaStore, SessionManager, SqliteAuditSink, StorePaths,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "grove", about = "Block-structured content store", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "GROVE_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directories and empty stores
    Init,
    /// Run the merger and garbage collector until interrupted
    Serve,
    /// Copy every store into the backup directory
    Backup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GroveConfig::load_from_path(path)
            .await
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GroveConfig::load_or_create_default().await?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone())),
        )
        .init();

    match cli.command {
        Command::Init => init(&config).await,
        Command::Serve => serve(config).await,
        Command::Backup => backup(&config).await,
    }
}

async fn init(config: &GroveConfig) -> anyhow::Result<()> {
    config.ensure_directories().await?;
    let timeout = Duration::from_millis(config.merger.lock_timeout_ms);
    let paths = StorePaths::new(&config.storage.data_dir);

    let canonical = CanonicalStore::open(&paths.content(), timeout).await?;
    canonical.close().await;

    let schema = SchemaStore::open(&paths.schema(), timeout).await?;
    let version = schema.version().await?;
    schema.close().await;

    apply_ddl_to(&paths.users(), grove_store::ddl::USERS_DDL, timeout).await?;

    let audit = SqliteAuditSink::open(&paths.audit(), timeout).await?;
    audit.close().await;

    println!(
        "Initialized stores in {} (schema version {version})",
        config.storage.data_dir.display()
    );
    Ok(())
}

async fn serve(config: GroveConfig) -> anyhow::Result<()> {
    config.ensure_directories().await?;
    let timeout = Duration::from_millis(config.merger.lock_timeout_ms);
    let paths = StorePaths::new(&config.storage.data_dir);

    let canonical = Arc::new(CanonicalStore::open(&paths.content(), timeout).await?);
    let schema = Arc::new(SchemaStore::open(&paths.schema(), timeout).await?);
    let audit = Arc::new(SqliteAuditSink::open(&paths.audit(), timeout).await?);
    let cache = Arc::new(PageCache::new(
        &config.cache.dir,
        config.cache.max_size_mb,
        Duration::from_secs(config.cache.ttl_hours * 3600),
        config.cache.enabled,
    )?);

    let queue = MergeQueue::new(&config.storage.queue_dir);
    queue.ensure_layout().await?;

    let manager = Arc::new(SessionManager::new(
        Arc::clone(&canonical),
        Arc::clone(&schema),
        &config.storage.sessions_dir,
        &config.storage.queue_dir,
        config.session.clone(),
        timeout,
    ));
    let recovered = manager.recover().await?;
    info!("Hosting {recovered} recovered session(s)");

    let merger = Arc::new(Merger::new(
        Arc::clone(&canonical),
        Arc::clone(&schema),
        audit.clone(),
        Some(Arc::clone(&cache)),
        queue.clone(),
        config.merger.clone(),
    ));
    let gc = Arc::new(GarbageCollector::new(
        config.gc.clone(),
        &config.storage.sessions_dir,
        queue,
        Arc::clone(&audit),
        vec![
            ("content".to_string(), canonical.pool().clone()),
            ("audit".to_string(), audit.pool().clone()),
        ],
        timeout,
    ));

    let token = CancellationToken::new();
    let merger_task = Arc::clone(&merger).start(token.clone());
    let gc_task = Arc::clone(&gc).start(token.clone());

    info!("grove serving; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    token.cancel();
    merger_task.await.ok();
    gc_task.await.ok();

    let stats = merger.stats();
    info!(
        "Merger totals: {} merged, {} conflicted, {} failed",
        stats.merged, stats.conflicted, stats.failed
    );

    canonical.close().await;
    schema.close().await;
    audit.close().await;
    Ok(())
}

async fn backup(config: &GroveConfig) -> anyhow::Result<()> {
    config.ensure_directories().await?;
    let timeout = Duration::from_millis(config.merger.lock_timeout_ms);
    let paths = StorePaths::new(&config.storage.data_dir);
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");

    let mut taken = 0;
    for (name, path) in paths.all() {
        if !path.exists() {
            continue;
        }
        let target = config
            .storage
            .backup_dir
            .join(format!("{stamp}_{name}.db"));
        let pool = grove_store::open_existing(
            &path,
            grove_store::StoreJournal::Wal,
            timeout,
            1,
        )
        .await?;
        // VACUUM INTO writes a compact, consistent copy without blocking
        // readers.
        sqlx::query(&format!("VACUUM INTO '{}'", target.display()))
            .execute(&pool)
            .await
            .with_context(|| format!("backing up {name}"))?;
        pool.close().await;
        println!("Backed up {name} -> {}", target.display());
        taken += 1;
    }
    println!("{taken} store(s) backed up");
    Ok(())
}
