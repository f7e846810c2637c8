use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use linkstream::config::{AppConfig, CliArgs, StoreBackend};
use linkstream::fetcher::ChunkFetcher;
use linkstream::handler::AppState;
use linkstream::ingest::Ingestor;
use linkstream::links::LinkRegistry;
use linkstream::pool::SessionPool;
use linkstream::server::build_router;
use linkstream::store::memory::MemoryStore;
use linkstream::store::s3::S3Store;
use linkstream::store::{ensure_reachable, ObjectStore};
use linkstream::trace::TraceWriter;

const MEMORY_PARTITION: &str = "local";

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = CliArgs::parse();
    let trace = match args.debug_trace.as_deref() {
        Some(p) => {
            let tw = TraceWriter::create(std::path::Path::new(p))
                .with_context(|| format!("failed to create debug trace file {p}"))?;
            info!(path = p, "debug trace enabled");
            Some(Arc::new(tw))
        }
        None => None,
    };
    let config = Arc::new(AppConfig::try_from(args)?);

    // ---------- session pool ----------
    let pool: Arc<SessionPool<dyn ObjectStore>> = Arc::new(SessionPool::new());
    match config.store {
        StoreBackend::Memory => {
            info!(container = %config.container, "using in-memory store");
            let store: Arc<dyn ObjectStore> =
                Arc::new(MemoryStore::new(config.container.clone(), MEMORY_PARTITION));
            ensure_reachable(store.as_ref(), &config.container).await?;
            pool.register(0, store)?;
        }
        StoreBackend::S3 => {
            let primary: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&config, None).await?);
            ensure_reachable(primary.as_ref(), &config.container)
                .await
                .context("default credentials")?;
            pool.register(0, primary)?;
            for (i, profile) in config.profiles.iter().enumerate() {
                let store: Arc<dyn ObjectStore> =
                    Arc::new(S3Store::connect(&config, Some(profile)).await?);
                ensure_reachable(store.as_ref(), &config.container)
                    .await
                    .with_context(|| format!("profile {profile}"))?;
                pool.register(i as u32 + 1, store)?;
            }
        }
    }
    info!(clients = pool.len(), chunk_size = config.chunk_size, "session pool ready");

    // ---------- links + ingestion ----------
    let links = Arc::new(match &config.links_file {
        Some(path) => LinkRegistry::open(path).await?,
        None => LinkRegistry::in_memory(),
    });
    let (_, primary) = pool.select()?;
    let ingestor = Arc::new(Ingestor::new(
        primary,
        links.clone(),
        config.temp_dir.clone(),
        config.base_url.clone(),
    ));
    if config.owner_token.is_none() {
        info!("no owner token configured; URL ingestion disabled");
    }

    // ---------- application state ----------
    let state = AppState {
        config: config.clone(),
        pool,
        fetcher: Arc::new(ChunkFetcher::new()),
        links,
        ingestor,
        trace: trace.clone(),
    };

    // ---------- HTTP server ----------
    let app = build_router(state).layer(TraceLayer::new_for_http());
    let addr = SocketAddr::new(config.bind_ip, config.port);
    let listener = TcpListener::bind(addr).await?;
    info!(base_url = %config.base_url, "linkstream listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(tw) = &trace {
        tw.flush();
    }
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "linkstream=info,tower_http=info".into()
            }),
        )
        .with_target(false)
        .compact()
        .init();
}
