//! `rttp-cache`: a caching reverse proxy in front of a single HTTP origin.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rttp_cache::cache::{CacheOrchestrator, DEFAULT_NAMESPACE};
use rttp_cache::config::ConfigTemplate;
use rttp_cache::origin::HttpOrigin;
use rttp_cache::proxy::CacheProxy;
use rttp_cache::server::Server;
use rttp_cache::store::MemoryStore;

const EXPIRY_SWEEP_EVERY: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "rttp-cache", version, about = "Collapsed-forwarding HTTP response cache")]
struct Args {
    /// Address to accept client connections on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Origin server address (`host:port`).
    #[arg(long)]
    origin: String,

    /// `Host` header sent to the origin; defaults to the origin address.
    #[arg(long)]
    origin_host: Option<String>,

    /// JSON configuration template.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Prefix for every store key.
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let template = ConfigTemplate::load(path)?;
            info!(path = %path.display(), "configuration loaded");
            template
        }
        None => {
            warn!("no --config given; using built-in defaults");
            ConfigTemplate::default()
        }
    };

    let store = Arc::new(MemoryStore::new());
    let _sweeper = store.spawn_expiry_sweeper(EXPIRY_SWEEP_EVERY);

    let mut origin = HttpOrigin::new(args.origin.clone());
    if let Some(host) = &args.origin_host {
        origin = origin.host(host.clone());
    }

    let cache = CacheOrchestrator::new(store.clone(), Arc::new(origin), store)
        .with_namespace(&args.namespace);
    let proxy = Arc::new(CacheProxy::new(cache, config));

    let server = Server::bind(&args.listen).await?;
    info!(origin = %args.origin, namespace = %args.namespace, "cache ready");
    server
        .run_until(
            move |req| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.handle(req).await }
            },
            async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            },
        )
        .await?;

    info!("stopped");
    Ok(())
}
