use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use minik8s::bus::LocalBus;
use minik8s::cli::{self, Cli, Commands};
use minik8s::config::{load_config, load_config_from, Config};
use minik8s::server::{create_router, AppState};
use minik8s::store::{HttpStore, MemoryStore};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let loaded = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            process::exit(1);
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        error!("{}", e);
        process::exit(1);
    }

    if let Err(e) = run(cli.command, config).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(command: Commands, config: Config) -> anyhow::Result<()> {
    match command {
        Commands::Serve(_) => serve(config).await,
        Commands::Put(args) => {
            let store = HttpStore::new(&config.control_plane);
            let revision = cli::put_key(&store, &args.key, &args.value).await?;
            println!("{} written at revision {}", args.key, revision);
            Ok(())
        }
        Commands::Get(args) => {
            let store = HttpStore::new(&config.control_plane);
            let items = cli::get_keys(&store, &args.key, args.prefix).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                print!("{}", cli::format_key_values(&items));
            }
            Ok(())
        }
        Commands::Delete(args) => {
            let store = HttpStore::new(&config.control_plane);
            if cli::delete_key(&store, &args.key).await? {
                println!("{} deleted", args.key);
            } else {
                println!("{} not found", args.key);
            }
            Ok(())
        }
        Commands::Watch(args) => {
            let key = cli::watch_target(&args);
            let lister = cli::remote_lister(&config.control_plane);
            let informer_config = config.informer_config();
            let stop = shutdown_on_ctrl_c();

            info!("Watching {} via {}", key, config.control_plane);
            if args.informer {
                cli::run_informer(lister, key, informer_config, stop).await;
            } else {
                cli::run_watch(&lister, &key, informer_config.retry_backoff, stop).await;
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(
        Arc::new(MemoryStore::new()),
        Arc::new(LocalBus::new()),
        config.registry_config(),
    );
    let registry = state.registry.clone();
    let bus = state.bus.clone();
    let app = create_router(state);

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET    /health                     - Health check");
    info!("  GET    /v1/status                  - Relay status");
    info!("  GET    /v1/watches                 - Open shared watches");
    info!("  POST   /watch/<kind>/<ns>[/<name>] - Register or release a watch");
    info!("  POST   /bus/publish/<topic>        - Publish to the bus");
    info!("  GET    /bus/subscribe/<topic>      - Subscribe (WebSocket)");
    info!("  GET|PUT|DELETE /kv/<key>           - Key-value access");

    let stop = shutdown_on_ctrl_c();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stop.cancelled().await;
            // Ends open bus subscriptions so their WebSockets close
            bus.close();
        })
        .await
        .context("Server error")?;

    info!("Shutting down watch relay");
    registry.shutdown().await;
    Ok(())
}

/// Token cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        trigger.cancel();
    });
    token
}
