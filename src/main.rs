use anyhow::Context;
use clap::{Parser, Subcommand};
use oxidized_queue::{
    config::Config,
    create_router,
    llm::{LlmJobExecutor, ProviderCatalog},
    queue::run_dispatcher,
    store::{AtomicStore, MemoryStore, RedisStore},
    utils::init_logger,
    AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "oxidized-queue", version, about = "Priority job queue for rate-limited LLM providers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API (with the embedded dispatcher unless EMBEDDED_WORKER=false)
    Serve {
        /// Use the in-process store instead of Redis
        #[arg(long)]
        memory: bool,
    },
    /// Run a standalone dispatcher
    Work {
        /// Process one batch and exit
        #[arg(long)]
        once: bool,
    },
    /// Remove orphaned index entries for every job type
    Cleanup,
    /// Print queue depths and provider usage
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config.server);

    let memory = matches!(cli.command, Command::Serve { memory: true });
    let (state, redis) = build_state(config, memory).await?;

    match cli.command {
        Command::Serve { .. } => serve(state, redis).await,
        Command::Work { once: true } => {
            let summary = state.worker.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Work { once: false } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let tasks = spawn_dispatcher(&state, redis.as_ref(), shutdown_rx);
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
            join_background(tasks).await
        }
        Command::Cleanup => {
            let summary = state.queue.cleanup_all().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Stats => {
            let stats = state.queue.stats().await?;
            let usage = state.limiter.usage_all().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "queues": stats, "providers": usage }))?
            );
            Ok(())
        }
    }
}

/// Build the shared state. The Redis handle is returned as well so the
/// dispatcher can subscribe to wake-ups published by other processes.
async fn build_state(config: Config, memory: bool) -> anyhow::Result<(AppState, Option<RedisStore>)> {
    let (store, redis): (Arc<dyn AtomicStore>, Option<RedisStore>) = if memory {
        warn!("Using the in-memory store; jobs are lost on restart and not shared between processes");
        (Arc::new(MemoryStore::new()), None)
    } else {
        let store = RedisStore::connect(
            &config.redis.url,
            Duration::from_millis(config.redis.op_timeout_ms),
            config.redis.connect_retries,
        )
        .await
        .context("failed to connect to Redis")?;
        (Arc::new(store.clone()), Some(store))
    };

    let providers = Arc::new(ProviderCatalog::from_configured(&config.llm.providers));
    if providers.profiles().is_empty() {
        warn!("No LLM provider has an API key; every submission will be rejected");
    } else {
        for profile in providers.profiles() {
            info!(
                "Provider {} enabled: model {}, {} RPM, {} TPM",
                profile.id, profile.model, profile.rpm_limit, profile.tpm_limit
            );
        }
    }

    let executor = LlmJobExecutor::from_catalog(
        &providers,
        Duration::from_secs(config.llm.request_timeout_secs),
    )?;

    Ok((AppState::new(config, store, providers, Arc::new(executor)), redis))
}

/// Start the dispatcher and, on Redis, the listener that forwards wake-ups
/// from other processes into the local signal.
fn spawn_dispatcher(
    state: &AppState,
    redis: Option<&RedisStore>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::with_capacity(2);

    if let Some(redis) = redis {
        let wake = state.wake.clone();
        tasks.push(redis.spawn_wake_listener(
            state.queue.keys().wake_channel(),
            move || wake.wake(),
            shutdown.clone(),
        ));
    }

    tasks.push(tokio::spawn(run_dispatcher(
        state.worker.clone(),
        state.queue.clone(),
        state.wake.clone(),
        state.dispatcher_settings(),
        shutdown,
    )));
    tasks
}

async fn join_background(tasks: Vec<JoinHandle<()>>) -> anyhow::Result<()> {
    for task in tasks {
        task.await.context("background task panicked")?;
    }
    Ok(())
}

async fn serve(state: AppState, redis: Option<RedisStore>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = if state.config.queue.embedded_worker {
        spawn_dispatcher(&state, redis.as_ref(), shutdown_rx)
    } else {
        info!("Embedded dispatcher disabled; run `oxidized-queue work` separately");
        Vec::new()
    };

    let host: std::net::IpAddr = state
        .config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid HOST: {}", state.config.server.host))?;
    let addr = SocketAddr::from((host, state.config.server.port));

    let app = create_router(state);

    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    let _ = shutdown_tx.send(true);
    join_background(tasks).await?;
    info!("Shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
