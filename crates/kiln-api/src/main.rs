//! Kiln API server.

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use kiln_api::shutdown::install_shutdown_handler;
use kiln_api::{AppState, routes};
use kiln_config::{LogFormat, StoreBackend, SystemConfig, load_system_config};
use kiln_core::auth::{Consumer, Identity, generate_token, hash_token};
use kiln_core::{ConsumerId, GroupId};
use kiln_db::{Store, create_pool, run_migrations};
use kiln_scheduler::{DispatchContext, Reaper};
use sqlx::PgPool;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln-server")]
#[command(about = "Kiln job dispatch control plane", long_about = None)]
struct Cli {
    /// Path to the KDL configuration file
    #[arg(long, env = "KILN_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and the reaper (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
    /// Issue a worker and hatchery registration token for a group
    GroupToken {
        /// Group id; a new group is created when omitted
        #[arg(long)]
        group: Option<GroupId>,
    },
    /// Issue a token for an internal service such as the workflow engine
    ServiceToken {
        #[arg(long)]
        name: String,
    },
    /// Issue an administrator token
    AdminToken {
        #[arg(long)]
        username: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_system_config(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SystemConfig::default(),
    }
    .with_env_overrides();
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    init_tracing(config.log_format);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Migrate => {
            let pool = connect(&config).await?;
            info!("Migrations applied");
            pool.close().await;
            Ok(())
        }
        Commands::GroupToken { group } => {
            let store = postgres_store(&config).await?;
            let group = group.unwrap_or_default();
            let token = generate_token();
            store
                .consumers
                .insert_group_token(&hash_token(&token), group)
                .await?;
            println!("group: {}", group);
            println!("token: {}", token);
            Ok(())
        }
        Commands::ServiceToken { name } => {
            let store = postgres_store(&config).await?;
            issue(&store, Identity::Service { name }).await
        }
        Commands::AdminToken { username } => {
            let store = postgres_store(&config).await?;
            let identity = Identity::User {
                username,
                admin: true,
                groups: vec![],
            };
            issue(&store, identity).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Connect to PostgreSQL and bring the schema up to date.
async fn connect(config: &SystemConfig) -> anyhow::Result<PgPool> {
    info!("Connecting to database...");
    let pool = create_pool(&config.database.url, config.database.max_connections).await?;
    run_migrations(&pool).await?;
    info!("Database connected");
    Ok(pool)
}

async fn postgres_store(config: &SystemConfig) -> anyhow::Result<Store> {
    if config.store != StoreBackend::Postgres {
        bail!("token commands need the postgres store; the memory store lives only inside a running server");
    }
    Ok(Store::postgres(connect(config).await?))
}

async fn issue(store: &Store, identity: Identity) -> anyhow::Result<()> {
    let token = generate_token();
    let consumer = Consumer {
        id: ConsumerId::new(),
        identity,
        issuer: "kiln-server".to_string(),
        expires_at: None,
        created_at: Utc::now(),
    };
    store.consumers.insert(&consumer, &hash_token(&token)).await?;
    println!("token: {}", token);
    Ok(())
}

async fn serve(config: SystemConfig) -> anyhow::Result<()> {
    let (store, pool) = match config.store {
        StoreBackend::Postgres => {
            let pool = connect(&config).await?;
            (Store::postgres(pool.clone()), Some(pool))
        }
        StoreBackend::Memory => {
            info!("Using the in-memory store; state is lost on restart");
            (Store::memory(), None)
        }
    };

    let listen = config.server.listen.clone();
    let ctx = DispatchContext::new(store, config);
    let shutdown = install_shutdown_handler();

    let reaper = Reaper::new(ctx.clone());
    let reaper_shutdown = shutdown.clone();
    let reaper_task = tokio::spawn(async move { reaper.run(reaper_shutdown).await });

    let state = AppState::new(ctx, pool);
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", listen);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    reaper_task.await?;
    info!("Server stopped");
    Ok(())
}
