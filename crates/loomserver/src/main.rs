mod api;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use api::AppState;
use loomruntime::{EngineConfig, ExecutionStore, MemoryStore, SledStore, WorkflowCatalog, WorkflowEngine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn open_store() -> anyhow::Result<Arc<dyn ExecutionStore>> {
    match std::env::var("LOOM_STORE_PATH") {
        Ok(path) if !path.trim().is_empty() => Ok(Arc::new(SledStore::open(path.trim())?)),
        _ => {
            info!("LOOM_STORE_PATH not set, executions are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Loom server");

    let config = EngineConfig::from_env();
    let sweep_interval = config.sweep_interval;
    let catalog = Arc::new(WorkflowCatalog::new());
    let engine = WorkflowEngine::builder()
        .config(config)
        .registry(Arc::new(loomnodes::builtin_registry()))
        .workflows(catalog.clone())
        .store(open_store()?)
        .build();

    info!(
        node_types = engine.registry().list_node_types().len(),
        "Engine initialized with standard nodes"
    );

    // Workflows are registered over HTTP; executions of workflows not known
    // yet are skipped here and picked up by `POST /api/executions/recover`.
    // Until then the sweeper leaves their interactions pending.
    let recovered = engine.recover().await?;
    if recovered > 0 {
        info!("Recovered {} active executions", recovered);
    }

    let shutdown = CancellationToken::new();
    let sweeper = engine.spawn_timeout_sweeper(sweep_interval, shutdown.clone());

    let app_state = web::Data::new(AppState { engine, catalog });
    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(api::configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    shutdown.cancel();
    sweeper.await?;
    info!("Server stopped");
    Ok(())
}
