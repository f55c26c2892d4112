use std::sync::Arc;

use chronos_api::app::{self, AppServices};
use chronos_engine::{HandlerContext, HandlerRegistry, Worker, WorkerConfig};
use chronos_store::{JobStore, LockStore, MemoryJobStore, PostgresJobStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    chronos_observability::init();

    let (job_store, lock_store): (Arc<dyn JobStore>, Arc<dyn LockStore>) =
        match std::env::var("DATABASE_URL") {
            Ok(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(&url)
                    .await
                    .expect("failed to connect to DATABASE_URL");
                let store = Arc::new(PostgresJobStore::new(pool));
                store
                    .run_migrations()
                    .await
                    .expect("failed to run store migrations");
                tracing::info!("using postgres job store");
                (store.clone(), store)
            }
            Err(_) => {
                tracing::warn!("DATABASE_URL not set; using in-memory store (single process only)");
                let store = Arc::new(MemoryJobStore::new());
                (store.clone(), store)
            }
        };

    let worker = if WorkerConfig::disabled_by_env() {
        tracing::info!("DISABLE_WORKER set; serving API only");
        None
    } else {
        let mut registry = HandlerRegistry::new();
        // Built-in no-op handler, useful for smoke tests. Deployments
        // register their real task types here.
        registry.register_fn("echo", |ctx: HandlerContext| async move { Ok(ctx.payload) });

        let worker = Worker::new(
            job_store.clone(),
            lock_store,
            Arc::new(registry),
            WorkerConfig::from_env(),
        );
        worker.start();
        Some(worker)
    };

    let services = Arc::new(AppServices::new(job_store, worker.clone()));
    let router = app::build_app(services);

    let bind = std::env::var("CHRONOS_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {bind}: {e}"));
    tracing::info!("listening on {}", listener.local_addr().unwrap());

    let shutdown = install_shutdown_handler();
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .expect("server error");

    // Drain in-flight jobs; anything past the deadline is released back to
    // the store for other workers.
    if let Some(worker) = worker {
        worker.stop().await;
    }
}

/// Listen for SIGTERM/SIGINT and cancel the returned token on either.
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, draining"),
            _ = sigint.recv() => tracing::info!("received SIGINT, draining"),
        }
        child.cancel();
    });

    token
}
