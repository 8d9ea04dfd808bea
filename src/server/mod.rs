//! HTTP surface and service wiring.
//!
//! `run` owns the whole service lifecycle: store initialization and
//! migrations, the backlog/writer pipeline, harvester supervision, the
//! retention task, and the axum server with graceful shutdown.

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backlog::Backlog;
use crate::config::Config;
use crate::harvest::{Sink, Supervisor};
use crate::notify::ChangeNotifier;
use crate::store::{migrations, Store};
use crate::tasks::vacuum::VacuumTask;
use crate::writer::Writer;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub notifier: ChangeNotifier,
    pub sse_debounce: Duration,
    pub sse_limit: u64,
}

/// Start the service and block until shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(Store::new(&config));
    store.initialize().await?;
    migrations::apply_pending(&store, &config.migrations).await?;

    let backlog = Arc::new(Backlog::new(config.backlog_capacity));
    let notifier = ChangeNotifier::new();
    let cancel = CancellationToken::new();

    let writer = Writer::new(
        store.clone(),
        backlog.clone(),
        notifier.clone(),
        config.write_batch_size,
    );
    let writer_task = tokio::spawn(writer.run(cancel.child_token()));

    let sink = Sink::new(backlog.clone(), config.log_timestamp_field.clone());
    let mut supervisor = Supervisor::new(sink);
    supervisor.load(&config.harvesters);
    supervisor.start_all();

    let vacuum = VacuumTask::new(store.clone(), &config);
    let vacuum_task = tokio::spawn(vacuum.run(cancel.child_token()));

    let state = AppState {
        store: store.clone(),
        notifier,
        sse_debounce: Duration::from_millis(config.sse_debounce_ms),
        sse_limit: config.sse_limit,
    };
    let app = create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("logging server started at http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    // Stop sources first so the writer's final flush sees every record.
    supervisor.stop_all().await;
    cancel.cancel();
    let _ = writer_task.await;
    let _ = vacuum_task.await;
    store.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
