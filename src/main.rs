use std::{process, sync::Arc};

use tokio::{net::TcpListener, sync::Notify, task::JoinError};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use trellis::{
    application::{Db, Error, ModelRegistry, store::Store},
    cache::{CacheConfig, CacheRegistry},
    config,
    demo,
    infra::{
        error::InfraError,
        http::HttpState,
        store::{MemoryStore, PostgresStore},
        telemetry,
    },
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &Error) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), Error> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        Error::from(InfraError::configuration(format!(
            "failed to load configuration: {err}"
        )))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    let models = demo::registry()?;
    let db = init_db(&settings, models.clone()).await?;

    match command {
        config::Command::Serve(_) => run_serve(&settings, db, &models).await,
        config::Command::Migrate(_) => {
            models.bootstrap(&db).await?;
            info!(target = "trellis::bootstrap", "migration finished");
            Ok(())
        }
        config::Command::Cleanup(args) => {
            if models.entry_for_table(&args.table).is_none() {
                return Err(Error::bad_request(format!(
                    "`{}` is not a registered table",
                    args.table
                )));
            }
            let removed = db.cleanup_table(&args.table).await?;
            info!(
                target = "trellis::bootstrap",
                table = %args.table,
                removed,
                "cleanup finished"
            );
            Ok(())
        }
    }
}

async fn init_db(settings: &config::Settings, models: Arc<ModelRegistry>) -> Result<Db, Error> {
    let store: Arc<dyn Store> = match &settings.database.url {
        Some(url) => {
            let store =
                PostgresStore::connect("postgres", url, settings.database.max_connections.get())
                    .await?;
            info!(target = "trellis::bootstrap", "connected to postgres");
            Arc::new(store)
        }
        None => {
            warn!(
                target = "trellis::bootstrap",
                "no database url configured; using the in-memory engine"
            );
            Arc::new(MemoryStore::default())
        }
    };

    let caches = CacheRegistry::new(CacheConfig::from(&settings.cache)).map_err(InfraError::from)?;

    Db::builder(store)
        .caches(Arc::new(caches))
        .models(models)
        .settings(settings.crud)
        .build()
}

async fn run_serve(
    settings: &config::Settings,
    db: Db,
    models: &ModelRegistry,
) -> Result<(), Error> {
    models.bootstrap(&db).await?;

    let state = HttpState::new(db).with_request_timeout(settings.server.request_timeout);
    let router = demo::router(state);

    let addr = settings.server.addr;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| InfraError::Bind { addr, source })?;
    info!(target = "trellis::http", %addr, "listening");

    let stopping = Arc::new(Notify::new());
    let signal = {
        let stopping = stopping.clone();
        async move {
            shutdown_signal().await;
            stopping.notify_one();
        }
    };
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(signal)
            .await
    });

    tokio::select! {
        joined = &mut server => return server_outcome(joined),
        () = stopping.notified() => {}
    }

    let grace = settings.server.graceful_shutdown;
    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => server_outcome(joined)?,
        Err(_) => {
            warn!(
                target = "trellis::http",
                grace_seconds = grace.as_secs(),
                "graceful shutdown timed out; aborting open connections"
            );
            server.abort();
        }
    }
    info!(target = "trellis::http", "server stopped");
    Ok(())
}

fn server_outcome(joined: Result<std::io::Result<()>, JoinError>) -> Result<(), Error> {
    match joined {
        Ok(result) => result.map_err(|err| Error::from(InfraError::from(err))),
        Err(err) => Err(Error::internal(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "trellis::http", error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "trellis::http", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!(target = "trellis::http", "shutdown signal received");
}
