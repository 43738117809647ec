use std::{process, sync::Arc, time::Duration};

use isrgate::{
    application::{error::AppError, gateway::Gateway},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        manifests::BuildManifests,
        telemetry,
    },
    queue::RevalidationConsumer,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
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

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Check(_) => run_check(&settings),
    }
}

fn run_check(settings: &config::Settings) -> Result<(), AppError> {
    let manifests = BuildManifests::load(&settings.build.dir)?;
    // Compiling the engine surfaces unsupported regexes as well.
    isrgate::routing::RoutingEngine::new(&manifests)?;
    println!("{}", manifests.summary());
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let manifests = BuildManifests::load(&settings.build.dir)?;
    let gateway = Gateway::from_settings(&settings, &manifests)?;

    let consumer_handle = spawn_consumer(
        gateway.consumer.clone(),
        gateway.config.auto_consume_interval_ms,
    );

    let result = serve_http(&settings, gateway).await;

    if let Some(handle) = consumer_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

/// Revalidation consumer on a fixed interval; `None` when disabled.
fn spawn_consumer(
    consumer: Arc<RevalidationConsumer>,
    interval_ms: u64,
) -> Option<JoinHandle<()>> {
    if interval_ms == 0 {
        info!("Revalidation consumer disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            consumer.consume().await;
        }
    }))
}

async fn serve_http(settings: &config::Settings, gateway: Gateway) -> Result<(), AppError> {
    let router = http::build_router(HttpState { gateway });

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "Listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            let _ = shutdown_rx.changed().await;
        },
    );
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut server => {
            return flatten_server_result(joined);
        }
        () = shutdown_signal() => {
            info!("Shutdown requested, draining connections");
            let _ = shutdown_tx.send(true);
        }
    }

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => flatten_server_result(joined),
        Err(_) => {
            warn!(
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "Graceful shutdown timed out"
            );
            server.abort();
            Ok(())
        }
    }
}

fn flatten_server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::unexpected(format!("server error: {err}"))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
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
}
