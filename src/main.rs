use std::{process, sync::Arc};

use cartiera::{
    application::{
        error::AppError,
        render::{HtmlRenderer, PdfRenderer},
        session,
    },
    config,
    infra::{error::InfraError, http, storage::StorageArea, telemetry},
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info};
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
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::RenderFile(args) => run_render_file(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let assets = Arc::new(
        StorageArea::new(settings.storage.public_dir.clone())
            .map_err(|err| AppError::from(InfraError::Io(err)))?,
    );
    let storage = Arc::new(
        StorageArea::new(settings.storage.storage_dir.clone())
            .map_err(|err| AppError::from(InfraError::Io(err)))?,
    );

    let renderer: Arc<dyn HtmlRenderer> = Arc::new(PdfRenderer::new(
        settings.render.wkhtmltopdf_path.clone(),
        settings.storage.storage_dir.clone(),
        settings.storage.storage_dir.clone(),
    )?);

    let shutdown = CancellationToken::new();
    let (session, actor) = session::spawn(
        renderer,
        storage.clone(),
        settings.render.viewer_path.clone(),
        shutdown.clone(),
    );

    let state = http::HttpState::new(session, assets, storage, shutdown.clone());
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::Io(err)))?;

    info!(
        target: "cartiera::serve",
        addr = %settings.server.addr,
        public_dir = %settings.storage.public_dir.display(),
        storage_dir = %settings.storage.storage_dir.display(),
        "listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    // The HTTP side is down; wait for the actor to drain in-flight renders.
    shutdown.cancel();
    if let Err(err) = actor.await {
        error!(target: "cartiera::serve", error = %err, "session actor task failed");
    }

    info!(target: "cartiera::serve", "shutdown complete");
    Ok(())
}

async fn run_render_file(
    settings: config::Settings,
    args: config::RenderFileArgs,
) -> Result<(), AppError> {
    let html = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(|err| AppError::from(InfraError::Io(err)))?;

    let renderer = PdfRenderer::new(
        settings.render.wkhtmltopdf_path.clone(),
        settings.storage.storage_dir.clone(),
        settings.storage.storage_dir.clone(),
    )?;

    let name = tokio::task::spawn_blocking(move || renderer.render(&html))
        .await
        .map_err(|err| AppError::unexpected(format!("render task failed: {err}")))??;

    info!(
        target: "cartiera::render_file",
        input = %args.file.display(),
        output = %name,
        "rendered"
    );
    println!("{name}");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then cancel the session actor. The returned
/// future also tells axum to stop accepting connections.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target: "cartiera::serve", error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target: "cartiera::serve", error = %err, "failed to listen for SIGTERM");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(target: "cartiera::serve", "shutdown signal received");
    cancel.cancel();
}
