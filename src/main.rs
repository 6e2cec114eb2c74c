use std::process;

use repcache::{
    config::{self, KeysArgs, PurgeArgs, Settings},
    error::AppError,
    infra::{
        bootstrap::{CacheRuntime, build_proxy},
        error::InfraError,
        telemetry,
    },
};
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
        config::Command::Keys(args) => run_keys(settings, args).await,
        config::Command::Purge(args) => run_purge(settings, args).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    if settings.origin.base_url.is_none() {
        return Err(AppError::validation(
            "serve requires origin.base_url (or --origin-url)",
        ));
    }

    let runtime = CacheRuntime::from_settings(&settings)?;
    let router = build_proxy(&settings, &runtime)?;

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        addr = %settings.server.addr,
        dev_mode = settings.cache.dev_mode,
        ttl_minutes = settings.cache.ttl_minutes,
        "repcache listening"
    );

    let served = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if tokio::time::timeout(settings.server.graceful_shutdown, runtime.release())
        .await
        .is_err()
    {
        warn!("timed out releasing cache backends");
    }

    served.map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn run_keys(settings: Settings, args: KeysArgs) -> Result<(), AppError> {
    let runtime = CacheRuntime::from_settings(&settings)?;
    let keys = runtime.cache.keys(&args.prefix).await;
    runtime.release().await;

    for key in keys? {
        println!("{key}");
    }
    Ok(())
}

async fn run_purge(settings: Settings, args: PurgeArgs) -> Result<(), AppError> {
    let runtime = CacheRuntime::from_settings(&settings)?;

    let outcome = match (args.key.as_deref(), args.prefix.as_deref()) {
        (Some(key), _) => runtime.cache.invalidate(key).await.map(|removed| {
            if removed {
                println!("deleted {key}");
            } else {
                println!("{key} not found");
            }
        }),
        (None, Some(prefix)) => runtime
            .cache
            .invalidate_prefix(prefix)
            .await
            .map(|removed| println!("deleted {removed} keys under `{prefix}`")),
        (None, None) => {
            runtime.release().await;
            return Err(AppError::validation("purge requires a KEY or --prefix"));
        }
    };

    runtime.release().await;
    outcome.map_err(AppError::from)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received, draining connections");
}
