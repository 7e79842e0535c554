use axum::http::StatusCode;
use relaygate::app::{BackgroundTasks, build_app, load_state};
use relaygate::error::AppError;
use std::net::SocketAddr;

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,relaygate=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();

    if let Err(err) = run().await {
        tracing::error!(code = %err.code, "relaygate failed to start: {}", err.message);
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

fn startup_error(code: &str) -> impl FnOnce(String) -> AppError + '_ {
    move |message| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
}

async fn run() -> Result<(), AppError> {
    let state = load_state().await?;
    let addr: SocketAddr = state
        .runtime
        .listen
        .parse()
        .map_err(|err: std::net::AddrParseError| startup_error("listen_invalid")(err.to_string()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| startup_error("listen_failed")(err.to_string()))?;

    let background = BackgroundTasks::spawn(&state);
    let app = build_app(state);
    tracing::info!(%addr, "relaygate listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stream settlements and the final batch flush still run after a
    // failed serve.
    tracing::info!("server stopped, draining background work");
    background.shutdown().await;
    served.map_err(|err| startup_error("serve_failed")(err.to_string()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}
