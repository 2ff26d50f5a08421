use axum::{http::StatusCode, response::IntoResponse};
use tokio::signal;
use tracing::{error, info};

pub async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "404 page not found")
}

/// Resolves on Ctrl-C or, on unix, SIGTERM. Open connections are left to
/// finish; a streamed conversion keeps its encoder until the body is done.
pub async fn do_shutdown() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to listen for ctrl+c: {}", err);
            std::future::pending::<()>().await;
        }
        "ctrl+c"
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    let reason = tokio::select! {
        reason = ctrl_c => reason,
        reason = terminate => reason,
    };

    info!("received {}, starting graceful shutdown...", reason);
}
