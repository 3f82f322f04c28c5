use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use uuid::Uuid;

/// Install the fmt subscriber. `log` records from the MQTT service are
/// forwarded through it as well.
pub fn start_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    if tracing_subscriber::fmt().with_max_level(level).try_init().is_err() {
        eprintln!("A global tracing subscriber was already installed.");
    }
    if verbose {
        tracing::debug!("Log level has been overridden by the verbose flag.");
    }
}

/// Client id that stays stable across reconnects so the broker keeps the session.
pub fn mqtt_client_id() -> String {
    format!("lab_watch_{}", Uuid::new_v4())
}

/// Resolve once Ctrl-C or SIGTERM is received.
async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to handle termination signal: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Cancel `shutdown` when the process is asked to stop.
pub fn handle_shutdown(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("Lab watcher is shutting down...");
        shutdown.cancel();
    });
}
