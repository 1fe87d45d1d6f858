use std::{net::SocketAddr, sync::Arc};
use tokio::signal;
use tracing::{error, info};

use obsidian_agent_api::{
    app::{create_router, on_shutdown, on_startup, AppState},
    config::get_settings,
    db::Database,
    logging::{render_error, setup_logging},
};

#[tokio::main]
async fn main() {
    // Load configuration from environment
    let settings = match get_settings() {
        Ok(settings) => settings,
        Err(e) => {
            if setup_logging("INFO").is_err() {
                eprintln!("Failed to load configuration: {:#}", e);
            }
            error!(error = %format!("{:#}", e), "application.startup_failed");
            std::process::exit(1);
        }
    };

    // Initialize structured logging
    if let Err(e) = on_startup(&settings) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    // Initialize database connection pool
    let database = match Database::new(&settings.database) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(error = %e, exception = %render_error(&e), "application.startup_failed");
            std::process::exit(1);
        }
    };

    let app = create_router(AppState {
        settings: Arc::clone(&settings),
        database: Arc::clone(&database),
    });

    let addr = settings.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!(address = %addr, "server.listening");
            listener
        }
        Err(e) => {
            error!(address = %addr, error = %e, "server.bind_failed");
            std::process::exit(1);
        }
    };

    // Start the server with graceful shutdown handling
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    if let Err(e) = served {
        error!(error = %e, "server.failed");
    }

    on_shutdown(&database);
}

/// Graceful shutdown signal handler
/// Listens for SIGTERM and SIGINT signals
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "server.signal_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "server.signal_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!(signal = "SIGINT", "server.shutdown_requested");
        },
        _ = terminate => {
            info!(signal = "SIGTERM", "server.shutdown_requested");
        },
    }
}
