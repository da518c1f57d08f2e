//! Multi-room WebSocket Chat Server - Entry Point
//!
//! Parses the command line, starts the rooms and accepts connections
//! until a shutdown signal arrives.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use room_chat::{handle_connection, AppError, BadWordTrie, ChatServer, Config};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=room_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("room_chat=info")),
        )
        .init();

    let config = Config::parse();
    info!("Starting in {:?} mode with {} rooms", config.mode, config.rooms);

    let badwords = match &config.badwords {
        Some(path) => {
            let words = BadWordTrie::from_reader(BufReader::new(File::open(path)?))?;
            info!("Loaded bad words from {}", path.display());
            words
        }
        None => BadWordTrie::new(),
    };

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();
    let server = ChatServer::start(config.clone(), badwords, shutdown.clone(), tracker.clone());

    let listener = match bind(&config).await {
        Ok(listener) => listener,
        Err(e) => {
            shutdown.cancel();
            tracker.close();
            tracker.wait().await;
            return Err(e);
        }
    };
    info!("WebSocket Chat Server listening on {}", config.addr);

    tokio::spawn(wait_for_signal(shutdown.clone()));
    accept_loop(listener, server, &shutdown).await;

    info!("Shutting down, waiting for sessions to close");
    shutdown.cancel();
    tracker.close();
    tracker.wait().await;
    info!("Server closed");

    Ok(())
}

/// Bind the listener, retrying a bounded number of times
async fn bind(config: &Config) -> Result<TcpListener, AppError> {
    let attempts = config.bind_retries.max(1);
    let mut attempt = 1;
    loop {
        match TcpListener::bind(&config.addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < attempts => {
                warn!(
                    "Bind {} failed (attempt {}/{}): {}",
                    config.addr, attempt, attempts, e
                );
                tokio::time::sleep(config.bind_backoff()).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(AppError::Bind {
                    addr: config.addr.clone(),
                    attempts,
                    source: e,
                })
            }
        }
    }
}

/// Connection accept loop
async fn accept_loop(listener: TcpListener, server: Arc<ChatServer>, shutdown: &CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let tracker = server.tracker().clone();
                    let server = Arc::clone(&server);
                    tracker.spawn(async move {
                        if let Err(e) = handle_connection(stream, server).await {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
        }
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
