mod cli;
mod control;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use iptvrelay_core::{logging, Config};
use iptvrelay_stream::{SessionManager, SessionRequest, SessionState, Target};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration
    let config = match Config::load_validated(cli.config.as_deref()) {
        Ok(config) => config,
        Err(iptvrelay_core::Error::Validation(errors)) => {
            for e in &errors {
                eprintln!("Config validation error: {e}");
            }
            return Err(anyhow::anyhow!(
                "Configuration validation failed with {} error(s)",
                errors.len()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(
        ports = %format!("{}-{}", config.server.port_range_start, config.server.port_range_end),
        transcoder = config.transcoder.enabled,
        "IPTV relay starting..."
    );

    // 3. Session manager
    let manager = SessionManager::new(config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(manager).await,
        Command::Relay {
            url,
            mode,
            kind,
            cast,
            max_bitrate,
            headers,
        } => {
            let mut request = SessionRequest::new(url).with_kind(kind);
            request.mode = mode;
            request.max_bitrate_kbps = max_bitrate;
            if cast {
                request = request.with_target(Target::Cast);
            }
            for (name, value) in headers {
                request = request.with_header(name, value);
            }
            relay(manager, request).await
        }
    }
}

/// Run the control API until a shutdown signal arrives.
async fn serve(manager: SessionManager) -> Result<()> {
    let address = manager.config().control_address();
    manager.start_idle_reaper();
    manager.prewarm_bootstrap();

    let listener = TcpListener::bind(&address).await?;
    info!("Control API listening on http://{address}");

    let app = control::router(manager.clone());
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutdown signal received, closing sessions...");
    manager.shutdown().await;
    info!("Control API shut down gracefully");
    result.map_err(Into::into)
}

/// Open one session, print where to play it, and hold it until it ends or
/// the process is interrupted.
async fn relay(manager: SessionManager, request: SessionRequest) -> Result<()> {
    manager.start_idle_reaper();
    let handle = manager.open(request).await?;
    println!("{}", handle.local_url());

    let outcome = tokio::select! {
        () = shutdown_signal() => None,
        outcome = handle.wait_terminal() => Some(outcome),
    };

    let result = match outcome {
        None => Ok(()),
        Some(Ok(SessionState::Ended)) => {
            info!(session_id = %handle.id(), "Session ended");
            Ok(())
        }
        Some(Ok(state)) => {
            warn!(session_id = %handle.id(), state = %state, "Session stopped");
            Ok(())
        }
        Some(Err(e)) => {
            error!("{e}");
            Err(e.into())
        }
    };

    manager.shutdown().await;
    result
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
