//! The `sqlgate` binary: CLI entry point and process lifecycle.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};

use sqlgate::{Server, ServerConfig};

/// Exit code for generic failures.
const EXIT_FAILURE: i32 = 11;
/// Exit code for a hard kill on SIGTERM.
const EXIT_KILLED: i32 = 111;
/// How long an interrupt waits for in-flight work before exiting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Spin up a REST API over any SQL database.
#[derive(Parser, Debug)]
#[command(name = "sqlgate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the HTTP API endpoint.
    Serve {
        /// Listen port; overrides the PORT environment variable.
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Serve { port } => serve(port).await,
    };
    std::process::exit(code);
}

async fn serve(port: Option<u16>) -> i32 {
    let mut config = ServerConfig::from_env();
    if let Some(port) = port {
        config.port = port;
    }

    let server = Arc::new(Server::new(config));
    let shutdown = server.shutdown_token();
    let mut runner = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve().await }
    });

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "could not install signal handler");
            return EXIT_FAILURE;
        }
    };

    tokio::select! {
        result = &mut runner => match result {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "server exited with error");
                EXIT_FAILURE
            }
            Err(e) => {
                tracing::error!(error = %e, "server task panicked");
                EXIT_FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\ninterrupting...");
            shutdown.cancel();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut runner).await {
                Ok(Ok(Ok(()))) => 0,
                Ok(_) => EXIT_FAILURE,
                Err(_) => {
                    tracing::warn!("shutdown grace period elapsed, forcing exit");
                    0
                }
            }
        },
        _ = sigterm.recv() => {
            eprintln!("\nkilling process...");
            EXIT_KILLED
        }
    }
}
