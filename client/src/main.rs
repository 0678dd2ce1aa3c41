use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use relaymux_shared::Error;
use tracing::{error, info, warn};

mod channel;
mod config;
mod origin_proxy;
mod reconnect;

use config::ClientConfig;
use origin_proxy::OriginProxy;
use reconnect::{BackoffConfig, ReconnectionController};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "relaymux=info".into()),
        )
        .init();

    let config = match ClientConfig::try_parse() {
        Ok(c) => c,
        Err(e) => {
            // clap's own process exit code doesn't match "1 = configuration
            // invalid"; print its message and translate the code ourselves.
            // `--help`/`--version` exit 0, same as clap.
            let _ = e.print();
            return if e.exit_code() == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            };
        }
    };
    run(config).await
}

async fn run(config: ClientConfig) -> ExitCode {
    let origin = Arc::new(OriginProxy::new(config.local_url.clone(), config.origin_timeout()));

    let backoff = BackoffConfig {
        initial: std::time::Duration::from_millis(config.reconnect_initial_ms),
        max: std::time::Duration::from_millis(config.reconnect_max_ms),
        multiplier: config.reconnect_multiplier,
        jitter: config.reconnect_jitter,
    };
    let mut controller = ReconnectionController::new(backoff);

    loop {
        controller.begin_connecting();
        info!(server = %config.server_url, local = %config.local_url, "connecting to relay");

        let result = channel::run(
            &config.server_url,
            config.secret_key.as_deref(),
            config.subdomain.as_deref(),
            origin.clone(),
            config.max_concurrent_requests,
        )
        .await;

        match result {
            Ok(()) => {
                info!("channel closed");
                controller.on_connected();
            }
            Err(Error::AuthFailed) => {
                error!("handshake rejected: invalid secret key");
                return ExitCode::from(1);
            }
            Err(Error::ShutdownRequested) => {
                info!("tunnel closed, shutting down");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                warn!(error = %e, "tunnel connection failed");
            }
        }

        if config.no_reconnect {
            info!("reconnection disabled, exiting");
            return ExitCode::from(2);
        }

        let delay = controller.on_disconnected();
        info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested during backoff, exiting");
                controller.stop();
                return ExitCode::SUCCESS;
            }
        }
        if controller.is_stopped() {
            return ExitCode::SUCCESS;
        }
    }
}
