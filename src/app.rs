//! Application struct that encapsulates server assembly and serving logic.

use crate::cli::RunArgs;
use omni_core::config::{AppEnv, Config};
use omni_core::lifecycle::signal::SignalHandler;
use omni_server::AppState;
use std::net::SocketAddr;

pub struct Application {
    config: Config,
    app_router: axum::Router,
}

/// Load the config file (defaults when absent) and apply CLI/env overrides.
pub fn load_config(args: &RunArgs) -> anyhow::Result<Config> {
    let mut config = Config::load_or_default(&args.config)?;

    if let Some(ref host) = args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ref level) = args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(ref env) = args.app_env {
        config.app_env = env.parse::<AppEnv>()?;
    }
    if let Some(log_exceptions) = args.log_exceptions {
        config.logging.exceptions = log_exceptions;
    }

    config.validate()?;
    Ok(config)
}

impl Application {
    pub fn build(config: Config) -> Self {
        tracing::info!(
            app = %config.app_name,
            env = %config.app_env,
            log_exceptions = config.logging.exceptions,
            "Application configured"
        );
        let app_router = omni_server::build_router(AppState::new(config.clone()));
        Self { config, app_router }
    }

    /// Bind, serve until a shutdown signal arrives, then drain.
    pub async fn serve(self) -> anyhow::Result<()> {
        let Self { config, app_router } = self;

        let (signal_handler, mut shutdown_rx) = SignalHandler::new();
        tokio::spawn(signal_handler.run());

        let addr = format!("{}:{}", config.host, config.port);
        tracing::info!("Starting HTTP server on {addr}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        let shutdown = async move {
            let _ = shutdown_rx.wait_for(|v| *v).await;
        };

        axum::serve(
            listener,
            app_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        tracing::info!("Server shut down.");
        Ok(())
    }
}
