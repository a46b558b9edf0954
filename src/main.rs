use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tributary::config::TributaryConfig;
use tributary::shutdown::ShutdownSignal;
use tributary::{server, ConnectorRegistry, Runtime};

#[tokio::main]
async fn main() -> ExitCode {
    // 1. Environment and logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 2. Configuration
    let config = match TributaryConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // 3. Runtime and modules
    let runtime = Arc::new(Runtime::new(
        config.runtime.clone(),
        ConnectorRegistry::with_builtins(),
    ));
    for definition in config.modules {
        let name = definition.name.clone();
        if let Err(e) = runtime.load(definition).await {
            error!(module = %name, error = %e, "Failed to load module");
            runtime.shutdown().await;
            return ExitCode::FAILURE;
        }
    }

    // 4. HTTP surface
    let shutdown = ShutdownSignal::with_timeout(config.runtime.drain_timeout());
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind");
            runtime.shutdown().await;
            return ExitCode::FAILURE;
        }
    };
    let router = server::build_router(runtime.clone(), config.server.api_key.clone());

    let served = server::serve(listener, router, shutdown.notified()).await;

    // 5. Drain modules
    info!(
        drain_timeout_ms = shutdown.timeout().as_millis() as u64,
        "Server stopped, unloading modules"
    );
    runtime.shutdown().await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
