use anyhow::{Context, Result};
use clap::Parser;
use flow_series_server::services::series::formulas::FormulaRegistry;
use flow_series_server::services::series::store::{PgDeviceDirectory, PgReadingStore};
use flow_series_server::services::series::SeriesEngine;
use flow_series_server::{cli, config, db, openapi, routes, state};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind flow-series-server listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => Err(err)
            .with_context(|| format!("failed to bind flow-series-server listener on {addr}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::ServerConfig::from_env()?;

    let mut formulas = FormulaRegistry::builtin();
    if let Some(path) = config.formulas_path.as_deref() {
        let loaded = formulas.load_file(path)?;
        tracing::info!(path = %path.display(), loaded, "loaded configured formulas");
    }
    tracing::info!(formulas = formulas.len(), "formula registry ready");

    let pool = db::connect_lazy(&config.database_url)?;
    let series = SeriesEngine::new(
        Arc::new(formulas),
        Arc::new(PgDeviceDirectory::new(pool.clone())),
        Arc::new(PgReadingStore::new(pool)),
        config.query_limits(),
    );

    let cancel = CancellationToken::new();
    let state = state::AppState {
        config: config.clone(),
        series: Arc::new(series),
        shutdown: cancel.clone(),
    };

    let app = routes::router(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(%addr, "flow-series-server listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for shutdown signal: {err:#}");
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;
    cancel.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Sandbox environments can block binding attempts.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        if err.to_string().to_lowercase().contains("operation not permitted") {
            return Ok(());
        }
        let message = err.to_string().to_lowercase();

        assert!(message.contains(&addr.to_string()));
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
