use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use timereplay::catalog::Catalog;
use timereplay::manager::{JobStatus, Manager};
use timereplay::output::{ConsoleSink, HttpSink, OutputSink};
use timereplay::session::SessionRegistry;
use timereplay::state::AppState;
use timereplay::storage::{ClickhouseStore, MemoryStore, PostgresStore, SqliteStore, StorageSource};
use timereplay::streamer::Streamer;
use timereplay::{cli, config, db, routes};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind timereplay listener on {addr}: port already in use. Stop the other service using this port or re-run with --http-addr to choose another address.",
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind timereplay listener on {addr}")),
    }
}

async fn build_storage(db_url: &str) -> Result<Arc<dyn StorageSource>> {
    if db_url == "memory" {
        return Ok(Arc::new(MemoryStore::default()));
    }
    if let Some(scheme) = db_url.split(':').next() {
        match scheme {
            "postgres" | "postgresql" => {
                let pool = db::connect_postgres_lazy(db_url)?;
                return Ok(Arc::new(PostgresStore::new(pool)));
            }
            "sqlite" => {
                let pool = db::connect_sqlite_lazy(db_url)?;
                return Ok(Arc::new(SqliteStore::new(pool)));
            }
            "clickhouse" => {
                let http_url = format!("http://{}", db_url.trim_start_matches("clickhouse://"));
                return Ok(Arc::new(ClickhouseStore::new(&http_url)));
            }
            _ => {}
        }
    }
    anyhow::bail!("unrecognized --db URL scheme: {db_url}")
}

fn build_output(output: &str) -> Result<Option<Arc<dyn OutputSink>>> {
    if output == "stdout" || output.is_empty() {
        return Ok(Some(Arc::new(ConsoleSink)));
    }
    if output.starts_with("http://") || output.starts_with("https://") {
        let client = reqwest::Client::new();
        return Ok(Some(Arc::new(HttpSink::new(client, output, "timereplay"))));
    }
    anyhow::bail!("unrecognized --output target: {output}")
}

/// Blocks until the active job reaches a terminal status, polling on a
/// short tick and honoring Ctrl-C as a request to stop the job early. Keeps
/// the runtime alive for CLI-only invocations that have no HTTP server to
/// hold it open.
async fn wait_for_job(manager: &Manager) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let view = manager.status();
                if matches!(view.status, JobStatus::Done | JobStatus::Failed) {
                    if let Some(err) = view.error {
                        tracing::error!(error = %err, "replay job failed");
                    } else {
                        tracing::info!(
                            step_id = view.step_id,
                            updates_sent = view.updates_sent,
                            "replay job finished"
                        );
                    }
                    return;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = manager.stop().await;
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let config = config::ReplayConfig::from_args(args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut catalog = config
        .confile
        .as_deref()
        .map(Catalog::from_json_file)
        .transpose()?
        .unwrap_or_default();

    let storage = build_storage(&config.db_url).await?;
    let output = build_output(&config.output)?;

    let working_list = catalog.resolve(&config.slist)?;
    for &id in &working_list {
        catalog.ensure_id(id);
    }

    if config.show_range {
        let info = storage.range(&working_list, None, None).await?;
        println!(
            "{{\"min_ts\":{},\"max_ts\":{},\"distinct_sensor_count\":{}}}",
            info.min_ts.map(|ts| format!("\"{}\"", ts.to_rfc3339())).unwrap_or_else(|| "null".into()),
            info.max_ts.map(|ts| format!("\"{}\"", ts.to_rfc3339())).unwrap_or_else(|| "null".into()),
            info.distinct_sensor_count,
        );
        return Ok(());
    }

    let streamer = Arc::new(Streamer::new());
    streamer.reset(&catalog.sensors());
    let manager = Arc::new(Manager::new(
        storage,
        output,
        streamer.clone(),
        working_list,
        config.batch_size,
    ));

    if let (Some(from), Some(to)) = (config.from.as_deref(), config.to.as_deref()) {
        let from = config::parse_timestamp("from", from)?;
        let to = config::parse_timestamp("to", to)?;
        manager.set_pending_range(
            from,
            to,
            chrono::Duration::from_std(config.step).unwrap(),
            Some(config.speed),
            Some(chrono::Duration::from_std(config.window).unwrap()),
            None,
        )?;
        manager.start().await?;
    }

    let Some(http_addr) = config.http_addr.clone() else {
        tracing::info!("no --http-addr given; running without a control surface until the job finishes");
        wait_for_job(&manager).await;
        return Ok(());
    };

    let state = AppState {
        catalog: Arc::new(catalog),
        manager,
        streamer,
        sessions: Arc::new(SessionRegistry::new(config.control_timeout)),
        control_timeout: config.control_timeout,
    };

    let app = routes::router(state);
    let listener = bind_listener(&http_addr).await?;
    let cancel = CancellationToken::new();

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_cancel.cancel();
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
        assert!(message.contains("--http-addr"));

        drop(listener);
        Ok(())
    }
}
