//! `stepline worker`: run the worker pool in the foreground.

use anyhow::Result;
use console::style;

use crate::state::AppState;

pub async fn run_worker(state: &AppState, concurrency: Option<usize>, json: bool) -> Result<()> {
    let mut config = state.config.clone();
    if let Some(n) = concurrency {
        config.worker.concurrency = n;
    }
    config.validate()?;

    let engine = state.engine_with(config)?;
    let pool = engine.start();

    if json {
        let out = serde_json::json!({
            "pool_id": pool.pool_id(),
            "workers": pool.workers(),
            "data_dir": state.data_dir.display().to_string(),
        });
        println!("{}", serde_json::to_string(&out)?);
    } else {
        println!();
        println!(
            "  {} Worker pool {} running {} worker(s)",
            style("*").green().bold(),
            style(pool.pool_id()).cyan(),
            pool.workers()
        );
        println!("  Data dir: {}", state.data_dir.display());
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    shutdown_signal().await;
    tracing::info!("shutdown requested, draining workers");
    pool.shutdown().await;

    if !json {
        println!("\n  Worker pool stopped.");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
