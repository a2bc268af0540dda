mod textfile;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tuya_scale_client::ScaleError;
use tuya_scale_client::config::Config;
use tuya_scale_client::http_client::ReqwestScaleClient;
use tuya_scale_client::store::{self, JsonFileStore};
use tuya_scale_client::sync::run_sync;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().skip(1).any(|a| a == "--print-schema") {
        println!("{}", serde_json::to_string_pretty(&store::record_schema())?);
        return Ok(());
    }

    // Configure logging from env var `TUYA_SCALE_LOG_LEVEL` (or fallback to `RUST_LOG`, default `info`).
    let log_env = std::env::var("TUYA_SCALE_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    let combined_filter = format!("{log_env},hyper_util=warn,reqwest=warn");
    let env_filter = tracing_subscriber::EnvFilter::try_new(combined_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hyper_util=warn,reqwest=warn"));
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(env_filter)
        .init();
    tracing::info!(%log_env, "tuya_scale_sync: log filter");

    let config = Config::from_env().context("loading configuration")?;
    let metrics = PrometheusBuilder::new().install_recorder()?;
    let metrics_file = std::env::var_os("TUYA_SCALE_METRICS_FILE").map(PathBuf::from);

    let client = ReqwestScaleClient::with_options(
        config.endpoint(),
        config.credentials.access_id.clone(),
        config.credentials.access_key.clone(),
        config.client_options(),
    )?;
    client
        .validate_credentials()
        .await
        .context("validating Tuya credentials")?;
    tracing::info!(
        endpoint = config.endpoint(),
        device_id = %config.credentials.device_id,
        data_file = %config.data_file.display(),
        "credentials accepted"
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping at the next page or record");
            let _ = cancel_tx.send(true);
        }
    });

    let store = JsonFileStore::new(&config.data_file);
    let options = config.sync_options();
    loop {
        let outcome = run_sync(&client, &store, &options, &cancel_rx).await;
        export_metrics(&metrics, metrics_file.as_deref());
        match outcome {
            Ok(_) => {}
            Err(ScaleError::Cancelled) => break,
            Err(e) if config.sync_interval.is_none() => return Err(e.into()),
            // Already logged by run_sync; the next tick starts from the same checkpoint.
            Err(_) => {}
        }

        let Some(interval) = config.sync_interval else {
            break;
        };
        let mut cancel = cancel_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            Ok(()) = cancel.changed() => break,
        }
    }

    Ok(())
}

fn export_metrics(handle: &PrometheusHandle, path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    if let Err(e) = textfile::write_atomically(path, &handle.render()) {
        tracing::warn!(path = %path.display(), error = %e, "failed to write metrics file");
    }
}
