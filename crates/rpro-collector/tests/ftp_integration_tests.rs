//! Integration tests against a live IHM FTP server
//!
//! Marked with #[ignore]; point them at a terminal (or any FTP server holding
//! a few CSV exports) and run them explicitly:
//!
//! ```bash
//! RPRO_TEST_FTP_HOST=192.168.0.10 RPRO_TEST_FTP_PATH=/InternalStorage/data/ \
//!     cargo test --test ftp_integration_tests -- --ignored --nocapture
//! ```
//!
//! Optional: `RPRO_TEST_FTP_PORT`, `RPRO_TEST_FTP_USER`, `RPRO_TEST_FTP_PASSWORD`.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use rpro_collector::db::InMemoryRecordStore;
use rpro_collector::ingest::{Collector, CollectorConfig, FileSource, IhmEndpoint, IhmFtpSource};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rpro_collector=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn endpoint_from_env() -> Result<IhmEndpoint> {
    let host = std::env::var("RPRO_TEST_FTP_HOST").context("RPRO_TEST_FTP_HOST not set")?;
    let mut endpoint = IhmEndpoint::new("IHM1", host);

    if let Ok(port) = std::env::var("RPRO_TEST_FTP_PORT") {
        endpoint = endpoint.with_port(port.parse().context("Invalid RPRO_TEST_FTP_PORT")?);
    }
    if let Ok(path) = std::env::var("RPRO_TEST_FTP_PATH") {
        endpoint = endpoint.with_remote_path(path);
    }
    if let Ok(user) = std::env::var("RPRO_TEST_FTP_USER") {
        let password = std::env::var("RPRO_TEST_FTP_PASSWORD").unwrap_or_default();
        endpoint = endpoint.with_credentials(user, password);
    }
    Ok(endpoint)
}

#[tokio::test]
#[ignore]
async fn test_connection_real() -> Result<()> {
    init_tracing();
    let temp = tempfile::tempdir()?;
    let source = IhmFtpSource::new(endpoint_from_env()?, temp.path());

    let check = source.test_connection().await;
    info!(ok = check.ok, "{}", check.message);
    assert!(check.ok, "connection test failed: {}", check.message);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_list_and_download_real() -> Result<()> {
    init_tracing();
    let temp = tempfile::tempdir()?;
    let source = IhmFtpSource::new(endpoint_from_env()?, temp.path());

    let entries = source.list_csv_files().await?;
    info!("Listed {} CSV files", entries.len());
    assert!(entries.iter().all(|e| e.is_csv()));

    let Some(first) = entries.first() else {
        info!("No CSV exports on server, nothing to download");
        return Ok(());
    };

    let file = source.download_file(first).await?;
    info!(file = %file.name, hash = %file.hash, size = file.size, "Downloaded");
    assert!(file.local_path.starts_with(source.temp_dir()));
    assert!(file.local_path.exists());
    assert_eq!(file.hash.len(), 64);

    // a known hash is filtered out and its temp copy removed
    let known: HashSet<String> = [file.hash.clone()].into();
    let again = source.find_new_files(known).await?;
    assert!(again.iter().all(|f| f.name != first.name || f.hash != file.hash));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_collect_twice_real() -> Result<()> {
    init_tracing();
    let temp = tempfile::tempdir()?;
    let mut config = CollectorConfig::racao(endpoint_from_env()?, 60);
    config.temp_dir = temp.path().to_path_buf();

    let store = Arc::new(InMemoryRecordStore::new());
    let collector = Collector::with_ftp(config, store.clone());

    let first = collector.run_once().await?;
    for result in &first {
        info!(
            file = %result.file_name,
            rows = result.rows_processed,
            saved = result.rows_saved,
            "{}",
            result.error_message.as_deref().unwrap_or("ok")
        );
    }

    let second = collector.run_once().await?;
    let resaved: usize = second.iter().map(|r| r.rows_saved).sum();
    assert_eq!(resaved, 0, "second pass must not store new rows");
    info!("Stored {} feed batches", store.production_count().await);
    Ok(())
}
