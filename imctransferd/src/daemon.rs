use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use imctransfer_core::BoxClient;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, check_same_device};
use crate::sync::box_remote::BoxRemote;
use crate::sync::orchestrator::{PassError, PassReport, SyncOrchestrator};
use crate::sync::remote::RemoteStorage;
use crate::sync::report::write_report;
use crate::sync::store::{MetadataStore, PassSummary, StatusCounts, default_db_path};

pub struct DaemonRuntime {
    config: Config,
    orchestrator: SyncOrchestrator,
}

impl DaemonRuntime {
    /// Prepares the local tree, opens the store and checks the token
    /// against Box before any pass runs.
    pub async fn bootstrap(config: Config) -> anyhow::Result<Self> {
        prepare_dirs(&config).await?;

        let token = config
            .remote
            .access_token
            .clone()
            .context("no Box access token: set IMCTRANSFER_BOX_TOKEN or remote.access_token")?;
        let client = match config.remote.api_base_url.as_deref() {
            Some(url) => BoxClient::with_base_url(url, token)
                .with_context(|| format!("invalid Box API base url {url}"))?,
            None => BoxClient::new(token).context("failed to build Box client")?,
        };
        let user = client
            .get_current_user()
            .await
            .context("failed to authenticate with Box")?;
        info!(user_id = %user.id, login = ?user.login, "authenticated with Box");

        let store = open_store(&config).await?;
        let remote: Arc<dyn RemoteStorage> =
            Arc::new(BoxRemote::new(client, config.remote.page_size));
        Ok(Self::from_parts(config, remote, store))
    }

    pub fn from_parts(
        config: Config,
        remote: Arc<dyn RemoteStorage>,
        store: Arc<MetadataStore>,
    ) -> Self {
        let orchestrator = SyncOrchestrator::new(remote, store, config.sync_settings());
        Self {
            config,
            orchestrator,
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        self.orchestrator.store()
    }

    /// Runs passes every refresh interval until `cancel` fires, the idle
    /// timeout elapses or a fatal error occurs.
    pub async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let refresh = self.config.daemon.refresh_interval();
        let mut idle = IdleClock::new(Instant::now(), self.config.daemon.idle_timeout());
        info!(
            root_folder_id = %self.config.remote.root_folder_id,
            output = %self.config.sync.root_output_dir.display(),
            refresh_secs = refresh.as_secs(),
            "daemon started"
        );

        loop {
            match self.pass(cancel).await {
                Ok(report) => idle.observe(Instant::now(), report.newly_verified.len()),
                Err(err) if err.is_fatal() => {
                    return Err(anyhow::Error::new(err).context("sync pass failed"));
                }
                Err(err) => warn!(error = %err, "sync pass failed; retrying next interval"),
            }

            if cancel.is_cancelled() {
                info!("shutdown requested");
                return Ok(());
            }
            let now = Instant::now();
            if idle.expired(now) {
                info!("no new acquisitions within the idle timeout; stopping");
                return Ok(());
            }

            let wait = idle.next_wait(now, refresh);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub async fn once(&self, cancel: &CancellationToken) -> anyhow::Result<PassReport> {
        self.pass(cancel).await.context("sync pass failed")
    }

    async fn pass(&self, cancel: &CancellationToken) -> Result<PassReport, PassError> {
        let report = self.orchestrator.run_pass(cancel).await?;
        for failure in &report.failures {
            warn!(
                remote_id = %failure.remote_id,
                path = %failure.path,
                reason = %failure.reason,
                "file not synchronized"
            );
        }
        if self.config.daemon.metadata {
            if let Err(err) = self.write_metadata().await {
                warn!(error = %format!("{err:#}"), "failed to write metadata report");
            }
        }
        Ok(report)
    }

    pub async fn write_metadata(&self) -> anyhow::Result<usize> {
        write_metadata(self.store(), &self.config.daemon.metadata_file).await
    }
}

pub async fn open_store(config: &Config) -> anyhow::Result<Arc<MetadataStore>> {
    let path = match &config.daemon.database_path {
        Some(path) => path.clone(),
        None => default_db_path().context("failed to resolve metadata database path")?,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create database dir at {:?}", parent))?;
    }
    let store = MetadataStore::open(&path)
        .await
        .with_context(|| format!("failed to open metadata store at {:?}", path))?;
    Ok(Arc::new(store))
}

pub async fn status(store: &MetadataStore) -> anyhow::Result<String> {
    let counts = store
        .status_counts()
        .await
        .context("failed to read record counts")?;
    let last = store
        .last_pass()
        .await
        .context("failed to read last pass")?;
    Ok(render_status(&counts, last.as_ref()))
}

/// Returns `false` when the record exists but is not failed.
pub async fn reset(store: &MetadataStore, remote_id: &str) -> anyhow::Result<bool> {
    store
        .reset_failed(remote_id)
        .await
        .with_context(|| format!("failed to reset record {remote_id}"))
}

pub async fn write_metadata(store: &MetadataStore, path: &Path) -> anyhow::Result<usize> {
    let records = store
        .list_all()
        .await
        .context("failed to read sync records")?;
    let written = write_report(path, &records)
        .await
        .with_context(|| format!("failed to write metadata report to {:?}", path))?;
    info!(path = %path.display(), samples = written, "metadata report written");
    Ok(written)
}

async fn prepare_dirs(config: &Config) -> anyhow::Result<()> {
    let output = &config.sync.root_output_dir;
    let staging = &config.sync.staging_dir;
    tokio::fs::create_dir_all(output)
        .await
        .with_context(|| format!("failed to create output dir at {:?}", output))?;
    tokio::fs::create_dir_all(staging)
        .await
        .with_context(|| format!("failed to create staging dir at {:?}", staging))?;
    check_same_device(staging, output)?;
    Ok(())
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
