//! Process-level entry point for updates.

use crate::config::{CheckAutomatically, UpdatesConfig};
use crate::error::{Result, UpdatesError};
use crate::fetcher::{AssetFetcher, ManifestFetcher};
use crate::launch::{launch, LaunchDecision};
use crate::loader::Loader;
use crate::manifest::{Manifest, Update};
use crate::state::{RollbackInfo, UpdateState, UpdatesStateMachine, UpdatesStateValue};
use crate::store::AssetStore;
use bytes::Bytes;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the state machine, the asset store and the boot decision.
pub struct UpdatesController<F> {
    config: UpdatesConfig,
    loader: Loader<F>,
    launched: LaunchDecision,
}

impl<F> UpdatesController<F>
where
    F: ManifestFetcher + AssetFetcher,
{
    /// Open the update directory and decide what to boot.
    ///
    /// A downloaded update recorded by an earlier run is launched when all
    /// of its assets are still present; otherwise the embedded update is.
    pub fn start<I>(
        config: UpdatesConfig,
        embedded_manifest: Manifest,
        embedded_assets: I,
        fetcher: F,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Bytes>,
    {
        config.validate()?;
        embedded_manifest.ensure_compatible(&config.runtime_version)?;

        let store = AssetStore::with_embedded_blobs(config.assets_dir(), embedded_assets)?;
        let indexed = store.scan_cache().unwrap_or_else(|err| {
            warn!(dir = %config.assets_dir().display(), %err, "could not index asset cache");
            0
        });
        let machine = UpdatesStateMachine::new(
            config.runtime_version.clone(),
            Update::embedded(embedded_manifest),
            config.check_automatically,
        );

        if let Some(pending) = read_pending(&config) {
            if pending.is_compatible(&config.runtime_version)
                && pending.id() != machine.state().embedded_update_id()
            {
                machine.restore_downloaded(Update::downloaded(pending))?;
            } else {
                info!(update_id = %pending.id(), "discarding stale pending update");
                discard_pending(&config);
            }
        }

        let decision = launch(&machine.state(), &store)?;
        if decision.is_emergency_launch {
            discard_pending(&config);
        }
        machine.mark_launched(&decision.update, decision.is_emergency_launch)?;
        info!(
            update_id = %decision.update.id(),
            cached_assets = indexed,
            emergency = decision.is_emergency_launch,
            "updates controller started"
        );

        Ok(Self {
            config,
            loader: Loader::new(fetcher, Arc::new(machine), Arc::new(store)),
            launched: decision,
        })
    }

    pub fn config(&self) -> &UpdatesConfig {
        &self.config
    }

    pub fn machine(&self) -> &Arc<UpdatesStateMachine> {
        self.loader.machine()
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        self.loader.store()
    }

    pub fn state(&self) -> UpdateState {
        self.machine().state()
    }

    /// What this process booted.
    pub fn launched(&self) -> &LaunchDecision {
        &self.launched
    }

    /// Whether the configured policy asks for a check right after launch.
    pub fn should_check_on_launch(&self, on_unmetered_network: bool) -> bool {
        match self.config.check_automatically {
            CheckAutomatically::OnLaunch => true,
            CheckAutomatically::WifiOnly => on_unmetered_network,
            CheckAutomatically::ErrorRecoveryOnly => self.launched.is_emergency_launch,
            CheckAutomatically::Never => false,
        }
    }

    /// Run one check cycle. A rollback directive clears the pending update.
    pub async fn check_for_update(&self) -> Result<UpdatesStateValue> {
        let value = self.loader.check_for_update().await?;
        if matches!(self.state().rollback, Some(RollbackInfo::ToEmbedded { .. })) {
            remove_pending(&self.config)?;
        }
        Ok(value)
    }

    /// Download the available update and record it for the next launch.
    ///
    /// A failed download leaves the previously recorded update in place.
    pub async fn download_update(&self, cancel: &CancellationToken) -> Result<Update> {
        let update = self.loader.download_update(cancel).await?;
        write_pending(&self.config, update.manifest())?;
        Ok(update)
    }

    /// Ask for a restart into the pending update.
    pub fn request_restart(&self) -> Result<()> {
        self.machine().request_restart()
    }
}

fn read_pending(config: &UpdatesConfig) -> Option<Manifest> {
    let path = config.pending_update_path();
    if !path.exists() {
        return None;
    }
    let parsed = fs::read(&path)
        .map_err(UpdatesError::from)
        .and_then(|raw| Manifest::parse(&raw));
    match parsed {
        Ok(manifest) => Some(manifest),
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring unreadable pending update");
            discard_pending(config);
            None
        }
    }
}

fn write_pending(config: &UpdatesConfig, manifest: &Manifest) -> Result<()> {
    let path = config.pending_update_path();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(&serde_json::to_vec_pretty(&manifest.to_value())?)?;
    temp.as_file().sync_all()?;
    temp.into_temp_path()
        .persist(&path)
        .map_err(|err| UpdatesError::Io(err.error))?;
    info!(update_id = %manifest.id(), "recorded pending update");
    Ok(())
}

/// Remove the pending record, logging instead of failing.
fn discard_pending(config: &UpdatesConfig) {
    if let Err(err) = remove_pending(config) {
        warn!(path = %config.pending_update_path().display(), %err, "could not clear pending update");
    }
}

fn remove_pending(config: &UpdatesConfig) -> Result<()> {
    let path = config.pending_update_path();
    if path.exists() {
        fs::remove_file(&path)?;
        info!(path = %path.display(), "cleared pending update");
    }
    Ok(())
}
