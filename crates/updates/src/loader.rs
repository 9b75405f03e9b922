use crate::error::{Result, UpdatesError};
use crate::fetcher::{AssetFetcher, ManifestFetcher};
use crate::manifest::{AssetRef, Manifest, Update, UpdateDirective};
use crate::state::{UpdatesStateMachine, UpdatesStateValue};
use crate::store::AssetStore;
use serde_json::Value;
use std::sync::Arc;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A decoded manifest endpoint response.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestResponse {
    Manifest(Manifest),
    Directive(UpdateDirective),
}

impl ManifestResponse {
    /// Decode a response body, which is either a manifest or a directive.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|err| UpdatesError::malformed(format!("invalid json: {err}")))?;
        let is_directive = value
            .as_object()
            .map(|object| {
                object.contains_key("type")
                    && !object.contains_key("launchAsset")
                    && !object.contains_key("bundleKey")
            })
            .unwrap_or(false);

        if is_directive {
            let directive = serde_json::from_value(value)
                .map_err(|err| UpdatesError::malformed(format!("invalid directive: {err}")))?;
            Ok(Self::Directive(directive))
        } else {
            Manifest::from_value(value).map(Self::Manifest)
        }
    }
}

/// Drives check and download cycles through the state machine.
pub struct Loader<F> {
    fetcher: F,
    machine: Arc<UpdatesStateMachine>,
    store: Arc<AssetStore>,
}

impl<F> Loader<F>
where
    F: ManifestFetcher + AssetFetcher,
{
    pub fn new(fetcher: F, machine: Arc<UpdatesStateMachine>, store: Arc<AssetStore>) -> Self {
        Self {
            fetcher,
            machine,
            store,
        }
    }

    pub fn machine(&self) -> &Arc<UpdatesStateMachine> {
        &self.machine
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.store
    }

    /// Run one check cycle and return the state it settled in.
    ///
    /// Transport failures are recorded on the machine and returned. A
    /// response that does not decode counts as no update.
    pub async fn check_for_update(&self) -> Result<UpdatesStateValue> {
        self.machine.begin_check()?;

        let raw = match self.fetcher.fetch_manifest().await {
            Ok(raw) => raw,
            Err(err) => {
                self.machine.report_check_error(&err)?;
                return Err(err);
            }
        };

        match ManifestResponse::parse(&raw) {
            Ok(ManifestResponse::Manifest(manifest)) => {
                debug!(update_id = %manifest.id(), "manifest received");
                self.machine.report_manifest(manifest)
            }
            Ok(ManifestResponse::Directive(directive)) => {
                debug!(?directive, "directive received");
                self.machine.report_directive(directive)
            }
            Err(err) => {
                self.machine.report_check_error(&err)?;
                Ok(self.machine.current())
            }
        }
    }

    /// Download and verify the update found by the last check.
    ///
    /// Only assets the store cannot already resolve are fetched. Cancelling
    /// `cancel` ends the download with [`UpdatesError::Cancelled`].
    pub async fn download_update(&self, cancel: &CancellationToken) -> Result<Update> {
        let manifest = self.machine.begin_download()?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UpdatesError::Cancelled),
            result = self.fetch_assets(&manifest) => result,
        };

        match result {
            Ok(()) => {
                let update = Update::downloaded((*manifest).clone());
                self.machine.report_downloaded(update.clone())?;
                self.machine.verify_and_finalize(&self.store)?;
                info!(update_id = %update.id(), "update ready");
                Ok(update)
            }
            Err(err) => {
                self.machine.report_download_error(&err)?;
                Err(err)
            }
        }
    }

    async fn fetch_assets(&self, manifest: &Manifest) -> Result<()> {
        let assets = manifest.assets();
        let total = assets.len();
        let mut completed = 0;

        for asset in assets {
            if !self.store.contains(&asset.hash) {
                self.fetch_asset(asset).await?;
            }
            completed += 1;
            self.machine.report_download_progress(completed, total)?;
        }
        Ok(())
    }

    async fn fetch_asset(&self, asset: &AssetRef) -> Result<()> {
        let bytes = self.fetcher.fetch_asset(asset).await?;
        let store = Arc::clone(&self.store);
        let expected = asset.hash.clone();

        // Hashing and the cache write are blocking work.
        task::spawn_blocking(move || store.record_verified(&expected, &bytes))
            .await
            .map_err(|err| UpdatesError::Io(std::io::Error::other(err)))??;
        debug!(key = %asset.key, hash = %asset.hash, "asset stored");
        Ok(())
    }
}
