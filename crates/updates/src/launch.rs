//! Selection of the update to boot.

use crate::error::{Result, UpdatesError};
use crate::manifest::{ContentHash, Update};
use crate::state::{UpdateState, UpdatesStateValue};
use crate::store::{AssetStore, ResolvedAsset};
use crate::verify::missing_refs;
use std::collections::HashSet;
use tracing::{info, warn};

/// Outcome of [`launch`].
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchDecision {
    pub update: Update,
    /// Where the launch asset of `update` lives.
    pub launch_asset: ResolvedAsset,
    /// Set when a downloaded update was chosen but could not be booted.
    pub is_emergency_launch: bool,
}

/// Pick the update to boot from a snapshot.
///
/// The downloaded update wins only when it is verified and no rollback is
/// recorded; in every other case the embedded update is used.
pub fn select_launchable(state: &UpdateState) -> Update {
    let verified = state.is_downloaded_verified
        && matches!(
            state.current_state,
            UpdatesStateValue::Ready | UpdatesStateValue::Restarting
        );
    match &state.downloaded_update {
        Some(update) if verified && state.rollback.is_none() => update.clone(),
        _ => state.embedded_update.clone(),
    }
}

/// Resolve the update to boot against what `store` actually holds.
///
/// A downloaded candidate with unresolvable assets is abandoned for the
/// embedded update. A missing embedded launch asset is fatal.
pub fn launch(state: &UpdateState, store: &AssetStore) -> Result<LaunchDecision> {
    let candidate = select_launchable(state);

    if !candidate.is_embedded() {
        let embedded = store.embedded_hashes();
        let available = store.cached_hashes();
        let missing = missing_refs(candidate.manifest().assets(), &embedded, &available);
        if missing.is_empty() {
            if let Some(launch_asset) = store.resolve(&candidate.manifest().launch_asset().hash) {
                info!(update_id = %candidate.id(), "launching downloaded update");
                return Ok(LaunchDecision {
                    update: candidate,
                    launch_asset,
                    is_emergency_launch: false,
                });
            }
        }
        warn!(
            update_id = %candidate.id(),
            missing = missing.len(),
            "downloaded update is incomplete, falling back to embedded update"
        );
        return launch_embedded(state, store, true);
    }

    launch_embedded(state, store, false)
}

fn launch_embedded(
    state: &UpdateState,
    store: &AssetStore,
    is_emergency_launch: bool,
) -> Result<LaunchDecision> {
    let update = state.embedded_update.clone();
    let launch_hash = &update.manifest().launch_asset().hash;
    let launch_asset = store
        .resolve(launch_hash)
        .ok_or_else(|| UpdatesError::LaunchAssetMissing {
            update_id: update.id().to_string(),
            hash: launch_hash.clone(),
        })?;

    let missing = missing_refs(
        update.manifest().assets(),
        &store.embedded_hashes(),
        &store.cached_hashes(),
    );
    if !missing.is_empty() {
        warn!(update_id = %update.id(), missing = missing.len(), "embedded update has unresolved assets");
    }

    info!(update_id = %update.id(), is_emergency_launch, "launching embedded update");
    Ok(LaunchDecision {
        update,
        launch_asset,
        is_emergency_launch,
    })
}

/// Hashes of the assets `update` needs that `store` cannot resolve.
pub fn unresolved_assets(update: &Update, store: &AssetStore) -> HashSet<ContentHash> {
    store.missing_from(update.manifest().assets().iter().map(|asset| &asset.hash))
}
