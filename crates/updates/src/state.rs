//! Update lifecycle state machine.
//!
//! Every transition runs under one mutex, so transitions are atomic and
//! totally ordered. Each transition produces a [`StateChange`] that is
//! broadcast synchronously to subscribers before the call returns.

use crate::config::CheckAutomatically;
use crate::error::{Result, UpdatesError};
use crate::manifest::{ContentHash, Manifest, Update, UpdateDirective};
use crate::store::AssetStore;
use crate::subscription::{SubscriptionId, SubscriptionRegistry};
use crate::verify::missing_assets;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Upper bound on remembered incompatible manifest ids.
const MAX_REJECTED_MANIFESTS: usize = 64;

/// Position of the machine in the update lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatesStateValue {
    Idle,
    Checking,
    NoUpdateAvailable,
    UpdateAvailable,
    Downloading,
    Ready,
    DownloadError,
    Restarting,
    /// Terminal for the process: the downloaded candidate failed verification.
    RolledBack,
}

impl UpdatesStateValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::NoUpdateAvailable => "no_update_available",
            Self::UpdateAvailable => "update_available",
            Self::Downloading => "downloading",
            Self::Ready => "ready",
            Self::DownloadError => "download_error",
            Self::Restarting => "restarting",
            Self::RolledBack => "rolled_back",
        }
    }

    /// States from which a new check cycle may start directly.
    pub fn can_begin_check(&self) -> bool {
        matches!(self, Self::Idle | Self::NoUpdateAvailable)
    }
}

impl fmt::Display for UpdatesStateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable summary of an error kept in the state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&UpdatesError> for ErrorInfo {
    fn from(err: &UpdatesError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub completed: usize,
    pub total: usize,
}

/// Why the next launch will not use a downloaded update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RollbackInfo {
    /// The server asked for the embedded update.
    ToEmbedded { commit_time: String },
    /// The downloaded update was discarded after verification.
    IntegrityFailure {
        update_id: String,
        missing: Vec<ContentHash>,
    },
}

/// Immutable snapshot of the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateState {
    pub current_state: UpdatesStateValue,
    pub latest_manifest: Option<Arc<Manifest>>,
    pub downloaded_update: Option<Update>,
    /// Every asset of `downloaded_update` was found in the store.
    pub is_downloaded_verified: bool,
    pub launched_update_id: Option<String>,
    pub embedded_update: Update,
    pub is_emergency_launch: bool,
    pub check_automatically: CheckAutomatically,
    pub rollback: Option<RollbackInfo>,
    pub check_error: Option<ErrorInfo>,
    pub download_error: Option<ErrorInfo>,
    pub download_progress: Option<DownloadProgress>,
    /// Incremented on every broadcast.
    pub sequence: u64,
}

impl UpdateState {
    fn initial(embedded_update: Update, check_automatically: CheckAutomatically) -> Self {
        Self {
            current_state: UpdatesStateValue::Idle,
            latest_manifest: None,
            downloaded_update: None,
            is_downloaded_verified: false,
            launched_update_id: None,
            embedded_update,
            is_emergency_launch: false,
            check_automatically,
            rollback: None,
            check_error: None,
            download_error: None,
            download_progress: None,
            sequence: 0,
        }
    }

    pub fn embedded_update_id(&self) -> &str {
        self.embedded_update.id()
    }

    pub fn is_update_available(&self) -> bool {
        self.current_state == UpdatesStateValue::UpdateAvailable
    }

    /// A verified update is waiting for the next launch.
    pub fn is_update_pending(&self) -> bool {
        matches!(
            self.current_state,
            UpdatesStateValue::Ready | UpdatesStateValue::Restarting
        ) && self.downloaded_update.is_some()
            && self.is_downloaded_verified
    }

    /// Key/value rendering of the snapshot for event consumers.
    ///
    /// Consumers should ignore keys they do not know.
    pub fn to_event_payload(&self) -> Map<String, Value> {
        let manifest_value = |manifest: Option<&Manifest>| {
            manifest.map(Manifest::to_value).unwrap_or(Value::Null)
        };
        let payload = json!({
            "state": self.current_state.as_str(),
            "isChecking": self.current_state == UpdatesStateValue::Checking,
            "isDownloading": self.current_state == UpdatesStateValue::Downloading,
            "isUpdateAvailable": self.is_update_available(),
            "isUpdatePending": self.is_update_pending(),
            "isDownloadedVerified": self.is_downloaded_verified,
            "isRestarting": self.current_state == UpdatesStateValue::Restarting,
            "isRolledBack": self.current_state == UpdatesStateValue::RolledBack,
            "latestManifest": manifest_value(self.latest_manifest.as_deref()),
            "downloadedManifest": manifest_value(self.downloaded_update.as_ref().map(Update::manifest)),
            "launchedUpdateId": self.launched_update_id,
            "embeddedUpdateId": self.embedded_update_id(),
            "isEmergencyLaunch": self.is_emergency_launch,
            "checkAutomatically": self.check_automatically,
            "rollback": self.rollback,
            "checkError": self.check_error,
            "downloadError": self.download_error,
            "downloadProgress": self.download_progress,
            "sequence": self.sequence,
        });
        match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// What happened in a transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpdateEvent {
    #[serde(rename_all = "camelCase")]
    Launched {
        update_id: String,
        is_emergency_launch: bool,
    },
    Reset,
    CheckStarted,
    #[serde(rename_all = "camelCase")]
    ManifestResolved { update_id: String },
    NoUpdateAvailable { reason: Option<ErrorInfo> },
    CheckFailed { error: ErrorInfo },
    #[serde(rename_all = "camelCase")]
    RollBackToEmbedded { commit_time: String },
    #[serde(rename_all = "camelCase")]
    DownloadStarted { update_id: String },
    DownloadProgress { completed: usize, total: usize },
    #[serde(rename_all = "camelCase")]
    DownloadCompleted { update_id: String },
    DownloadFailed { error: ErrorInfo },
    #[serde(rename_all = "camelCase")]
    VerificationSucceeded { update_id: String },
    #[serde(rename_all = "camelCase")]
    VerificationFailed {
        update_id: String,
        missing: Vec<ContentHash>,
    },
    Restarting,
}

/// One broadcast: the event and the state right after it.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub event: UpdateEvent,
    pub state: UpdateState,
}

struct Inner {
    state: UpdateState,
    rejected_manifests: HashSet<String>,
    pending: Vec<StateChange>,
}

impl Inner {
    fn require(&self, operation: &'static str, allowed: &[UpdatesStateValue]) -> Result<()> {
        if allowed.contains(&self.state.current_state) {
            Ok(())
        } else {
            Err(UpdatesError::InvalidTransition {
                from: self.state.current_state.to_string(),
                operation,
            })
        }
    }

    fn record(&mut self, event: UpdateEvent) {
        self.state.sequence += 1;
        debug!(state = %self.state.current_state, sequence = self.state.sequence, ?event, "state transition");
        self.pending.push(StateChange {
            event,
            state: self.state.clone(),
        });
    }

    fn settle_no_update(&mut self, reason: Option<ErrorInfo>) {
        self.state.current_state = UpdatesStateValue::NoUpdateAvailable;
        self.record(UpdateEvent::NoUpdateAvailable { reason });
    }
}

/// Process-wide update controller state.
///
/// Construct one per process at start-up, seeded with the embedded update,
/// and share it by reference or `Arc` with every context that drives it.
pub struct UpdatesStateMachine {
    runtime_version: String,
    inner: Mutex<Inner>,
    // Sequence of the last broadcast change; emitters wait here for their turn.
    emitted: Mutex<u64>,
    turn: Condvar,
    listeners: SubscriptionRegistry<StateChange>,
}

impl fmt::Debug for UpdatesStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdatesStateMachine")
            .field("runtime_version", &self.runtime_version)
            .field("state", &self.current())
            .finish()
    }
}

impl UpdatesStateMachine {
    pub fn new(
        runtime_version: impl Into<String>,
        embedded_update: Update,
        check_automatically: CheckAutomatically,
    ) -> Self {
        Self {
            runtime_version: runtime_version.into(),
            inner: Mutex::new(Inner {
                state: UpdateState::initial(embedded_update, check_automatically),
                rejected_manifests: HashSet::new(),
                pending: Vec::new(),
            }),
            emitted: Mutex::new(0),
            turn: Condvar::new(),
            listeners: SubscriptionRegistry::new(),
        }
    }

    pub fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    /// Copy of the current state.
    pub fn state(&self) -> UpdateState {
        lock(&self.inner).state.clone()
    }

    pub fn current(&self) -> UpdatesStateValue {
        lock(&self.inner).state.current_state
    }

    /// Listen to every subsequent transition.
    ///
    /// Callbacks run on the thread that triggered the transition. They may
    /// read the machine but must not drive it.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn apply<T>(&self, transition: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let (result, changes) = {
            let mut inner = lock(&self.inner);
            let result = transition(&mut inner);
            (result, std::mem::take(&mut inner.pending))
        };
        let (Some(first), Some(last)) = (changes.first(), changes.last()) else {
            return result;
        };

        // Sequences are assigned under the state lock. Wait for the previous
        // batch so broadcasts keep transition order.
        let mut emitted = lock(&self.emitted);
        while *emitted + 1 < first.state.sequence {
            emitted = self
                .turn
                .wait(emitted)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        drop(emitted);

        for change in &changes {
            self.listeners.emit(change);
        }

        *lock(&self.emitted) = last.state.sequence;
        self.turn.notify_all();
        result
    }

    /// Record which update the process booted. Allowed once, at start-up.
    ///
    /// A restored update that was `Ready` is now running, so the machine
    /// settles back to `Idle`.
    pub fn mark_launched(&self, update: &Update, is_emergency_launch: bool) -> Result<()> {
        self.apply(|inner| {
            if inner.state.launched_update_id.is_some() {
                return Err(UpdatesError::InvalidTransition {
                    from: "launched".to_string(),
                    operation: "mark_launched",
                });
            }
            inner.require("mark_launched", &[UpdatesStateValue::Idle, UpdatesStateValue::Ready])?;
            inner.state.launched_update_id = Some(update.id().to_string());
            inner.state.is_emergency_launch = is_emergency_launch;
            inner.state.downloaded_update = (!update.is_embedded()).then(|| update.clone());
            inner.state.is_downloaded_verified = inner.state.downloaded_update.is_some();
            inner.state.current_state = UpdatesStateValue::Idle;
            inner.record(UpdateEvent::Launched {
                update_id: update.id().to_string(),
                is_emergency_launch,
            });
            Ok(())
        })
    }

    /// Seed a previously downloaded and verified update found at start-up.
    pub fn restore_downloaded(&self, update: Update) -> Result<()> {
        self.apply(|inner| {
            inner.require("restore_downloaded", &[UpdatesStateValue::Idle])?;
            if inner.state.launched_update_id.is_some() {
                return Err(UpdatesError::InvalidTransition {
                    from: "launched".to_string(),
                    operation: "restore_downloaded",
                });
            }
            let update_id = update.id().to_string();
            inner.state.downloaded_update = Some(update);
            inner.state.is_downloaded_verified = true;
            inner.state.current_state = UpdatesStateValue::Ready;
            inner.record(UpdateEvent::DownloadCompleted { update_id });
            Ok(())
        })
    }

    /// `Idle | NoUpdateAvailable → Checking`.
    ///
    /// After a failed download the machine first resets to `Idle`.
    pub fn begin_check(&self) -> Result<()> {
        self.apply(|inner| {
            if inner.state.current_state == UpdatesStateValue::DownloadError {
                inner.state.current_state = UpdatesStateValue::Idle;
                inner.state.download_progress = None;
                inner.record(UpdateEvent::Reset);
            }
            inner.require(
                "begin_check",
                &[UpdatesStateValue::Idle, UpdatesStateValue::NoUpdateAvailable],
            )?;
            inner.state.current_state = UpdatesStateValue::Checking;
            inner.state.check_error = None;
            inner.record(UpdateEvent::CheckStarted);
            Ok(())
        })
    }

    /// Evaluate a freshly fetched manifest. `Checking → UpdateAvailable |
    /// NoUpdateAvailable`.
    pub fn report_manifest(&self, manifest: Manifest) -> Result<UpdatesStateValue> {
        let runtime_version = self.runtime_version.clone();
        self.apply(move |inner| {
            inner.require("report_manifest", &[UpdatesStateValue::Checking])?;
            let id = manifest.id().to_string();

            if inner.rejected_manifests.contains(&id) {
                debug!(update_id = %id, "manifest previously rejected");
                let err = UpdatesError::RuntimeVersionMismatch {
                    expected: runtime_version.clone(),
                    actual: manifest.runtime_version().to_string(),
                };
                inner.settle_no_update(Some(ErrorInfo::from(&err)));
                return Ok(inner.state.current_state);
            }

            if let Err(err) = manifest.ensure_compatible(&runtime_version) {
                info!(update_id = %id, %err, "rejecting manifest");
                if inner.rejected_manifests.len() >= MAX_REJECTED_MANIFESTS {
                    inner.rejected_manifests.clear();
                }
                inner.rejected_manifests.insert(id);
                inner.settle_no_update(Some(ErrorInfo::from(&err)));
                return Ok(inner.state.current_state);
            }

            let already_known = inner.state.launched_update_id.as_deref() == Some(id.as_str())
                || inner.state.embedded_update.id() == id;
            if already_known {
                debug!(update_id = %id, "manifest matches running update");
                inner.settle_no_update(None);
                return Ok(inner.state.current_state);
            }

            info!(update_id = %id, "update available");
            inner.rejected_manifests.clear();
            inner.state.latest_manifest = Some(Arc::new(manifest));
            inner.state.current_state = UpdatesStateValue::UpdateAvailable;
            inner.record(UpdateEvent::ManifestResolved { update_id: id });
            Ok(inner.state.current_state)
        })
    }

    /// Apply a server directive received during `Checking`.
    pub fn report_directive(&self, directive: UpdateDirective) -> Result<UpdatesStateValue> {
        self.apply(|inner| {
            inner.require("report_directive", &[UpdatesStateValue::Checking])?;
            match directive {
                UpdateDirective::NoUpdateAvailable => inner.settle_no_update(None),
                UpdateDirective::RollBackToEmbedded { commit_time } => {
                    let embedded_id = inner.state.embedded_update.id().to_string();
                    if inner.state.launched_update_id.as_deref() == Some(embedded_id.as_str()) {
                        inner.settle_no_update(None);
                    } else {
                        info!(%commit_time, "rolling back to embedded update");
                        inner.state.latest_manifest = None;
                        inner.state.downloaded_update = None;
                        inner.state.is_downloaded_verified = false;
                        inner.state.rollback = Some(RollbackInfo::ToEmbedded {
                            commit_time: commit_time.clone(),
                        });
                        inner.state.current_state = UpdatesStateValue::Ready;
                        inner.record(UpdateEvent::RollBackToEmbedded { commit_time });
                    }
                }
            }
            Ok(inner.state.current_state)
        })
    }

    /// A check failed before a manifest could be evaluated.
    ///
    /// A malformed manifest counts as "no update" for this cycle; any other
    /// failure returns the machine to `Idle`.
    pub fn report_check_error(&self, err: &UpdatesError) -> Result<()> {
        self.apply(|inner| {
            inner.require("report_check_error", &[UpdatesStateValue::Checking])?;
            warn!(%err, "update check failed");
            let error = ErrorInfo::from(err);
            inner.state.check_error = Some(error.clone());
            inner.state.current_state = match err {
                UpdatesError::MalformedManifest(_) => UpdatesStateValue::NoUpdateAvailable,
                _ => UpdatesStateValue::Idle,
            };
            inner.record(UpdateEvent::CheckFailed { error });
            Ok(())
        })
    }

    /// `UpdateAvailable → Downloading`. Returns the manifest to download.
    pub fn begin_download(&self) -> Result<Arc<Manifest>> {
        self.apply(|inner| {
            inner.require("begin_download", &[UpdatesStateValue::UpdateAvailable])?;
            let manifest = inner.state.latest_manifest.clone().ok_or_else(|| {
                UpdatesError::InvalidTransition {
                    from: inner.state.current_state.to_string(),
                    operation: "begin_download",
                }
            })?;
            inner.state.current_state = UpdatesStateValue::Downloading;
            inner.state.download_error = None;
            inner.state.download_progress = Some(DownloadProgress {
                completed: 0,
                total: manifest.assets().len(),
            });
            inner.record(UpdateEvent::DownloadStarted {
                update_id: manifest.id().to_string(),
            });
            Ok(manifest)
        })
    }

    pub fn report_download_progress(&self, completed: usize, total: usize) -> Result<()> {
        self.apply(|inner| {
            inner.require("report_download_progress", &[UpdatesStateValue::Downloading])?;
            inner.state.download_progress = Some(DownloadProgress { completed, total });
            inner.record(UpdateEvent::DownloadProgress { completed, total });
            Ok(())
        })
    }

    /// `Downloading → Ready | DownloadError`.
    pub fn report_download_result(&self, result: Result<Update>) -> Result<()> {
        match result {
            Ok(update) => self.report_downloaded(update),
            Err(err) => self.report_download_error(&err),
        }
    }

    /// `Downloading → Ready`.
    pub fn report_downloaded(&self, update: Update) -> Result<()> {
        self.apply(|inner| {
            inner.require("report_download_result", &[UpdatesStateValue::Downloading])?;
            let update_id = update.id().to_string();
            info!(%update_id, "update downloaded");
            inner.state.downloaded_update = Some(update);
            inner.state.is_downloaded_verified = false;
            inner.state.rollback = None;
            inner.state.download_progress = None;
            inner.state.current_state = UpdatesStateValue::Ready;
            inner.record(UpdateEvent::DownloadCompleted { update_id });
            Ok(())
        })
    }

    /// `Downloading → DownloadError`.
    pub fn report_download_error(&self, err: &UpdatesError) -> Result<()> {
        self.apply(|inner| {
            inner.require("report_download_result", &[UpdatesStateValue::Downloading])?;
            warn!(%err, "update download failed");
            let error = ErrorInfo::from(err);
            inner.state.download_error = Some(error.clone());
            inner.state.current_state = UpdatesStateValue::DownloadError;
            inner.record(UpdateEvent::DownloadFailed { error });
            Ok(())
        })
    }

    /// Check the downloaded update against what `store` holds.
    ///
    /// Stays `Ready` when complete. Otherwise discards the downloaded
    /// update, moves to `RolledBack` and returns `AssetIntegrity`.
    pub fn verify_and_finalize(&self, store: &AssetStore) -> Result<()> {
        // The store only grows, so sampling it before locking is safe.
        let embedded = store.embedded_hashes();
        let available = store.cached_hashes();
        self.verify_against(&embedded, &available)
    }

    /// [`UpdatesStateMachine::verify_and_finalize`] with explicit hash sets.
    pub fn verify_against(
        &self,
        embedded: &HashSet<ContentHash>,
        available: &HashSet<ContentHash>,
    ) -> Result<()> {
        self.apply(|inner| {
            inner.require("verify_and_finalize", &[UpdatesStateValue::Ready])?;
            let Some(update) = inner.state.downloaded_update.clone() else {
                return Ok(());
            };
            let update_id = update.id().to_string();

            let mut missing: Vec<ContentHash> =
                missing_assets(update.manifest(), embedded, available)
                    .into_iter()
                    .map(|asset| asset.hash)
                    .collect();
            if missing.is_empty() {
                inner.state.is_downloaded_verified = true;
                inner.record(UpdateEvent::VerificationSucceeded { update_id });
                return Ok(());
            }

            missing.sort();
            missing.dedup();
            warn!(%update_id, missing = missing.len(), "downloaded update incomplete, rolling back");
            inner.state.downloaded_update = None;
            inner.state.is_downloaded_verified = false;
            inner.state.rollback = Some(RollbackInfo::IntegrityFailure {
                update_id: update_id.clone(),
                missing: missing.clone(),
            });
            inner.state.current_state = UpdatesStateValue::RolledBack;
            inner.record(UpdateEvent::VerificationFailed {
                update_id,
                missing: missing.clone(),
            });
            Err(UpdatesError::AssetIntegrity { missing })
        })
    }

    /// `Ready → Restarting`.
    pub fn request_restart(&self) -> Result<()> {
        self.apply(|inner| {
            inner.require("request_restart", &[UpdatesStateValue::Ready])?;
            inner.state.current_state = UpdatesStateValue::Restarting;
            inner.record(UpdateEvent::Restarting);
            Ok(())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn manifest(id: &str, runtime_version: &str, assets: &[&[u8]]) -> Manifest {
        let others: Vec<Value> = assets
            .iter()
            .enumerate()
            .map(|(index, content)| {
                json!({
                    "hash": ContentHash::of(content).as_str(),
                    "key": format!("asset-{index}"),
                    "contentType": "image/png"
                })
            })
            .collect();
        Manifest::from_value(json!({
            "id": id,
            "runtimeVersion": runtime_version,
            "launchAsset": { "hash": ContentHash::of(id.as_bytes()).as_str(), "key": "bundle" },
            "assets": others
        }))
        .unwrap()
    }

    fn machine() -> UpdatesStateMachine {
        let embedded = Update::embedded(manifest("embedded", "1.0.0", &[]));
        UpdatesStateMachine::new("1.0.0", embedded, CheckAutomatically::OnLaunch)
    }

    fn hashes(contents: &[&[u8]]) -> HashSet<ContentHash> {
        contents.iter().map(|content| ContentHash::of(content)).collect()
    }

    fn collect_events(machine: &UpdatesStateMachine) -> Arc<Mutex<Vec<StateChange>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        machine.subscribe(move |change| {
            sink.lock().unwrap().push(change.clone());
            Ok(())
        });
        log
    }

    fn drive_to_ready(machine: &UpdatesStateMachine, candidate: Manifest) {
        machine.begin_check().unwrap();
        assert_eq!(
            machine.report_manifest(candidate).unwrap(),
            UpdatesStateValue::UpdateAvailable
        );
        let manifest = machine.begin_download().unwrap();
        machine
            .report_download_result(Ok(Update::downloaded((*manifest).clone())))
            .unwrap();
    }

    #[test]
    fn test_happy_path_emits_each_transition() {
        let machine = machine();
        let log = collect_events(&machine);

        drive_to_ready(&machine, manifest("u1", "1.0.0", &[b"icon"]));
        let embedded = HashSet::new();
        machine
            .verify_against(&embedded, &hashes(&[b"u1", b"icon"]))
            .unwrap();
        machine.request_restart().unwrap();

        let log = log.lock().unwrap();
        let states: Vec<_> = log.iter().map(|c| c.state.current_state).collect();
        assert_eq!(
            states,
            vec![
                UpdatesStateValue::Checking,
                UpdatesStateValue::UpdateAvailable,
                UpdatesStateValue::Downloading,
                UpdatesStateValue::Ready,
                UpdatesStateValue::Ready,
                UpdatesStateValue::Restarting,
            ]
        );
        assert!(matches!(log[4].event, UpdateEvent::VerificationSucceeded { .. }));
        let sequences: Vec<_> = log.iter().map(|c| c.state.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_runtime_mismatch_is_no_update() {
        let machine = machine();
        machine.begin_check().unwrap();

        let state = machine
            .report_manifest(manifest("u2", "2.0.0", &[]))
            .unwrap();
        assert_eq!(state, UpdatesStateValue::NoUpdateAvailable);
        assert!(machine.state().latest_manifest.is_none());

        // Remembered on the next cycle as well.
        machine.begin_check().unwrap();
        let state = machine
            .report_manifest(manifest("u2", "2.0.0", &[]))
            .unwrap();
        assert_eq!(state, UpdatesStateValue::NoUpdateAvailable);
    }

    #[test]
    fn test_known_update_is_no_update() {
        let machine = machine();
        machine.begin_check().unwrap();
        let state = machine
            .report_manifest(manifest("embedded", "1.0.0", &[]))
            .unwrap();
        assert_eq!(state, UpdatesStateValue::NoUpdateAvailable);
    }

    #[test]
    fn test_concurrent_begin_check_admits_one() {
        let machine = Arc::new(machine());
        let successes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let machine = Arc::clone(&machine);
                let successes = Arc::clone(&successes);
                thread::spawn(move || {
                    match machine.begin_check() {
                        Ok(()) => {
                            successes.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => assert!(matches!(err, UpdatesError::InvalidTransition { .. })),
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(machine.current(), UpdatesStateValue::Checking);
    }

    #[test]
    fn test_invalid_transition_leaves_state_untouched() {
        let machine = machine();
        let log = collect_events(&machine);

        let err = machine.begin_download().unwrap_err();
        assert!(matches!(
            err,
            UpdatesError::InvalidTransition { operation: "begin_download", .. }
        ));
        assert!(machine.request_restart().is_err());
        assert!(machine.report_manifest(manifest("u1", "1.0.0", &[])).is_err());
        assert_eq!(machine.current(), UpdatesStateValue::Idle);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_assets_roll_back() {
        let machine = machine();
        drive_to_ready(&machine, manifest("u1", "1.0.0", &[b"icon", b"font"]));

        let err = machine
            .verify_against(&HashSet::new(), &hashes(&[b"u1", b"icon"]))
            .unwrap_err();
        match err {
            UpdatesError::AssetIntegrity { missing } => {
                assert_eq!(missing, vec![ContentHash::of(b"font")]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let state = machine.state();
        assert_eq!(state.current_state, UpdatesStateValue::RolledBack);
        assert!(state.downloaded_update.is_none());
        assert!(matches!(
            state.rollback,
            Some(RollbackInfo::IntegrityFailure { ref update_id, .. }) if update_id == "u1"
        ));
        // Terminal for this process.
        assert!(machine.begin_check().is_err());
    }

    #[test]
    fn test_download_error_recovers_on_next_check() {
        let machine = machine();
        machine.begin_check().unwrap();
        machine
            .report_manifest(manifest("u1", "1.0.0", &[]))
            .unwrap();
        machine.begin_download().unwrap();
        machine
            .report_download_result(Err(UpdatesError::Cancelled))
            .unwrap();

        let state = machine.state();
        assert_eq!(state.current_state, UpdatesStateValue::DownloadError);
        assert_eq!(state.download_error.as_ref().unwrap().kind, "cancelled");

        let log = collect_events(&machine);
        machine.begin_check().unwrap();
        let events: Vec<_> = log.lock().unwrap().iter().map(|c| c.event.clone()).collect();
        assert_eq!(events, vec![UpdateEvent::Reset, UpdateEvent::CheckStarted]);
    }

    #[test]
    fn test_check_errors() {
        let machine = machine();
        machine.begin_check().unwrap();
        machine
            .report_check_error(&UpdatesError::ManifestFetch("offline".into()))
            .unwrap();
        let state = machine.state();
        assert_eq!(state.current_state, UpdatesStateValue::Idle);
        assert_eq!(state.check_error.unwrap().kind, "manifest_fetch");

        machine.begin_check().unwrap();
        assert!(machine.state().check_error.is_none());
        machine
            .report_check_error(&UpdatesError::malformed("missing `id`"))
            .unwrap();
        assert_eq!(machine.current(), UpdatesStateValue::NoUpdateAvailable);
    }

    #[test]
    fn test_rollback_directive() {
        let machine = machine();
        machine.mark_launched(&Update::downloaded(manifest("u1", "1.0.0", &[])), false).unwrap();
        machine.begin_check().unwrap();

        let state = machine
            .report_directive(UpdateDirective::RollBackToEmbedded {
                commit_time: "2024-01-01T00:00:00Z".into(),
            })
            .unwrap();
        assert_eq!(state, UpdatesStateValue::Ready);
        let snapshot = machine.state();
        assert!(snapshot.downloaded_update.is_none());
        assert!(matches!(snapshot.rollback, Some(RollbackInfo::ToEmbedded { .. })));
        machine.verify_against(&HashSet::new(), &HashSet::new()).unwrap();
    }

    #[test]
    fn test_rollback_directive_noop_when_running_embedded() {
        let machine = machine();
        let embedded = machine.state().embedded_update;
        machine.mark_launched(&embedded, false).unwrap();
        machine.begin_check().unwrap();
        let state = machine
            .report_directive(UpdateDirective::RollBackToEmbedded {
                commit_time: "2024-01-01T00:00:00Z".into(),
            })
            .unwrap();
        assert_eq!(state, UpdatesStateValue::NoUpdateAvailable);
        assert!(machine.mark_launched(&embedded, false).is_err());
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let machine = machine();
        let before = machine.state();
        machine.begin_check().unwrap();
        assert_eq!(before.current_state, UpdatesStateValue::Idle);
        assert_eq!(before.sequence, 0);
    }

    #[test]
    fn test_listener_may_read_state() {
        let machine = Arc::new(machine());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reader = Arc::clone(&machine);
        let sink = Arc::clone(&seen);
        machine.subscribe(move |change| {
            assert_eq!(reader.current(), change.state.current_state);
            sink.lock().unwrap().push(change.state.current_state);
            Ok(())
        });

        machine.begin_check().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![UpdatesStateValue::Checking]);
    }

    #[test]
    fn test_reading_listener_with_concurrent_transition() {
        use std::sync::mpsc;
        use std::time::Duration;

        let machine = Arc::new(machine());
        let reader = Arc::clone(&machine);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        machine.subscribe(move |change| {
            if change.event == UpdateEvent::CheckStarted {
                thread::sleep(Duration::from_millis(200));
            }
            // Reads the machine while another thread is mid-transition.
            reader.current();
            sink.lock().unwrap().push(change.state.sequence);
            Ok(())
        });

        let (done, finished) = mpsc::channel();
        let first = {
            let machine = Arc::clone(&machine);
            let done = done.clone();
            thread::spawn(move || {
                machine.begin_check().unwrap();
                done.send(()).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        let second = {
            let machine = Arc::clone(&machine);
            thread::spawn(move || {
                machine
                    .report_manifest(manifest("u1", "1.0.0", &[]))
                    .unwrap();
                done.send(()).unwrap();
            })
        };

        for _ in 0..2 {
            finished
                .recv_timeout(Duration::from_secs(5))
                .expect("transitions completed");
        }
        first.join().unwrap();
        second.join().unwrap();

        assert_eq!(machine.current(), UpdatesStateValue::UpdateAvailable);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_rejected_manifest_memory_is_bounded() {
        let machine = machine();
        for index in 0..(MAX_REJECTED_MANIFESTS * 2) {
            machine.begin_check().unwrap();
            machine
                .report_manifest(manifest(&format!("mismatch-{index}"), "2.0.0", &[]))
                .unwrap();
            assert!(lock(&machine.inner).rejected_manifests.len() <= MAX_REJECTED_MANIFESTS);
        }

        machine.begin_check().unwrap();
        machine
            .report_manifest(manifest("u1", "1.0.0", &[]))
            .unwrap();
        assert!(lock(&machine.inner).rejected_manifests.is_empty());
    }

    #[test]
    fn test_failing_listener_does_not_block_transition() {
        let machine = machine();
        machine.subscribe(|_| anyhow::bail!("listener broke"));
        let log = collect_events(&machine);

        machine.begin_check().unwrap();
        assert_eq!(machine.current(), UpdatesStateValue::Checking);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_event_payload() {
        let machine = machine();
        machine.begin_check().unwrap();
        machine
            .report_manifest(manifest("u1", "1.0.0", &[]))
            .unwrap();

        let payload = machine.state().to_event_payload();
        assert_eq!(payload["state"], "update_available");
        assert_eq!(payload["isUpdateAvailable"], true);
        assert_eq!(payload["latestManifest"]["id"], "u1");
        assert_eq!(payload["embeddedUpdateId"], "embedded");
        assert_eq!(payload["checkAutomatically"], "ON_LAUNCH");
        assert_eq!(payload["sequence"], 2);
    }
}
