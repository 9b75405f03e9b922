//! Over-the-air update resolution with asset integrity checks.
//!
//! An application ships with an embedded update (a manifest plus its
//! assets). This crate decides whether a server-published manifest is
//! compatible with the running binary, downloads the assets it does not
//! already hold into a content-addressed cache, verifies that every asset
//! resolves, and picks which update to boot. All progress flows through a
//! single [`UpdatesStateMachine`] whose transitions are broadcast to
//! subscribers.
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use updates::{HttpFetcher, Manifest, UpdatesConfig, UpdatesController, UpdatesStateValue};
//!
//! # async fn demo(embedded: Manifest, blobs: Vec<bytes::Bytes>) -> updates::Result<()> {
//! let config = UpdatesConfig::new("1.0.0")
//!     .manifest_url("https://u.example.com/manifest")
//!     .request_header("expo-channel-name", "main");
//! let fetcher = HttpFetcher::from_config(&config)?;
//! let controller = UpdatesController::start(config, embedded, blobs, fetcher)?;
//!
//! controller.machine().subscribe(|change| {
//!     println!("{} -> {}", change.state.sequence, change.state.current_state);
//!     Ok(())
//! });
//!
//! if controller.check_for_update().await? == UpdatesStateValue::UpdateAvailable {
//!     controller.download_update(&CancellationToken::new()).await?;
//!     controller.request_restart()?;
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod controller;
mod error;
mod fetcher;
mod launch;
mod loader;
mod manifest;
mod state;
mod store;
mod subscription;
mod verify;

pub use config::{CheckAutomatically, UpdatesConfig};
pub use controller::UpdatesController;
pub use error::{Result, UpdatesError};
pub use fetcher::{AssetFetcher, HttpFetcher, HttpFetcherBuilder, ManifestFetcher};
pub use launch::{launch, select_launchable, unresolved_assets, LaunchDecision};
pub use loader::{Loader, ManifestResponse};
pub use manifest::{
    is_compatible, AssetRef, ContentHash, Manifest, RouteInfo, RoutesManifest, Update,
    UpdateDirective, UpdateSource,
};
pub use state::{
    DownloadProgress, ErrorInfo, RollbackInfo, StateChange, UpdateEvent, UpdateState,
    UpdatesStateMachine, UpdatesStateValue,
};
pub use store::{AssetStore, ResolvedAsset};
pub use subscription::{EmitOutcome, SubscriptionId, SubscriptionRegistry};
pub use verify::{
    missing_assets, missing_refs, verify_export, MissingAsset, Platform, VerificationReport,
};
