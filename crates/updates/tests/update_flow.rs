use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use updates::{
    AssetFetcher, AssetRef, ContentHash, Manifest, ManifestFetcher, UpdateEvent, UpdatesConfig,
    UpdatesController, UpdatesError, UpdatesStateValue,
};

/// Serves one canned manifest response and a fixed set of assets by key.
#[derive(Default)]
struct StaticServer {
    response: Option<Value>,
    assets: HashMap<String, Bytes>,
}

impl StaticServer {
    fn responding(response: Value) -> Self {
        Self {
            response: Some(response),
            assets: HashMap::new(),
        }
    }

    fn with_asset(mut self, key: &str, bytes: &'static [u8]) -> Self {
        self.assets.insert(key.into(), Bytes::from_static(bytes));
        self
    }
}

#[async_trait]
impl ManifestFetcher for StaticServer {
    async fn fetch_manifest(&self) -> updates::Result<Bytes> {
        match &self.response {
            Some(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
            None => Err(UpdatesError::ManifestFetch("connection refused".into())),
        }
    }
}

#[async_trait]
impl AssetFetcher for StaticServer {
    async fn fetch_asset(&self, asset: &AssetRef) -> updates::Result<Bytes> {
        self.assets
            .get(&asset.key)
            .cloned()
            .ok_or_else(|| UpdatesError::ManifestFetch(format!("404 {}", asset.key)))
    }
}

fn embedded_manifest() -> Manifest {
    Manifest::from_value(json!({
        "id": "embedded-1",
        "runtimeVersion": "1.0.0",
        "launchAsset": { "hash": ContentHash::of(b"bundle v1").as_str(), "key": "bundle.js" },
        "assets": [{ "hash": ContentHash::of(b"logo").as_str(), "key": "logo.png" }]
    }))
    .expect("embedded manifest parses")
}

fn published_manifest() -> Value {
    json!({
        "id": "release-2",
        "createdAt": "2024-05-01T12:00:00.000Z",
        "runtimeVersion": "1.0.0",
        "launchAsset": {
            "hash": ContentHash::of(b"bundle v2").to_base64url(),
            "key": "bundle.js",
            "contentType": "application/javascript",
            "url": "bundles/bundle.js"
        },
        "assets": [
            { "hash": ContentHash::of(b"logo").as_str(), "key": "logo.png", "url": "assets/logo.png" },
            { "hash": ContentHash::of(b"splash").as_str(), "key": "splash.png", "url": "assets/splash.png" }
        ]
    })
}

fn start(dir: &Path, server: StaticServer) -> updates::Result<UpdatesController<StaticServer>> {
    UpdatesController::start(
        UpdatesConfig::new("1.0.0").updates_dir(dir),
        embedded_manifest(),
        [Bytes::from_static(b"bundle v1"), Bytes::from_static(b"logo")],
        server,
    )
}

#[tokio::test]
async fn test_update_is_downloaded_and_launched_next_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = StaticServer::responding(published_manifest())
        .with_asset("bundle.js", b"bundle v2")
        .with_asset("splash.png", b"splash");

    let controller = start(dir.path(), server)?;
    assert_eq!(controller.launched().update.id(), "embedded-1");

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    controller.machine().subscribe(move |change| {
        sink.lock().unwrap().push(change.event.clone());
        Ok(())
    });

    assert_eq!(
        controller.check_for_update().await?,
        UpdatesStateValue::UpdateAvailable
    );
    let update = controller.download_update(&CancellationToken::new()).await?;
    assert_eq!(update.id(), "release-2");
    controller.request_restart()?;
    assert_eq!(controller.machine().current(), UpdatesStateValue::Restarting);

    {
        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&UpdateEvent::CheckStarted));
        assert!(events.contains(&UpdateEvent::VerificationSucceeded {
            update_id: "release-2".into()
        }));
        assert_eq!(events.last(), Some(&UpdateEvent::Restarting));
    }
    drop(controller);

    // Next process: the recorded update boots from the cache.
    let controller = start(dir.path(), StaticServer::default())?;
    assert_eq!(controller.launched().update.id(), "release-2");
    assert!(!controller.launched().is_emergency_launch);
    let state = controller.state();
    assert_eq!(state.launched_update_id.as_deref(), Some("release-2"));
    assert_eq!(state.current_state, UpdatesStateValue::Idle);

    // The same manifest is no longer news.
    let controller = start(dir.path(), StaticServer::responding(published_manifest()))?;
    assert_eq!(
        controller.check_for_update().await?,
        UpdatesStateValue::NoUpdateAvailable
    );
    Ok(())
}

#[tokio::test]
async fn test_rollback_directive_returns_to_embedded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = StaticServer::responding(published_manifest())
        .with_asset("bundle.js", b"bundle v2")
        .with_asset("splash.png", b"splash");
    let controller = start(dir.path(), server)?;
    controller.check_for_update().await?;
    controller.download_update(&CancellationToken::new()).await?;
    drop(controller);

    let directive = json!({
        "type": "rollBackToEmbedded",
        "parameters": { "commitTime": "2024-06-01T00:00:00.000Z" }
    });
    let controller = start(dir.path(), StaticServer::responding(directive))?;
    assert_eq!(controller.launched().update.id(), "release-2");
    assert_eq!(controller.check_for_update().await?, UpdatesStateValue::Ready);
    assert!(controller.state().downloaded_update.is_none());
    assert_eq!(updates::select_launchable(&controller.state()).id(), "embedded-1");
    drop(controller);

    let controller = start(dir.path(), StaticServer::default())?;
    assert_eq!(controller.launched().update.id(), "embedded-1");
    assert!(!controller.launched().is_emergency_launch);
    Ok(())
}

#[tokio::test]
async fn test_failed_asset_download_keeps_embedded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // The splash screen is never served.
    let server = StaticServer::responding(published_manifest()).with_asset("bundle.js", b"bundle v2");
    let controller = start(dir.path(), server)?;

    controller.check_for_update().await?;
    let err = controller
        .download_update(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, UpdatesError::ManifestFetch(_)));
    assert!(err.is_recoverable());
    assert_eq!(
        controller.machine().current(),
        UpdatesStateValue::DownloadError
    );
    drop(controller);

    let controller = start(dir.path(), StaticServer::default())?;
    assert_eq!(controller.launched().update.id(), "embedded-1");
    Ok(())
}
