use crate::error::{Result, UpdatesError};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// SHA-256 content digest, stored as lowercase hex.
///
/// Two assets with equal hashes are interchangeable regardless of the
/// manifest or key that referenced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute the digest of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        ContentHash(hex::encode(Sha256::digest(bytes)))
    }

    /// Stream a file through the hasher.
    pub fn of_file(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(ContentHash(hex::encode(hasher.finalize())))
    }

    /// Parse a digest in hex (64 chars) or unpadded base64url (43 chars) form.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(ContentHash(raw.to_ascii_lowercase()));
        }
        if raw.len() == 43 {
            if let Ok(bytes) = general_purpose::URL_SAFE_NO_PAD.decode(raw) {
                if bytes.len() == 32 {
                    return Ok(ContentHash(hex::encode(bytes)));
                }
            }
        }
        Err(UpdatesError::malformed(format!(
            "`{raw}` is not a sha-256 digest"
        )))
    }

    /// Hex form of the digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unpadded base64url form, as written by modern manifests.
    pub fn to_base64url(&self) -> String {
        // The inner string is always valid hex of 32 bytes.
        let bytes = hex::decode(&self.0).unwrap_or_default();
        general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = UpdatesError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = UpdatesError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// One asset referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    pub hash: ContentHash,
    pub key: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub is_launch_asset: bool,
}

/// Normalized update descriptor. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    id: String,
    runtime_version: String,
    created_at: Option<String>,
    launch_asset: AssetRef,
    assets: Vec<AssetRef>,
    metadata: Map<String, Value>,
    extra: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAsset {
    hash: Option<String>,
    key: Option<String>,
    #[serde(alias = "type")]
    content_type: Option<String>,
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModernManifest {
    id: Option<String>,
    runtime_version: Option<String>,
    created_at: Option<String>,
    launch_asset: RawAsset,
    assets: Option<Vec<RawAsset>>,
    #[serde(default)]
    metadata: Map<String, Value>,
    extra: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyManifest {
    #[serde(alias = "releaseId")]
    id: Option<String>,
    runtime_version: Option<String>,
    commit_time: Option<String>,
    bundle_key: Option<String>,
    bundle_hash: Option<String>,
    bundle_url: Option<String>,
    bundled_assets: Option<Vec<RawAsset>>,
    #[serde(default)]
    metadata: Map<String, Value>,
    extra: Option<Map<String, Value>>,
}

impl RawAsset {
    fn normalize(self, is_launch_asset: bool, default_type: &str) -> Result<AssetRef> {
        let hash = self
            .hash
            .ok_or_else(|| UpdatesError::malformed("asset is missing `hash`"))?;
        let key = self
            .key
            .ok_or_else(|| UpdatesError::malformed(format!("asset {hash} is missing `key`")))?;
        Ok(AssetRef {
            hash: ContentHash::parse(&hash)?,
            key,
            content_type: self.content_type.unwrap_or_else(|| default_type.to_string()),
            url: self.url,
            is_launch_asset,
        })
    }
}

const LAUNCH_ASSET_TYPE: &str = "application/javascript";
const DEFAULT_ASSET_TYPE: &str = "application/octet-stream";

impl Manifest {
    /// Parse a raw JSON payload in either the modern or the legacy shape.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|err| UpdatesError::malformed(format!("invalid json: {err}")))?;
        Self::from_value(value)
    }

    /// Normalize an already-decoded JSON document.
    pub fn from_value(value: Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| UpdatesError::malformed("manifest must be a json object"))?;

        if object.contains_key("launchAsset") {
            let raw: ModernManifest = serde_json::from_value(value)
                .map_err(|err| UpdatesError::malformed(err.to_string()))?;
            Self::from_modern(raw)
        } else if object.contains_key("bundleKey") || object.contains_key("bundledAssets") {
            let raw: LegacyManifest = serde_json::from_value(value)
                .map_err(|err| UpdatesError::malformed(err.to_string()))?;
            Self::from_legacy(raw)
        } else {
            Err(UpdatesError::malformed(
                "manifest has neither `launchAsset` nor `bundleKey`",
            ))
        }
    }

    fn from_modern(raw: ModernManifest) -> Result<Self> {
        let id = required(raw.id, "id")?;
        let runtime_version = required(raw.runtime_version, "runtimeVersion")?;
        let assets = raw
            .assets
            .ok_or_else(|| UpdatesError::malformed("manifest is missing `assets`"))?;
        let launch_asset = raw.launch_asset.normalize(true, LAUNCH_ASSET_TYPE)?;
        let assets = assets
            .into_iter()
            .map(|asset| asset.normalize(false, DEFAULT_ASSET_TYPE))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::assemble(
            id,
            runtime_version,
            raw.created_at,
            launch_asset,
            assets,
            raw.metadata,
            raw.extra,
        ))
    }

    fn from_legacy(raw: LegacyManifest) -> Result<Self> {
        let id = required(raw.id, "id")?;
        let runtime_version = required(raw.runtime_version, "runtimeVersion")?;
        let launch_asset = RawAsset {
            hash: raw.bundle_hash,
            key: raw.bundle_key,
            content_type: None,
            url: raw.bundle_url,
        }
        .normalize(true, LAUNCH_ASSET_TYPE)?;
        let assets = raw
            .bundled_assets
            .ok_or_else(|| UpdatesError::malformed("manifest is missing `bundledAssets`"))?
            .into_iter()
            .map(|asset| asset.normalize(false, DEFAULT_ASSET_TYPE))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::assemble(
            id,
            runtime_version,
            raw.commit_time,
            launch_asset,
            assets,
            raw.metadata,
            raw.extra,
        ))
    }

    fn assemble(
        id: String,
        runtime_version: String,
        created_at: Option<String>,
        launch_asset: AssetRef,
        others: Vec<AssetRef>,
        metadata: Map<String, Value>,
        extra: Option<Map<String, Value>>,
    ) -> Self {
        let mut assets = Vec::with_capacity(others.len() + 1);
        assets.push(launch_asset.clone());
        for asset in others {
            if !assets
                .iter()
                .any(|known| known.hash == asset.hash && known.key == asset.key)
            {
                assets.push(asset);
            }
        }
        Self {
            id,
            runtime_version,
            created_at,
            launch_asset,
            assets,
            metadata,
            extra,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    pub fn created_at(&self) -> Option<&str> {
        self.created_at.as_deref()
    }

    pub fn launch_asset(&self) -> &AssetRef {
        &self.launch_asset
    }

    /// Every asset the update needs, launch asset included.
    pub fn assets(&self) -> &[AssetRef] {
        &self.assets
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn extra(&self) -> Option<&Map<String, Value>> {
        self.extra.as_ref()
    }

    /// Exact runtime version gate.
    pub fn is_compatible(&self, client_runtime_version: &str) -> bool {
        is_compatible(self, client_runtime_version)
    }

    /// Like [`Manifest::is_compatible`] but reports the mismatch.
    pub fn ensure_compatible(&self, client_runtime_version: &str) -> Result<()> {
        if self.is_compatible(client_runtime_version) {
            Ok(())
        } else {
            Err(UpdatesError::RuntimeVersionMismatch {
                expected: client_runtime_version.to_string(),
                actual: self.runtime_version.clone(),
            })
        }
    }

    /// Render in the modern shape. [`Manifest::from_value`] accepts the output.
    pub fn to_value(&self) -> Value {
        let others: Vec<Value> = self
            .assets
            .iter()
            .filter(|asset| !asset.is_launch_asset)
            .map(asset_value)
            .collect();
        let mut value = json!({
            "id": self.id,
            "runtimeVersion": self.runtime_version,
            "launchAsset": asset_value(&self.launch_asset),
            "assets": others,
            "metadata": self.metadata,
        });
        if let Some(object) = value.as_object_mut() {
            if let Some(created_at) = &self.created_at {
                object.insert("createdAt".into(), Value::String(created_at.clone()));
            }
            if let Some(extra) = &self.extra {
                object.insert("extra".into(), Value::Object(extra.clone()));
            }
        }
        value
    }
}

fn asset_value(asset: &AssetRef) -> Value {
    let mut value = json!({
        "hash": asset.hash.as_str(),
        "key": asset.key,
        "contentType": asset.content_type,
    });
    if let (Some(url), Some(object)) = (&asset.url, value.as_object_mut()) {
        object.insert("url".into(), Value::String(url.clone()));
    }
    value
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(UpdatesError::malformed(format!(
            "manifest is missing `{name}`"
        ))),
    }
}

/// Exact string equality between the manifest runtime and the client runtime.
pub fn is_compatible(manifest: &Manifest, client_runtime_version: &str) -> bool {
    manifest.runtime_version == client_runtime_version
}

/// Where an [`Update`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Embedded,
    Downloaded,
}

/// A resolved update the state machine reasons about. Never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    manifest: Arc<Manifest>,
    source: UpdateSource,
}

impl Update {
    pub fn new(manifest: Manifest, source: UpdateSource) -> Self {
        Self {
            manifest: Arc::new(manifest),
            source,
        }
    }

    pub fn embedded(manifest: Manifest) -> Self {
        Self::new(manifest, UpdateSource::Embedded)
    }

    pub fn downloaded(manifest: Manifest) -> Self {
        Self::new(manifest, UpdateSource::Downloaded)
    }

    pub fn id(&self) -> &str {
        self.manifest.id()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn shared_manifest(&self) -> Arc<Manifest> {
        Arc::clone(&self.manifest)
    }

    pub fn source(&self) -> UpdateSource {
        self.source
    }

    pub fn is_embedded(&self) -> bool {
        self.source == UpdateSource::Embedded
    }
}

/// Server instruction delivered instead of, or alongside, a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "camelCase")]
pub enum UpdateDirective {
    NoUpdateAvailable,
    #[serde(rename_all = "camelCase")]
    RollBackToEmbedded { commit_time: String },
}

impl UpdateDirective {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|err| UpdatesError::malformed(format!("invalid directive: {err}")))
    }
}

/// Route tables carried by the serving variant of the manifest.
///
/// Consumed only; nothing in this crate produces one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutesManifest {
    #[serde(default)]
    pub api_routes: Vec<RouteInfo>,
    #[serde(default)]
    pub html_routes: Vec<RouteInfo>,
    #[serde(default)]
    pub redirects: Vec<RouteInfo>,
    #[serde(default)]
    pub rewrites: Vec<RouteInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub file: String,
    pub page: String,
    pub named_regex: String,
    #[serde(default)]
    pub route_keys: Map<String, Value>,
}

impl RoutesManifest {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_hex(seed: &[u8]) -> String {
        ContentHash::of(seed).to_string()
    }

    fn modern_json() -> Value {
        json!({
            "id": "0754dad0-d200-4634-8f7a-0e3b5c4b7d0c",
            "createdAt": "2023-01-01T00:00:00.000Z",
            "runtimeVersion": "1.0.0",
            "launchAsset": {
                "hash": ContentHash::of(b"bundle").to_base64url(),
                "key": "bundle",
                "contentType": "application/javascript",
                "url": "https://example.com/bundle.js"
            },
            "assets": [
                { "hash": hash_hex(b"icon"), "key": "icon", "contentType": "image/png" },
                { "hash": hash_hex(b"font"), "key": "font", "contentType": "font/ttf" }
            ],
            "metadata": { "branch": "main" },
            "extra": { "scopeKey": "@owner/app" }
        })
    }

    #[test]
    fn test_hash_forms_normalize() {
        let hash = ContentHash::of(b"hello world");
        assert_eq!(
            hash.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let from_b64 = ContentHash::parse(&hash.to_base64url()).unwrap();
        let from_upper = ContentHash::parse(&hash.as_str().to_uppercase()).unwrap();
        assert_eq!(from_b64, hash);
        assert_eq!(from_upper, hash);
        assert!(ContentHash::parse("not-a-digest").is_err());
        assert!(ContentHash::parse(&"g".repeat(64)).is_err());
    }

    #[test]
    fn test_parse_modern_manifest() {
        let raw = serde_json::to_vec(&modern_json()).unwrap();
        let manifest = Manifest::parse(&raw).unwrap();

        assert_eq!(manifest.id(), "0754dad0-d200-4634-8f7a-0e3b5c4b7d0c");
        assert_eq!(manifest.runtime_version(), "1.0.0");
        assert_eq!(manifest.created_at(), Some("2023-01-01T00:00:00.000Z"));
        assert_eq!(manifest.assets().len(), 3);
        assert!(manifest.launch_asset().is_launch_asset);
        assert_eq!(manifest.launch_asset().hash, ContentHash::of(b"bundle"));
        assert_eq!(manifest.metadata()["branch"], "main");
        assert_eq!(manifest.extra().unwrap()["scopeKey"], "@owner/app");
        assert_eq!(
            manifest.assets().iter().filter(|a| a.is_launch_asset).count(),
            1
        );
    }

    #[test]
    fn test_parse_legacy_manifest() {
        let raw = json!({
            "releaseId": "legacy-1",
            "runtimeVersion": "1.0.0",
            "commitTime": "2020-01-01T00:00:00.000Z",
            "bundleKey": "bundle-key",
            "bundleHash": hash_hex(b"bundle"),
            "bundledAssets": [
                { "hash": hash_hex(b"icon"), "key": "icon", "type": "image/png" }
            ]
        });
        let manifest = Manifest::from_value(raw).unwrap();

        assert_eq!(manifest.id(), "legacy-1");
        assert_eq!(manifest.launch_asset().key, "bundle-key");
        assert_eq!(manifest.assets().len(), 2);
        assert_eq!(manifest.assets()[1].content_type, "image/png");
    }

    #[test]
    fn test_missing_required_fields_are_malformed() {
        for field in ["id", "runtimeVersion", "assets"] {
            let mut raw = modern_json();
            raw.as_object_mut().unwrap().remove(field);
            let err = Manifest::from_value(raw).unwrap_err();
            assert!(
                matches!(err, UpdatesError::MalformedManifest(ref msg) if msg.contains(field)),
                "field {field}: {err}"
            );
        }

        let mut raw = modern_json();
        raw["assets"][0]["hash"] = json!("abc");
        assert!(matches!(
            Manifest::from_value(raw),
            Err(UpdatesError::MalformedManifest(_))
        ));

        assert!(Manifest::parse(b"[1, 2]").is_err());
        assert!(Manifest::parse(b"{").is_err());
    }

    #[test]
    fn test_runtime_version_gate_is_exact() {
        let manifest = Manifest::from_value(modern_json()).unwrap();
        assert!(is_compatible(&manifest, "1.0.0"));
        assert!(!is_compatible(&manifest, "1.0"));
        assert!(!is_compatible(&manifest, "1.0.1"));
        assert!(matches!(
            manifest.ensure_compatible("2.0.0"),
            Err(UpdatesError::RuntimeVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_to_value_reparses_identically() {
        let manifest = Manifest::from_value(modern_json()).unwrap();
        let reparsed = Manifest::from_value(manifest.to_value()).unwrap();
        assert_eq!(reparsed, manifest);
    }

    #[test]
    fn test_parse_directives() {
        let directive = UpdateDirective::parse(
            br#"{"type":"rollBackToEmbedded","parameters":{"commitTime":"2023-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(
            directive,
            UpdateDirective::RollBackToEmbedded {
                commit_time: "2023-01-01T00:00:00Z".into()
            }
        );
        assert_eq!(
            UpdateDirective::parse(br#"{"type":"noUpdateAvailable"}"#).unwrap(),
            UpdateDirective::NoUpdateAvailable
        );
    }

    #[test]
    fn test_parse_routes_manifest() {
        let routes = RoutesManifest::parse(
            br#"{
                "apiRoutes": [{"file":"api/hello+api.js","page":"/api/hello","namedRegex":"^/api/hello(?:/)?$","routeKeys":{}}],
                "htmlRoutes": [{"file":"index.tsx","page":"/index","namedRegex":"^/(?:/)?$"}]
            }"#,
        )
        .unwrap();
        assert_eq!(routes.api_routes.len(), 1);
        assert_eq!(routes.html_routes[0].page, "/index");
        assert!(routes.redirects.is_empty());
    }
}
