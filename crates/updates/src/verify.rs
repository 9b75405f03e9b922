//! Asset integrity reconciliation.
//!
//! [`missing_assets`] is the pure core: given what a manifest needs and the
//! hashes two sources can provide, it reports what neither provides.
//! [`verify_export`] applies it to an export directory and a native build.

use crate::error::{Result, UpdatesError};
use crate::manifest::{AssetRef, ContentHash, Manifest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Assets of `manifest` whose hash is in neither `embedded` nor `available`.
///
/// Pure and deterministic. An empty result means every asset hash of the
/// manifest is a member of `embedded ∪ available`.
pub fn missing_assets(
    manifest: &Manifest,
    embedded: &HashSet<ContentHash>,
    available: &HashSet<ContentHash>,
) -> HashSet<AssetRef> {
    missing_refs(manifest.assets(), embedded, available)
}

/// [`missing_assets`] over an arbitrary list of asset references.
pub fn missing_refs<'a, I>(
    refs: I,
    embedded: &HashSet<ContentHash>,
    available: &HashSet<ContentHash>,
) -> HashSet<AssetRef>
where
    I: IntoIterator<Item = &'a AssetRef>,
{
    refs.into_iter()
        .filter(|asset| !embedded.contains(&asset.hash) && !available.contains(&asset.hash))
        .cloned()
        .collect()
}

/// Target platform of a native build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }

    /// Locations of the embedded manifest relative to a build directory.
    fn embedded_manifest_candidates(&self) -> &'static [&'static str] {
        match self {
            Platform::Ios => &["app.manifest"],
            Platform::Android => &["app.manifest", "assets/app.manifest"],
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(format!("unsupported platform `{other}` (expected ios or android)")),
        }
    }
}

/// An asset required by the export that no source provides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingAsset {
    pub hash: ContentHash,
    /// First source file known to produce the asset.
    pub path: Option<String>,
}

/// Outcome of a build-time verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub platform: Platform,
    /// Number of distinct assets the export requires.
    pub checked: usize,
    /// Sorted by hash.
    pub missing: Vec<MissingAsset>,
}

impl VerificationReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportMetadata {
    #[serde(default)]
    file_metadata: HashMap<String, PlatformMetadata>,
}

#[derive(Deserialize)]
struct PlatformMetadata {
    #[serde(default)]
    assets: Vec<ExportedAsset>,
}

#[derive(Deserialize)]
struct ExportedAsset {
    path: String,
}

#[derive(Deserialize)]
struct AssetMapEntry {
    hash: Option<String>,
    #[serde(default)]
    files: Vec<String>,
    name: Option<String>,
    #[serde(rename = "type")]
    asset_type: Option<String>,
}

const METADATA_FILE: &str = "metadata.json";
const ASSET_MAP_FILE: &str = "assetmap.json";

/// Check that every asset the export references is either embedded in the
/// native build or shipped in the export for `platform`.
///
/// Missing assets are data, not an error: the caller decides what to do
/// with a non-empty report.
pub fn verify_export(
    export_dir: &Path,
    build_dir: &Path,
    platform: Platform,
) -> Result<VerificationReport> {
    let required = read_asset_map(export_dir)?;
    let embedded = read_embedded_hashes(build_dir, platform)?;
    let available = read_exported_hashes(export_dir, platform)?;
    debug!(
        required = required.len(),
        embedded = embedded.len(),
        available = available.len(),
        %platform,
        "reconciling export assets"
    );

    let refs: Vec<AssetRef> = required.iter().map(|(asset, _)| asset.clone()).collect();
    let missing = missing_refs(&refs, &embedded, &available);

    let mut report: Vec<MissingAsset> = required
        .into_iter()
        .filter(|(asset, _)| missing.contains(asset))
        .map(|(asset, path)| MissingAsset {
            hash: asset.hash,
            path,
        })
        .collect();
    report.sort_by(|a, b| a.hash.cmp(&b.hash));
    report.dedup_by(|a, b| a.hash == b.hash);

    if report.is_empty() {
        info!(checked = refs.len(), %platform, "all export assets accounted for");
    } else {
        warn!(missing = report.len(), checked = refs.len(), %platform, "export assets missing");
    }

    Ok(VerificationReport {
        platform,
        checked: refs.len(),
        missing: report,
    })
}

/// Asset references from `assetmap.json` together with their first file.
fn read_asset_map(export_dir: &Path) -> Result<Vec<(AssetRef, Option<String>)>> {
    let path = export_dir.join(ASSET_MAP_FILE);
    let raw = read_required(&path)?;
    let entries: BTreeMap<String, AssetMapEntry> = serde_json::from_slice(&raw)?;

    entries
        .into_iter()
        .map(|(key, entry)| {
            let hash = ContentHash::parse(entry.hash.as_deref().unwrap_or(&key))?;
            let first_file = entry.files.first().cloned();
            let asset = AssetRef {
                hash,
                key: entry.name.or_else(|| first_file.clone()).unwrap_or(key),
                content_type: entry
                    .asset_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                url: None,
                is_launch_asset: false,
            };
            Ok((asset, first_file))
        })
        .collect()
}

fn read_embedded_hashes(build_dir: &Path, platform: Platform) -> Result<HashSet<ContentHash>> {
    let path = platform
        .embedded_manifest_candidates()
        .iter()
        .map(|candidate| build_dir.join(candidate))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| UpdatesError::NotFound(build_dir.join("app.manifest")))?;
    let manifest = Manifest::parse(&fs::read(&path)?)?;
    Ok(manifest.assets().iter().map(|asset| asset.hash.clone()).collect())
}

fn read_exported_hashes(export_dir: &Path, platform: Platform) -> Result<HashSet<ContentHash>> {
    let raw = read_required(&export_dir.join(METADATA_FILE))?;
    let metadata: ExportMetadata = serde_json::from_slice(&raw)?;
    let Some(entry) = metadata.file_metadata.get(platform.as_str()) else {
        return Ok(HashSet::new());
    };

    let mut hashes = HashSet::with_capacity(entry.assets.len());
    for asset in &entry.assets {
        let file = export_dir.join(&asset.path);
        let named = file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| ContentHash::parse(stem).ok());
        match named {
            Some(hash) => {
                hashes.insert(hash);
            }
            None if file.is_file() => {
                hashes.insert(ContentHash::of_file(&file)?);
            }
            None => warn!(path = %asset.path, "exported asset is neither hash-named nor present"),
        }
    }
    Ok(hashes)
}

fn read_required(path: &Path) -> Result<Vec<u8>> {
    if !path.is_file() {
        return Err(UpdatesError::NotFound(PathBuf::from(path)));
    }
    Ok(fs::read(path)?)
}
