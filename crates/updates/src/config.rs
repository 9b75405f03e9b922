//! Configuration for the updates controller.

use crate::error::{Result, UpdatesError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// When the application checks for updates on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckAutomatically {
    /// Check every time the application launches.
    #[default]
    OnLaunch,
    /// Check on launch only when on an unmetered connection.
    WifiOnly,
    /// Check only after a launch failed.
    ErrorRecoveryOnly,
    /// Never check automatically.
    Never,
}

/// Configuration for the updates controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdatesConfig {
    /// Runtime version compiled into the client.
    pub runtime_version: String,
    /// Directory holding cached assets and launch bookkeeping.
    pub updates_dir: PathBuf,
    /// Automatic check policy
    pub check_automatically: CheckAutomatically,
    /// Manifest endpoint
    pub manifest_url: Option<String>,
    /// Extra headers sent with every manifest request
    pub request_headers: BTreeMap<String, String>,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            runtime_version: String::new(),
            updates_dir: PathBuf::from(".updates"),
            check_automatically: CheckAutomatically::default(),
            manifest_url: None,
            request_headers: BTreeMap::new(),
        }
    }
}

impl UpdatesConfig {
    /// Create a config for the given runtime version.
    pub fn new(runtime_version: impl Into<String>) -> Self {
        Self {
            runtime_version: runtime_version.into(),
            ..Self::default()
        }
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(UpdatesError::NotFound(path.to_path_buf()));
        }
        let config: Self = serde_json::from_slice(&fs::read(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn updates_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.updates_dir = dir.into();
        self
    }

    pub fn check_automatically(mut self, policy: CheckAutomatically) -> Self {
        self.check_automatically = policy;
        self
    }

    pub fn manifest_url(mut self, url: impl Into<String>) -> Self {
        self.manifest_url = Some(url.into());
        self
    }

    /// Add a header sent with manifest requests.
    pub fn request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name.into(), value.into());
        self
    }

    /// Reject configurations the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.runtime_version.trim().is_empty() {
            return Err(UpdatesError::Config("runtime version must not be empty".into()));
        }
        if self.updates_dir.as_os_str().is_empty() {
            return Err(UpdatesError::Config("updates directory must not be empty".into()));
        }
        if let Some(url) = &self.manifest_url {
            if reqwest::Url::parse(url).is_err() {
                return Err(UpdatesError::Config(format!("invalid manifest url `{url}`")));
            }
        }
        Ok(())
    }

    /// Cache directory for downloaded assets.
    pub fn assets_dir(&self) -> PathBuf {
        self.updates_dir.join("assets")
    }

    /// Record of the downloaded update to launch next.
    pub fn pending_update_path(&self) -> PathBuf {
        self.updates_dir.join("pending.json")
    }
}
