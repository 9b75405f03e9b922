use crate::config::UpdatesConfig;
use crate::error::{Result, UpdatesError};
use crate::manifest::AssetRef;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, Url};
use std::collections::BTreeMap;

/// Source of raw manifest payloads.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// Fetch the raw manifest document for the configured runtime.
    async fn fetch_manifest(&self) -> Result<Bytes>;
}

/// Source of asset bytes.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Fetch the bytes of `asset`. Integrity is checked by the caller.
    async fn fetch_asset(&self, asset: &AssetRef) -> Result<Bytes>;
}

/// Builder for [`HttpFetcher`].
#[derive(Default)]
pub struct HttpFetcherBuilder {
    manifest_url: Option<Url>,
    runtime_version: Option<String>,
    headers: BTreeMap<String, String>,
    client: Option<Client>,
}

impl HttpFetcherBuilder {
    /// Start from the manifest URL, runtime version and request headers of
    /// `config`.
    pub fn from_config(config: &UpdatesConfig) -> Result<Self> {
        let mut builder = Self::default()
            .runtime_version(config.runtime_version.clone())
            .headers(config.request_headers.clone());
        if let Some(url) = &config.manifest_url {
            let url = Url::parse(url)
                .map_err(|err| UpdatesError::Config(format!("invalid manifest url `{url}`: {err}")))?;
            builder = builder.manifest_url(url);
        }
        Ok(builder)
    }

    /// Manifest endpoint. Relative asset URLs resolve against it.
    pub fn manifest_url(mut self, url: Url) -> Self {
        self.manifest_url = Some(url);
        self
    }

    /// Runtime version announced with each manifest request.
    pub fn runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = Some(version.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Provide a custom reqwest client instance.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<HttpFetcher> {
        let manifest_url = self
            .manifest_url
            .ok_or_else(|| UpdatesError::Config("manifest url is required".into()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/expo+json,application/json"),
        );
        if let Some(version) = &self.runtime_version {
            headers.insert(
                HeaderName::from_static("expo-runtime-version"),
                header_value(version)?,
            );
        }
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| UpdatesError::Config(format!("invalid header name `{name}`: {err}")))?;
            headers.insert(name, header_value(value)?);
        }

        Ok(HttpFetcher {
            manifest_url,
            headers,
            client: self.client.unwrap_or_else(Client::new),
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| UpdatesError::Config(format!("invalid header value `{value}`: {err}")))
}

/// Fetches manifests and assets over HTTP.
#[derive(Clone)]
pub struct HttpFetcher {
    manifest_url: Url,
    headers: HeaderMap,
    client: Client,
}

impl HttpFetcher {
    pub fn builder() -> HttpFetcherBuilder {
        HttpFetcherBuilder::default()
    }

    pub fn from_config(config: &UpdatesConfig) -> Result<Self> {
        HttpFetcherBuilder::from_config(config)?.build()
    }

    fn asset_url(&self, asset: &AssetRef) -> Result<Url> {
        let raw = asset.url.as_deref().ok_or_else(|| {
            UpdatesError::malformed(format!("asset {} has no download url", asset.key))
        })?;
        self.manifest_url
            .join(raw)
            .map_err(|err| UpdatesError::malformed(format!("invalid asset url `{raw}`: {err}")))
    }
}

#[async_trait]
impl ManifestFetcher for HttpFetcher {
    async fn fetch_manifest(&self) -> Result<Bytes> {
        let response = self
            .client
            .get(self.manifest_url.clone())
            .headers(self.headers.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch_asset(&self, asset: &AssetRef) -> Result<Bytes> {
        let url = self.asset_url(asset)?;
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?)
    }
}
