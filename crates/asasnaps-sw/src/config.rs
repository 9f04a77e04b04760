//! Worker configuration

use std::path::Path;

use asasnaps_net::UrlPattern;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Cannot resolve '{path}' against scope: {source}")]
    Url {
        path: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Worker configuration, injected once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Origin and path the worker controls; manifest paths resolve against it.
    pub scope: Url,

    /// Name of the current cache generation.
    #[serde(default = "defaults::cache_name")]
    pub cache_name: String,

    /// SPA entry document.
    #[serde(default = "defaults::entry_url")]
    pub entry_url: String,

    /// Document served when both network and cache miss.
    #[serde(default = "defaults::offline_url")]
    pub offline_url: String,

    /// Assets fetched and stored at install time.
    #[serde(default = "defaults::precache")]
    pub precache: Vec<String>,

    /// Requests matching any of these never reach the interceptor.
    #[serde(default = "defaults::bypass")]
    pub bypass: Vec<UrlPattern>,

    /// Activate right after install instead of waiting for pages to close.
    #[serde(default = "defaults::enabled")]
    pub skip_waiting: bool,

    /// Take control of already-open pages on activation.
    #[serde(default = "defaults::enabled")]
    pub claim_clients: bool,

    /// Push notification settings
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Background sync settings
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub default_title: String,
    pub default_body: String,
    pub default_url: String,
    pub icon: String,
    pub badge: String,
    /// Vibration pattern in milliseconds (on, off, on, ...)
    pub vibrate: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tag that flushes queued contact-form submissions.
    pub form_tag: String,

    /// Where queued submissions are POSTed; `None` keeps them queued.
    pub form_endpoint: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_title: "AsaSnaps Update".to_string(),
            default_body: "You have new updates from AsaSnaps".to_string(),
            default_url: "/".to_string(),
            icon: "/android-chrome-192x192.png".to_string(),
            badge: "/android-chrome-192x192.png".to_string(),
            vibrate: vec![100, 50, 100],
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            form_tag: "sync-form-data".to_string(),
            form_endpoint: None,
        }
    }
}

impl WorkerConfig {
    /// Deployment defaults for the given scope.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            cache_name: defaults::cache_name(),
            entry_url: defaults::entry_url(),
            offline_url: defaults::offline_url(),
            precache: defaults::precache(),
            bypass: defaults::bypass(),
            skip_waiting: true,
            claim_clients: true,
            notifications: NotificationConfig::default(),
            sync: SyncConfig::default(),
        }
    }

    /// Same config under another cache generation.
    pub fn with_cache_name(mut self, cache_name: impl Into<String>) -> Self {
        self.cache_name = cache_name.into();
        self
    }

    /// Replace the precache manifest.
    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Resolve a root-relative path against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url, ConfigError> {
        self.scope.join(path).map_err(|source| ConfigError::Url {
            path: path.to_string(),
            source,
        })
    }

    /// Manifest entries as absolute URLs, in manifest order.
    pub fn precache_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.precache.iter().map(|p| self.resolve(p)).collect()
    }

    pub fn offline_document(&self) -> Result<Url, ConfigError> {
        self.resolve(&self.offline_url)
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.scope.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "scope must be http or https, got {}",
                self.scope.scheme()
            )));
        }
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::Invalid("cache name is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for url in self.precache_urls()? {
            if url.origin() != self.scope.origin() {
                return Err(ConfigError::Invalid(format!(
                    "precache entry {} is not same-origin",
                    url
                )));
            }
            if !seen.insert(url.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate precache entry {}",
                    url
                )));
            }
        }

        for required in [&self.entry_url, &self.offline_url] {
            if !seen.contains(&self.resolve(required)?) {
                return Err(ConfigError::Invalid(format!(
                    "precache manifest must include {}",
                    required
                )));
            }
        }

        Ok(())
    }
}

mod defaults {
    use asasnaps_net::UrlPattern;

    pub fn cache_name() -> String {
        "asasnaps-v1".to_string()
    }

    pub fn entry_url() -> String {
        "/".to_string()
    }

    pub fn offline_url() -> String {
        "/offline.html".to_string()
    }

    pub fn precache() -> Vec<String> {
        [
            "/",
            "/index.html",
            "/src/main.jsx",
            "/src/App.jsx",
            "/src/styles/global.css",
            "/src/assets/logo.svg",
            "/favicon.ico",
            "/android-chrome-192x192.png",
            "/android-chrome-512x512.png",
            "/apple-touch-icon.png",
            "/favicon-32x32.png",
            "/favicon-16x16.png",
            "/site.webmanifest",
            "/safari-pinned-tab.svg",
            "/offline.html",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn bypass() -> Vec<UrlPattern> {
        vec![
            UrlPattern::contains("browser-sync"),
            UrlPattern::contains("chrome-extension"),
        ]
    }

    pub fn enabled() -> bool {
        true
    }
}
