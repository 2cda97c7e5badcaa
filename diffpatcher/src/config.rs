//! Configuration for the update client.
//!
//! Every operation takes an explicit options struct with documented
//! defaults. [`ClientConfig::load`] builds the whole configuration from an
//! INI file:
//!
//! ```ini
//! [updater]
//! mirrors = https://a.example/update/app, https://b.example/update/app
//! root = /opt/app
//! storage = /var/cache/app-update
//! concurrency = 5
//! verify_before_patch = false
//! verify_after_patch = true
//! apply_attempts = 3
//! apply_retry_delay_ms = 1000
//! timeout_secs = 30
//!
//! [probe]
//! time_threshold_ms = 3000
//! byte_threshold = 102400
//!
//! [bundle]
//! patch_mirrors = https://a.example/bundle/patch.zip
//! full_mirrors = https://a.example/bundle/full.zip
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;

use crate::applicator::{ApplyOptions, DEFAULT_APPLY_ATTEMPTS, DEFAULT_APPLY_RETRY_DELAY};
use crate::error::{UpdateError, UpdateResult};
use crate::mirror::ProbeOptions;

/// Default number of concurrent transfers and digests.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default HTTP request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for a versioned update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Install this version instead of the remote `latest`.
    ///
    /// A forced target skips the newer-than-local check.
    pub target_version: Option<String>,
    /// Maximum concurrent transfers, digests and patch applications.
    pub concurrency: usize,
    /// Check live files against their expected old digest before patching.
    pub verify_before_patch: bool,
    /// Check converged files against their new digest.
    pub verify_after_patch: bool,
    /// Delta application attempts per file.
    pub apply_attempts: u32,
    /// Delay between delta application attempts.
    pub apply_retry_delay: Duration,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            target_version: None,
            concurrency: DEFAULT_CONCURRENCY,
            verify_before_patch: false,
            verify_after_patch: true,
            apply_attempts: DEFAULT_APPLY_ATTEMPTS,
            apply_retry_delay: DEFAULT_APPLY_RETRY_DELAY,
        }
    }
}

impl UpdateOptions {
    /// Install a specific version.
    pub fn with_target_version(mut self, version: impl Into<String>) -> Self {
        self.target_version = Some(version.into());
        self
    }

    /// Set the concurrency bound.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Enable or disable the pre-patch digest check.
    pub fn with_verify_before_patch(mut self, verify: bool) -> Self {
        self.verify_before_patch = verify;
        self
    }

    /// Enable or disable the post-patch digest check.
    pub fn with_verify_after_patch(mut self, verify: bool) -> Self {
        self.verify_after_patch = verify;
        self
    }

    /// Set the retry policy for delta application.
    pub fn with_apply_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.apply_attempts = attempts;
        self.apply_retry_delay = delay;
        self
    }

    /// Options for the patch applicator.
    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            concurrency: self.concurrency,
            verify_before_patch: self.verify_before_patch,
            verify_after_patch: self.verify_after_patch,
            apply_attempts: self.apply_attempts,
            apply_retry_delay: self.apply_retry_delay,
        }
    }
}

/// Options for the bundle flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleOptions {
    /// Candidate URLs of the patch bundle.
    pub patch_mirrors: Vec<String>,
    /// Candidate URLs of the full bundle.
    pub full_mirrors: Vec<String>,
}

impl BundleOptions {
    /// Add a patch bundle candidate.
    pub fn with_patch_mirror(mut self, url: impl Into<String>) -> Self {
        self.patch_mirrors.push(url.into());
        self
    }

    /// Add a full bundle candidate.
    pub fn with_full_mirror(mut self, url: impl Into<String>) -> Self {
        self.full_mirrors.push(url.into());
        self
    }
}

/// Configuration of an [`UpdateClient`](crate::UpdateClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URLs of the update server, in preference order.
    pub mirrors: Vec<String>,
    /// Artifact root being updated.
    pub root: PathBuf,
    /// Staging storage folder.
    pub storage: PathBuf,
    /// HTTP request timeout.
    pub timeout: Duration,
    /// Mirror probe thresholds.
    pub probe: ProbeOptions,
    /// Versioned update options.
    pub update: UpdateOptions,
    /// Bundle flow options.
    pub bundle: BundleOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mirrors: Vec::new(),
            root: PathBuf::from("."),
            storage: std::env::temp_dir().join("diffpatcher-staging"),
            timeout: DEFAULT_TIMEOUT,
            probe: ProbeOptions::default(),
            update: UpdateOptions::default(),
            bundle: BundleOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration updating `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Add a mirror base URL.
    pub fn with_mirror(mut self, url: impl Into<String>) -> Self {
        self.mirrors.push(url.into());
        self
    }

    /// Set the staging storage folder.
    pub fn with_storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = path.into();
        self
    }

    /// Set the HTTP timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the mirror probe thresholds.
    pub fn with_probe(mut self, probe: ProbeOptions) -> Self {
        self.probe = probe;
        self
    }

    /// Set the versioned update options.
    pub fn with_update_options(mut self, options: UpdateOptions) -> Self {
        self.update = options;
        self
    }

    /// Set the bundle options.
    pub fn with_bundle_options(mut self, options: BundleOptions) -> Self {
        self.bundle = options;
        self
    }

    /// Load configuration from an INI file.
    pub fn load(path: &Path) -> UpdateResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| UpdateError::read(path, e))?;
        Self::parse(&text)
    }

    /// Parse configuration from INI text.
    ///
    /// Starts from the defaults and overlays the values found. Unknown keys
    /// are ignored; `updater.root` is required.
    pub fn parse(text: &str) -> UpdateResult<Self> {
        let ini = Ini::load_from_str(text)
            .map_err(|e| UpdateError::InvalidConfig(e.to_string()))?;
        let mut config = Self::default();

        let updater = ini
            .section(Some("updater"))
            .ok_or_else(|| UpdateError::InvalidConfig("missing [updater] section".to_string()))?;

        config.root = updater
            .get("root")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| UpdateError::InvalidConfig("updater.root is required".to_string()))?;
        if let Some(v) = updater.get("mirrors") {
            config.mirrors = parse_list(v);
        }
        if let Some(v) = updater.get("storage") {
            config.storage = PathBuf::from(v.trim());
        }
        if let Some(v) = updater.get("timeout_secs") {
            config.timeout = Duration::from_secs(parse_value("updater", "timeout_secs", v)?);
        }
        if let Some(v) = updater.get("concurrency") {
            config.update.concurrency = parse_value("updater", "concurrency", v)?;
            if config.update.concurrency == 0 {
                return Err(invalid("updater", "concurrency", v, "must be at least 1"));
            }
        }
        if let Some(v) = updater.get("verify_before_patch") {
            config.update.verify_before_patch = parse_bool("updater", "verify_before_patch", v)?;
        }
        if let Some(v) = updater.get("verify_after_patch") {
            config.update.verify_after_patch = parse_bool("updater", "verify_after_patch", v)?;
        }
        if let Some(v) = updater.get("apply_attempts") {
            config.update.apply_attempts = parse_value("updater", "apply_attempts", v)?;
        }
        if let Some(v) = updater.get("apply_retry_delay_ms") {
            config.update.apply_retry_delay =
                Duration::from_millis(parse_value("updater", "apply_retry_delay_ms", v)?);
        }

        if let Some(probe) = ini.section(Some("probe")) {
            if let Some(v) = probe.get("time_threshold_ms") {
                config.probe.time_threshold =
                    Duration::from_millis(parse_value("probe", "time_threshold_ms", v)?);
            }
            if let Some(v) = probe.get("byte_threshold") {
                config.probe.byte_threshold = parse_value("probe", "byte_threshold", v)?;
            }
        }

        if let Some(bundle) = ini.section(Some("bundle")) {
            if let Some(v) = bundle.get("patch_mirrors") {
                config.bundle.patch_mirrors = parse_list(v);
            }
            if let Some(v) = bundle.get("full_mirrors") {
                config.bundle.full_mirrors = parse_list(v);
            }
        }

        Ok(config)
    }
}

/// Default configuration file location (`<config dir>/diffpatcher/config.ini`).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("diffpatcher")
        .join("config.ini")
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_value<T: FromStr>(section: &str, key: &str, value: &str) -> UpdateResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(section, key, value, &e.to_string()))
}

fn parse_bool(section: &str, key: &str, value: &str) -> UpdateResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(section, key, value, "expected true or false")),
    }
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> UpdateError {
    UpdateError::InvalidConfig(format!("{}.{} = '{}': {}", section, key, value, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_options_defaults() {
        let options = UpdateOptions::default();
        assert_eq!(options.concurrency, 5);
        assert!(!options.verify_before_patch);
        assert!(options.verify_after_patch);
        assert_eq!(options.apply_attempts, 3);
        assert_eq!(options.apply_retry_delay, Duration::from_secs(1));
        assert!(options.target_version.is_none());
    }

    #[test]
    fn test_builders() {
        let config = ClientConfig::new("/opt/app")
            .with_mirror("http://a")
            .with_mirror("http://b")
            .with_storage("/tmp/s")
            .with_update_options(
                UpdateOptions::default()
                    .with_concurrency(2)
                    .with_target_version("1.2.0"),
            );

        assert_eq!(config.mirrors, vec!["http://a", "http://b"]);
        assert_eq!(config.storage, PathBuf::from("/tmp/s"));
        assert_eq!(config.update.apply_options().concurrency, 2);
        assert_eq!(config.update.target_version.as_deref(), Some("1.2.0"));
    }

    #[test]
    fn test_parse_full_file() {
        let text = r#"
[updater]
mirrors = https://a.example/app , https://b.example/app
root = /opt/app
storage = /var/cache/app
concurrency = 8
verify_before_patch = yes
verify_after_patch = false
apply_attempts = 5
apply_retry_delay_ms = 250
timeout_secs = 10
unknown_key = ignored

[probe]
time_threshold_ms = 1500
byte_threshold = 2048

[bundle]
patch_mirrors = https://a.example/patch.zip
full_mirrors = https://a.example/full.zip, https://b.example/full.zip
"#;
        let config = ClientConfig::parse(text).unwrap();

        assert_eq!(
            config.mirrors,
            vec!["https://a.example/app", "https://b.example/app"]
        );
        assert_eq!(config.root, PathBuf::from("/opt/app"));
        assert_eq!(config.storage, PathBuf::from("/var/cache/app"));
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.update.concurrency, 8);
        assert!(config.update.verify_before_patch);
        assert!(!config.update.verify_after_patch);
        assert_eq!(config.update.apply_attempts, 5);
        assert_eq!(config.update.apply_retry_delay, Duration::from_millis(250));
        assert_eq!(config.probe.time_threshold, Duration::from_millis(1500));
        assert_eq!(config.probe.byte_threshold, 2048);
        assert_eq!(config.bundle.patch_mirrors.len(), 1);
        assert_eq!(config.bundle.full_mirrors.len(), 2);
    }

    #[test]
    fn test_parse_minimal_uses_defaults() {
        let config = ClientConfig::parse("[updater]\nroot = /opt/app\n").unwrap();
        assert!(config.mirrors.is_empty());
        assert_eq!(config.update, UpdateOptions::default());
        assert_eq!(config.probe, ProbeOptions::default());
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        let err = ClientConfig::parse("[updater]\nroot = /a\nconcurrency = lots\n").unwrap_err();
        assert!(err.to_string().contains("updater.concurrency"));

        let err = ClientConfig::parse("[updater]\nroot = /a\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, UpdateError::InvalidConfig(_)));

        let err =
            ClientConfig::parse("[updater]\nroot = /a\nverify_after_patch = maybe\n").unwrap_err();
        assert!(err.to_string().contains("verify_after_patch"));
    }

    #[test]
    fn test_parse_requires_root() {
        let err = ClientConfig::parse("[updater]\nmirrors = http://a\n").unwrap_err();
        assert!(err.to_string().contains("updater.root"));
        assert!(ClientConfig::parse("[other]\nx = 1\n").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = ClientConfig::load(&temp.path().join("missing.ini")).unwrap_err();
        assert!(matches!(err, UpdateError::ReadFailed { .. }));
    }

    #[test]
    fn test_default_config_path() {
        assert!(default_config_path().ends_with("diffpatcher/config.ini"));
    }
}
