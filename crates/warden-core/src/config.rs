use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

pub const CONFIG_FILE: &str = "warden.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TemplateSource
// ---------------------------------------------------------------------------

/// A checked-out template repository: `url` gives host/account/repo, `path`
/// holds one subdirectory per template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSource {
    pub url: String,
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// StorageBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageBackend {
    Filesystem {
        path: PathBuf,
    },
    EmbeddedKv {
        path: PathBuf,
        #[serde(default = "default_kv_prefix")]
        prefix: String,
    },
    HttpKv {
        url: String,
        #[serde(default = "default_kv_prefix")]
        prefix: String,
        #[serde(default)]
        token: Option<String>,
    },
}

fn default_kv_prefix() -> String {
    "warden/services".to_string()
}

// ---------------------------------------------------------------------------
// ArchiveBackend
// ---------------------------------------------------------------------------

/// Each service archives into `<path>/<guid>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveBackend {
    Sqlite { path: PathBuf },
    Files { path: PathBuf },
    /// Not durable. Useful for tests and throwaway instances.
    Memory,
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
    #[serde(default = "default_validate_retry")]
    pub validate_retry_secs: u64,
    #[serde(default = "default_delete_callback_timeout")]
    pub delete_callback_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_retention_secs: Option<u64>,
    #[serde(default = "default_retention_interval")]
    pub retention_interval_secs: u64,
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_save_interval() -> u64 {
    10
}

fn default_validate_retry() -> u64 {
    10
}

fn default_delete_callback_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_retention_interval() -> u64 {
    3600
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            save_interval_secs: default_save_interval(),
            validate_retry_secs: default_validate_retry(),
            delete_callback_timeout_secs: default_delete_callback_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            task_retention_secs: None,
            retention_interval_secs: default_retention_interval(),
        }
    }
}

impl RuntimeConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn validate_retry(&self) -> Duration {
        Duration::from_secs(self.validate_retry_secs)
    }

    pub fn delete_callback_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_callback_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn task_retention(&self) -> Option<Duration> {
        self.task_retention_secs.map(Duration::from_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub template_sources: Vec<TemplateSource>,
    pub storage: StorageBackend,
    pub archive: ArchiveBackend,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Filesystem snapshots under `<root>/services` and SQLite archives under
    /// `<root>/archive`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            template_sources: Vec::new(),
            storage: StorageBackend::Filesystem {
                path: root.join("services"),
            },
            archive: ArchiveBackend::Sqlite {
                path: root.join("archive"),
            },
            runtime: RuntimeConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(WardenError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)
            .map_err(|e| WardenError::Config(format!("{}: {e}", path.display())))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.template_sources.is_empty() {
            warnings.push(ConfigWarning::warning(
                "no template_sources configured; only programmatic templates are available",
            ));
        }
        for source in &self.template_sources {
            if !source.path.is_dir() {
                warnings.push(ConfigWarning::error(format!(
                    "template source '{}' path {} is not a directory",
                    source.url,
                    source.path.display()
                )));
            }
        }

        if self.runtime.poll_timeout_ms == 0 {
            warnings.push(ConfigWarning::error(
                "runtime.poll_timeout_ms=0 makes the execution worker spin",
            ));
        }
        if self.runtime.save_interval_secs == 0 {
            warnings.push(ConfigWarning::error("runtime.save_interval_secs must be > 0"));
        }
        if self.runtime.validate_retry_secs == 0 {
            warnings.push(ConfigWarning::error("runtime.validate_retry_secs must be > 0"));
        }
        if self.runtime.retention_interval_secs == 0 && self.runtime.task_retention_secs.is_some()
        {
            warnings.push(ConfigWarning::error(
                "runtime.retention_interval_secs must be > 0 when task_retention_secs is set",
            ));
        }
        if self.runtime.delete_callback_timeout_secs > self.runtime.shutdown_timeout_secs {
            warnings.push(ConfigWarning::warning(format!(
                "runtime.delete_callback_timeout_secs={} exceeds shutdown_timeout_secs={}",
                self.runtime.delete_callback_timeout_secs, self.runtime.shutdown_timeout_secs
            )));
        }

        if matches!(self.archive, ArchiveBackend::Memory) {
            warnings.push(ConfigWarning::warning(
                "archive type 'memory' loses task history on restart",
            ));
        }
        if let StorageBackend::HttpKv { url, .. } = &self.storage {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                warnings.push(ConfigWarning::error(format!(
                    "storage url '{url}' must start with http:// or https://"
                )));
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn minimal_yaml_gets_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "storage:\n  type: filesystem\n  path: /srv/warden\narchive:\n  type: files\n  path: /srv/archive\n",
        )
        .unwrap();
        assert!(cfg.template_sources.is_empty());
        assert_eq!(cfg.runtime, RuntimeConfig::default());
        assert_eq!(cfg.runtime.poll_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.runtime.task_retention(), None);
        assert_eq!(
            cfg.archive,
            ArchiveBackend::Files {
                path: "/srv/archive".into()
            }
        );
    }

    #[test]
    fn kv_backends_parse() {
        let embedded: StorageBackend =
            serde_yaml::from_str("type: embedded_kv\npath: /var/lib/warden.redb\n").unwrap();
        assert_eq!(
            embedded,
            StorageBackend::EmbeddedKv {
                path: "/var/lib/warden.redb".into(),
                prefix: "warden/services".into()
            }
        );
        let http: StorageBackend = serde_yaml::from_str(
            "type: http_kv\nurl: http://consul:8500\nprefix: prod\ntoken: s3cret\n",
        )
        .unwrap();
        assert!(matches!(
            http,
            StorageBackend::HttpKv { ref prefix, token: Some(_), .. } if prefix == "prod"
        ));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut cfg = Config::with_root(dir.path());
        cfg.runtime.task_retention_secs = Some(86_400);
        cfg.template_sources.push(TemplateSource {
            url: "https://github.com/acct/repo".into(),
            path: dir.path().join("templates"),
        });
        cfg.save(&path).unwrap();

        let back = Config::load(&path).unwrap();
        assert_eq!(back.storage, cfg.storage);
        assert_eq!(back.runtime.task_retention(), Some(Duration::from_secs(86_400)));
        assert_eq!(back.template_sources, cfg.template_sources);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join(CONFIG_FILE)).unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn validate_clean_config() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        let mut cfg = Config::with_root(dir.path());
        cfg.template_sources.push(TemplateSource {
            url: "https://github.com/acct/repo".into(),
            path: dir.path().join("templates"),
        });
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn validate_flags_problems() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::with_root(dir.path());
        cfg.template_sources.push(TemplateSource {
            url: "https://github.com/acct/repo".into(),
            path: dir.path().join("missing"),
        });
        cfg.runtime.poll_timeout_ms = 0;
        cfg.archive = ArchiveBackend::Memory;
        cfg.storage = StorageBackend::HttpKv {
            url: "consul:8500".into(),
            prefix: default_kv_prefix(),
            token: None,
        };
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("not a directory")));
        assert!(warnings.iter().any(|w| w.message.contains("poll_timeout_ms=0")));
        assert!(warnings.iter().any(|w| w.message.contains("memory")));
        assert!(warnings.iter().any(|w| w.message.contains("must start with http")));
    }
}
