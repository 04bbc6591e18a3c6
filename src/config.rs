//! Provisioner configuration
//!
//! Typed configuration shared by the controller, the backends and the
//! bootstrap. Values come from an optional YAML file and are overridden by
//! command-line flags in `main.rs`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default provisioner identity, matched against `StorageClass.provisioner`
pub const DEFAULT_PROVISIONER_NAME: &str = "iscsi-provisioner";

/// Number of attempts when saving a provisioned PersistentVolume
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// Interval between save (and cleanup) attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between full replays of the watch caches
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(15);

// =============================================================================
// Operation Mode
// =============================================================================

/// How the backend performs allocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Run a shell script
    #[default]
    Script,
    /// Call a REST server
    RestApi,
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationMode::Script => write!(f, "script"),
            OperationMode::RestApi => write!(f, "restapi"),
        }
    }
}

impl std::str::FromStr for OperationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "script" => Ok(OperationMode::Script),
            "restapi" | "rest" => Ok(OperationMode::RestApi),
            other => Err(Error::Configuration(format!(
                "Unknown execution mode {:?} (expected script or restapi)",
                other
            ))),
        }
    }
}

// =============================================================================
// Backend Configuration
// =============================================================================

/// Backend settings for both operation modes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    /// Selected operation mode
    pub mode: OperationMode,
    /// Allocation script, invoked as `sh <script> <pv-name>`
    pub script_path: Option<PathBuf>,
    /// Optional deallocation script, invoked as `sh <script> <pv-name>`
    pub delete_script_path: Option<PathBuf>,
    /// Directory holding `iscsi-volume-<pv-name>` artifacts
    pub artifact_dir: PathBuf,
    /// REST server URL
    pub rest_url: String,
    /// REST user
    pub rest_user: String,
    /// REST password
    pub rest_key: Option<String>,
    /// REST request timeout in seconds
    pub rest_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::Script,
            script_path: None,
            delete_script_path: None,
            artifact_dir: PathBuf::from("."),
            rest_url: "http://localhost:8081".to_string(),
            rest_user: "admin".to_string(),
            rest_key: None,
            rest_timeout_secs: 30,
        }
    }
}

// =============================================================================
// Provisioner Configuration
// =============================================================================

/// Top-level provisioner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisionerConfig {
    /// Identity matched against `StorageClass.provisioner` and stamped in
    /// the provisioned-by annotation
    pub provisioner_name: String,
    /// Backend settings
    pub backend: BackendConfig,
    /// Full replay interval for the watch caches
    #[serde(with = "duration_secs")]
    pub resync_period: Duration,
    /// Attempts for saving (and cleaning up) a provisioned volume
    pub retry_count: u32,
    /// Fixed interval between attempts
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            provisioner_name: DEFAULT_PROVISIONER_NAME.to_string(),
            backend: BackendConfig::default(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Reject configurations the provisioner cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.provisioner_name.trim().is_empty() {
            return Err(Error::Configuration(
                "provisioner name must not be empty".into(),
            ));
        }
        if self.retry_count == 0 {
            return Err(Error::Configuration("retry count must be at least 1".into()));
        }
        if self.resync_period.is_zero() {
            return Err(Error::Configuration("resync period must be non-zero".into()));
        }
        match self.backend.mode {
            OperationMode::Script => {
                let missing = self
                    .backend
                    .script_path
                    .as_ref()
                    .map_or(true, |p| p.as_os_str().is_empty());
                if missing {
                    return Err(Error::Configuration(
                        "script path is required in script mode".into(),
                    ));
                }
            }
            OperationMode::RestApi => {
                if self.backend.rest_url.is_empty() {
                    return Err(Error::Configuration(
                        "REST URL is required in restapi mode".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Durations as whole seconds in YAML
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn script_config() -> ProvisionerConfig {
        let mut config = ProvisionerConfig::default();
        config.backend.script_path = Some(PathBuf::from("/opt/prov.sh"));
        config
    }

    #[test]
    fn test_defaults() {
        let config = ProvisionerConfig::default();
        assert_eq!(config.provisioner_name, "iscsi-provisioner");
        assert_eq!(config.retry_count, 5);
        assert_eq!(config.retry_interval, Duration::from_secs(10));
        assert_eq!(config.resync_period, Duration::from_secs(15));
        assert_eq!(config.backend.mode, OperationMode::Script);
    }

    #[test]
    fn test_validate() {
        assert!(script_config().validate().is_ok());

        // Script mode without a script
        let config = ProvisionerConfig::default();
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = script_config();
        config.retry_count = 0;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = script_config();
        config.provisioner_name = "  ".into();
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = ProvisionerConfig::default();
        config.backend.mode = OperationMode::RestApi;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_operation_mode_parse() {
        assert_eq!("script".parse::<OperationMode>().unwrap(), OperationMode::Script);
        assert_eq!("RESTAPI".parse::<OperationMode>().unwrap(), OperationMode::RestApi);
        assert_matches!("nfs".parse::<OperationMode>(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_from_yaml() {
        let config = ProvisionerConfig::from_yaml(
            r#"
provisionerName: example.com/iscsi
retryCount: 3
retryInterval: 2
backend:
  mode: restapi
  restUrl: http://storage.local:8081
"#,
        )
        .unwrap();

        assert_eq!(config.provisioner_name, "example.com/iscsi");
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_interval, Duration::from_secs(2));
        // Unset fields keep their defaults
        assert_eq!(config.resync_period, DEFAULT_RESYNC_PERIOD);
        assert_eq!(config.backend.mode, OperationMode::RestApi);
        assert_eq!(config.backend.rest_url, "http://storage.local:8081");
        assert_eq!(config.backend.rest_user, "admin");
    }
}
