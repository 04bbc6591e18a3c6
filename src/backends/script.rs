//! Script Backend
//!
//! Allocates iSCSI storage by running an operator-supplied shell script.
//! The script receives the PersistentVolume name as its only argument and
//! prints `<target-portal> <iqn>` on stdout.

use crate::config::BackendConfig;
use crate::domain::ports::{AllocatedVolume, VolumeBackend, VolumeOptions};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

const BACKEND: &str = "script";

/// Prefix of the marker a script leaves for every volume it allocated
pub const ARTIFACT_PREFIX: &str = "iscsi-volume-";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the script backend
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Allocation script
    pub script: PathBuf,
    /// Deallocation script; reclaim is a no-op without one
    pub delete_script: Option<PathBuf>,
    /// Working directory of the scripts, where artifacts are looked up
    pub artifact_dir: PathBuf,
}

impl ScriptConfig {
    pub fn from_backend(config: &BackendConfig) -> Result<Self> {
        let script = config.script_path.clone().ok_or_else(|| {
            Error::Configuration("script mode requires a script path".into())
        })?;
        Ok(Self {
            script: absolute(&script)?,
            delete_script: config
                .delete_script_path
                .as_deref()
                .map(absolute)
                .transpose()?,
            artifact_dir: absolute(&config.artifact_dir)?,
        })
    }
}

/// Scripts run inside the artifact directory, so relative paths are pinned
/// to the process working directory first
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

// =============================================================================
// Script Backend
// =============================================================================

/// Backend driven by shell scripts
pub struct ScriptBackend {
    config: ScriptConfig,
}

impl ScriptBackend {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }

    /// Path of the allocation marker for `volume_name`
    pub fn artifact_path(&self, volume_name: &str) -> PathBuf {
        self.config
            .artifact_dir
            .join(format!("{}{}", ARTIFACT_PREFIX, volume_name))
    }

    /// Run `sh <script> <volume_name>` and return its stdout
    async fn run(&self, operation: &str, script: &Path, volume_name: &str) -> Result<String> {
        debug!(script = %script.display(), volume = volume_name, "running {} script", operation);

        let output = Command::new("sh")
            .arg(script)
            .arg(volume_name)
            .current_dir(&self.config.artifact_dir)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::BackendOperationFailed {
                backend: BACKEND.into(),
                operation: operation.into(),
                reason: format!(
                    "{} exited with {}: {}",
                    script.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse the two whitespace-separated fields printed by the allocation script
pub fn parse_target(stdout: &str) -> Result<AllocatedVolume> {
    let fields: Vec<&str> = stdout.split_whitespace().collect();
    match fields.as_slice() {
        [portal, iqn] => Ok(AllocatedVolume {
            location: portal.to_string(),
            identifier: iqn.to_string(),
        }),
        _ => Err(Error::BackendOutput {
            backend: BACKEND.into(),
            fields: fields.len(),
        }),
    }
}

#[async_trait]
impl VolumeBackend for ScriptBackend {
    async fn allocate(&self, options: &VolumeOptions) -> Result<AllocatedVolume> {
        let stdout = self
            .run("allocate", &self.config.script, &options.pv_name)
            .await?;
        let target = parse_target(&stdout)?;
        info!(
            volume = %options.pv_name,
            portal = %target.location,
            iqn = %target.identifier,
            "script allocated volume"
        );
        Ok(target)
    }

    async fn deallocate(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume.metadata.name.as_deref().unwrap_or_default();
        match &self.config.delete_script {
            Some(script) => {
                self.run("deallocate", script, name).await?;
                info!(volume = name, "script deallocated volume");
            }
            None => debug!(volume = name, "no delete script configured"),
        }
        Ok(())
    }

    async fn exists(&self, volume_name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.artifact_path(volume_name)).await?)
    }

    fn backend_name(&self) -> &str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn options(pv_name: &str) -> VolumeOptions {
        VolumeOptions {
            capacity: None,
            access_modes: vec!["ReadWriteOnce".into()],
            reclaim_policy: "Delete".into(),
            pv_name: pv_name.into(),
            parameters: BTreeMap::new(),
        }
    }

    fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn backend(dir: &TempDir, create: &str, delete: Option<&str>) -> ScriptBackend {
        ScriptBackend::new(ScriptConfig {
            script: write_script(dir, "create.sh", create),
            delete_script: delete.map(|body| write_script(dir, "delete.sh", body)),
            artifact_dir: dir.path().to_path_buf(),
        })
    }

    #[test]
    fn test_parse_target() {
        let target = parse_target("10.0.0.1:3260 iqn.2016-10.io.example:pvc-u1\n").unwrap();
        assert_eq!(target.location, "10.0.0.1:3260");
        assert_eq!(target.identifier, "iqn.2016-10.io.example:pvc-u1");

        assert_matches!(parse_target(""), Err(Error::BackendOutput { fields: 0, .. }));
        assert_matches!(
            parse_target("10.0.0.1:3260"),
            Err(Error::BackendOutput { fields: 1, .. })
        );
        assert_matches!(
            parse_target("a b c"),
            Err(Error::BackendOutput { fields: 3, .. })
        );
    }

    #[tokio::test]
    async fn test_allocate_and_exists() {
        let dir = TempDir::new().unwrap();
        let backend = backend(
            &dir,
            "touch iscsi-volume-$1\necho 10.0.0.1:3260 iqn.2016-10.io.example:$1\n",
            None,
        );

        assert!(!backend.exists("pvc-u1").await.unwrap());
        let target = backend.allocate(&options("pvc-u1")).await.unwrap();
        assert_eq!(target.identifier, "iqn.2016-10.io.example:pvc-u1");
        assert!(backend.exists("pvc-u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_script_failure() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, "echo no space >&2\nexit 3\n", None);

        let err = backend.allocate(&options("pvc-u1")).await.unwrap_err();
        assert_matches!(err, Error::BackendOperationFailed { ref reason, .. } if reason.contains("no space"));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_deallocate() {
        let dir = TempDir::new().unwrap();
        let volume = PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pvc-u1".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        // Without a delete script reclaim succeeds and leaves the artifact
        let plain = backend(&dir, "touch iscsi-volume-$1\necho p i\n", None);
        plain.allocate(&options("pvc-u1")).await.unwrap();
        plain.deallocate(&volume).await.unwrap();
        assert!(plain.exists("pvc-u1").await.unwrap());

        let scripted = backend(&dir, "echo p i\n", Some("rm iscsi-volume-$1\n"));
        scripted.deallocate(&volume).await.unwrap();
        assert!(!scripted.exists("pvc-u1").await.unwrap());

        // Nothing left to remove
        assert!(scripted.deallocate(&volume).await.is_err());
    }

    #[test]
    fn test_config_requires_script() {
        let config = BackendConfig::default();
        assert_matches!(ScriptConfig::from_backend(&config), Err(Error::Configuration(_)));

        let config = BackendConfig {
            script_path: Some("provision.sh".into()),
            ..Default::default()
        };
        let script = ScriptConfig::from_backend(&config).unwrap();
        assert!(script.script.is_absolute());
        assert!(script.artifact_dir.is_absolute());
        assert!(script.delete_script.is_none());
    }
}
