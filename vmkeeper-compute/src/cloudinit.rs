//! Cloud-init NoCloud first-boot images.
//!
//! The NoCloud datasource reads a disk labelled `cidata` holding:
//! - `meta-data` - instance metadata (left empty here)
//! - `user-data` - cloud-config or shell script, passed through untouched
//!
//! [`generate_config_iso`] stages both files in a scoped temporary directory
//! and hands it to an [`ImageBuilder`]. The directory, and the image built
//! next to it, are removed when the returned [`ConfigIso`] is dropped or when
//! any step fails.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::error::{ComputeError, Result};
use crate::traits::ImageBuilder;

/// A built first-boot image living in a scoped temp directory.
#[derive(Debug)]
pub struct ConfigIso {
    _workdir: TempDir,
    iso_path: PathBuf,
}

impl ConfigIso {
    pub fn path(&self) -> &Path {
        &self.iso_path
    }

    /// Image size in bytes.
    pub fn size(&self) -> Result<u64> {
        std::fs::metadata(&self.iso_path)
            .map(|m| m.len())
            .map_err(|e| ComputeError::io(format!("Failed to stat {}", self.iso_path.display()), e))
    }
}

/// Stage `user_data` and build a NoCloud ISO from it.
#[instrument(skip_all)]
pub async fn generate_config_iso(builder: &dyn ImageBuilder, user_data: &str) -> Result<ConfigIso> {
    let workdir = tempfile::Builder::new()
        .prefix("config")
        .tempdir()
        .map_err(|e| ComputeError::io("Failed to create temp dir", e))?;

    let source_dir = workdir.path().join("cidata");
    std::fs::create_dir(&source_dir)
        .map_err(|e| ComputeError::io("Failed to create cidata dir", e))?;

    std::fs::write(source_dir.join("meta-data"), "")
        .map_err(|e| ComputeError::io("Failed to write meta-data", e))?;
    std::fs::write(source_dir.join("user-data"), user_data)
        .map_err(|e| ComputeError::io("Failed to write user-data", e))?;
    debug!(dir = %source_dir.display(), bytes = user_data.len(), "Staged cloud-init files");

    let iso_path = builder.build(&source_dir).await.map_err(|e| {
        ComputeError::io("Couldn't generate cloud-init iso disk", e)
            .into_provisioning("Failed to build first-boot image")
    })?;

    info!(path = %iso_path.display(), "Cloud-init ISO generated");

    Ok(ConfigIso {
        _workdir: workdir,
        iso_path,
    })
}

/// [`ImageBuilder`] running genisoimage or a compatible tool.
#[derive(Debug, Clone)]
pub struct GenisoimageBuilder {
    /// Path to genisoimage/mkisofs binary
    iso_tool: String,
}

impl Default for GenisoimageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GenisoimageBuilder {
    /// Create a builder using the first ISO tool found on the host.
    pub fn new() -> Self {
        Self {
            iso_tool: Self::find_iso_tool(),
        }
    }

    /// Create a builder using an explicit tool.
    pub fn with_tool(iso_tool: impl Into<String>) -> Self {
        Self {
            iso_tool: iso_tool.into(),
        }
    }

    pub fn tool(&self) -> &str {
        &self.iso_tool
    }

    /// Find the ISO generation tool (genisoimage or mkisofs).
    fn find_iso_tool() -> String {
        // genisoimage (Debian/Ubuntu), mkisofs (RHEL), xorrisofs (modern)
        for tool in ["genisoimage", "mkisofs", "xorrisofs"] {
            if std::process::Command::new(tool).arg("--version").output().is_ok() {
                return tool.to_string();
            }
        }

        // Fails later with a helpful error if not installed
        "genisoimage".to_string()
    }

    /// Arguments producing `output` from the files in `source_dir`.
    fn iso_args(output: &Path, source_dir: &Path) -> Vec<String> {
        vec![
            "-output".to_string(),
            output.to_string_lossy().to_string(),
            "-volid".to_string(),
            "cidata".to_string(),
            "-joliet".to_string(),
            "-rock".to_string(),
            source_dir.join("user-data").to_string_lossy().to_string(),
            source_dir.join("meta-data").to_string_lossy().to_string(),
        ]
    }
}

#[async_trait]
impl ImageBuilder for GenisoimageBuilder {
    #[instrument(skip(self), fields(tool = %self.iso_tool))]
    async fn build(&self, source_dir: &Path) -> std::io::Result<PathBuf> {
        let iso_path = source_dir.with_extension("iso");

        let output = Command::new(&self.iso_tool)
            .args(Self::iso_args(&iso_path, source_dir))
            .output()
            .await
            .map_err(|e| std::io::Error::new(e.kind(), format!("Failed to run {}: {}", self.iso_tool, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(std::io::Error::other(format!(
                "{} exited with {}: {}",
                self.iso_tool,
                output.status,
                stderr.trim()
            )));
        }

        Ok(iso_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockImageBuilder;

    #[test]
    fn test_iso_args() {
        let args = GenisoimageBuilder::iso_args(Path::new("/tmp/x/cidata.iso"), Path::new("/tmp/x/cidata"));
        assert_eq!(args[0..4], ["-output", "/tmp/x/cidata.iso", "-volid", "cidata"]);
        assert!(args.contains(&"-joliet".to_string()));
        assert!(args.contains(&"-rock".to_string()));
        assert!(args.contains(&"/tmp/x/cidata/user-data".to_string()));
        assert!(args.contains(&"/tmp/x/cidata/meta-data".to_string()));
    }

    #[tokio::test]
    async fn test_generate_config_iso_stages_files() {
        let builder = MockImageBuilder::new();
        let iso = generate_config_iso(&builder, "#cloud-config\nhostname: web-1\n")
            .await
            .unwrap();

        let source = builder.last_source_dir().unwrap();
        assert_eq!(
            std::fs::read_to_string(source.join("user-data")).unwrap(),
            "#cloud-config\nhostname: web-1\n"
        );
        assert_eq!(std::fs::read_to_string(source.join("meta-data")).unwrap(), "");
        assert!(iso.size().unwrap() > 0);

        let iso_path = iso.path().to_path_buf();
        drop(iso);
        assert!(!iso_path.exists());
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_failed_build_cleans_up() {
        let builder = MockImageBuilder::failing();
        let err = generate_config_iso(&builder, "#cloud-config\n").await.unwrap_err();

        assert!(matches!(err, ComputeError::Provisioning { .. }));
        assert!(!builder.last_source_dir().unwrap().exists());
    }
}
