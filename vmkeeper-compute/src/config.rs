//! Configuration for the compute layer.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default libvirt connection URI.
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

/// Directory holding first-boot ISOs on a stock libvirt host.
pub const DEFAULT_ISO_DIR: &str = "/var/lib/libvirt/images";

/// Which [`HypervisorConnection`](crate::HypervisorConnection) to wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionBackend {
    /// Drive the `virsh` CLI
    #[default]
    Virsh,
    /// Native libvirt bindings (needs the `libvirt` feature)
    Libvirt,
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Connection backend
    pub backend: ConnectionBackend,
    /// libvirt connection URI
    pub libvirt_uri: String,
    /// virsh binary used by [`VirshConnection`](crate::VirshConnection)
    pub virsh_path: String,
    /// Global override of the IP discovery command template
    pub ip_command: Option<String>,
    /// Explicit ISO tool (genisoimage, mkisofs, xorrisofs); detected when unset
    pub iso_tool: Option<String>,
    /// Pool used when a volume request names none
    pub default_pool: String,
    /// Capacity used when a volume request gives none
    pub default_capacity: String,
    /// Reachability polling for key setup
    pub setup: SetupConfig,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            backend: ConnectionBackend::default(),
            libvirt_uri: DEFAULT_LIBVIRT_URI.to_string(),
            virsh_path: "virsh".to_string(),
            ip_command: None,
            iso_tool: None,
            default_pool: "default".to_string(),
            default_capacity: "10G".to_string(),
            setup: SetupConfig::default(),
        }
    }
}

impl ComputeConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ComputeConfig = serde_yaml::from_str(content)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let setup = &self.setup;
        if setup.timeout_secs == 0 || setup.attempt_timeout_secs == 0 {
            bail!("setup timeouts must be greater than zero");
        }
        if setup.attempt_timeout_secs > setup.timeout_secs {
            bail!(
                "setup.attempt_timeout_secs ({}) exceeds setup.timeout_secs ({})",
                setup.attempt_timeout_secs,
                setup.timeout_secs
            );
        }
        Ok(())
    }
}

/// Bounds for the `setup` reachability loop, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// Overall budget for the host to become reachable
    pub timeout_secs: u64,
    /// Budget for one reachability attempt
    pub attempt_timeout_secs: u64,
    /// Session timeout passed to the executor for each attempt
    pub session_timeout_secs: u64,
    /// Pause after a refused connection
    pub refused_backoff_secs: u64,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 360,
            attempt_timeout_secs: 8,
            session_timeout_secs: 4,
            refused_backoff_secs: 2,
        }
    }
}

impl SetupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn refused_backoff(&self) -> Duration {
        Duration::from_secs(self.refused_backoff_secs)
    }
}
