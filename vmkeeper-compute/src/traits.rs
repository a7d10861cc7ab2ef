//! Collaborator interfaces.
//!
//! A [`Server`](crate::Server) never talks to libvirt, ssh or ISO tooling
//! directly. It goes through these traits so that backends can be swapped
//! (`virsh`, OpenSSH, genisoimage in production; the in-memory doubles in
//! [`mock`](crate::mock) for tests).

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{ConnectionError, SessionError};
use crate::remote::{CommandResult, SessionOptions};
use crate::types::*;
use crate::uri::ConnectionUri;

/// Result type for hypervisor connection calls.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Connection to a libvirt hypervisor.
#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    // =========================================================================
    // Domains
    // =========================================================================

    /// Define a persistent domain from XML.
    async fn define_domain(&self, xml: &str) -> ConnectionResult<DomainHandle>;

    /// Create and start a transient domain from XML.
    async fn create_domain(&self, xml: &str) -> ConnectionResult<DomainHandle>;

    /// Apply a lifecycle action to the domain with the given UUID.
    ///
    /// Returns the hypervisor's outcome for the action.
    async fn domain_action(&self, uuid: &str, action: DomainAction) -> ConnectionResult<bool>;

    /// Read the authoritative state of a domain.
    async fn domain_info(&self, uuid: &str) -> ConnectionResult<DomainInfo>;

    async fn update_autostart(&self, uuid: &str, autostart: bool) -> ConnectionResult<()>;

    /// Replace the graphics device settings of a domain.
    async fn update_display(&self, uuid: &str, display: &Display) -> ConnectionResult<()>;

    // =========================================================================
    // Storage
    // =========================================================================

    async fn list_volumes(&self, filter: &VolumeFilter) -> ConnectionResult<Vec<Volume>>;

    async fn create_volume(&self, options: &VolumeOptions) -> ConnectionResult<Volume>;

    /// Clone `source` into a new volume named `name` in the same pool.
    async fn clone_volume(&self, source: &Volume, name: &str) -> ConnectionResult<Volume>;

    /// Upload a local file as the content of `volume`.
    async fn upload_volume(&self, volume: &Volume, image: &Path) -> ConnectionResult<()>;

    async fn delete_volume(&self, volume: &Volume) -> ConnectionResult<()>;

    // =========================================================================
    // Networks
    // =========================================================================

    async fn list_networks(&self) -> ConnectionResult<Vec<VirtualNetwork>>;

    /// DHCP leases of `network`, filtered by `mac`.
    ///
    /// Connections that cannot report leases answer
    /// [`LeaseQuery::Unsupported`] instead of failing.
    async fn network_dhcp_leases(&self, network: &str, mac: &str) -> ConnectionResult<LeaseQuery>;

    // =========================================================================
    // Connection metadata
    // =========================================================================

    /// libvirt library version, `major * 1_000_000 + minor * 1_000 + release`.
    async fn lib_version(&self) -> ConnectionResult<u64>;

    fn uri(&self) -> &ConnectionUri;
}

/// Executes commands on a remote host over an authenticated session.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run each command in order on `host` as `user`.
    ///
    /// Returns one result per command. A non-zero exit status is a result,
    /// not an error; errors are reserved for session failures.
    async fn run(
        &self,
        host: &str,
        user: Option<&str>,
        options: &SessionOptions,
        commands: &[String],
    ) -> std::result::Result<Vec<CommandResult>, SessionError>;

    /// Copy a local file to `remote_path` on `host`.
    async fn upload(
        &self,
        host: &str,
        user: Option<&str>,
        options: &SessionOptions,
        local_path: &Path,
        remote_path: &str,
    ) -> std::result::Result<(), SessionError>;
}

/// Produces first-boot configuration images.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Package `user-data` and `meta-data` from `source_dir` into an ISO9660
    /// image with volume id `cidata`.
    ///
    /// The image is written next to `source_dir` (`<source_dir>.iso`), so a
    /// caller that scopes `source_dir`'s parent cleans up both.
    async fn build(&self, source_dir: &Path) -> std::io::Result<PathBuf>;
}
