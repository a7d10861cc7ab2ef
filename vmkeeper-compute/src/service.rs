//! Collaborators shared by every server of one hypervisor connection.

use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cloudinit::GenisoimageBuilder;
use crate::config::{ComputeConfig, ConnectionBackend};
use crate::error::Result;
use crate::remote::OpenSshExecutor;
use crate::server::{Server, ServerAttributes};
use crate::traits::{CommandExecutor, HypervisorConnection, ImageBuilder};
use crate::virsh::VirshConnection;

/// Hypervisor connection, remote executor, image builder and configuration.
///
/// Cheap to clone; servers hold their own copy.
#[derive(Clone)]
pub struct ComputeService {
    pub connection: Arc<dyn HypervisorConnection>,
    pub executor: Arc<dyn CommandExecutor>,
    pub image_builder: Arc<dyn ImageBuilder>,
    pub config: Arc<ComputeConfig>,
}

impl ComputeService {
    pub fn new(
        connection: Arc<dyn HypervisorConnection>,
        executor: Arc<dyn CommandExecutor>,
        image_builder: Arc<dyn ImageBuilder>,
        config: ComputeConfig,
    ) -> Self {
        Self {
            connection,
            executor,
            image_builder,
            config: Arc::new(config),
        }
    }

    /// Wire the configured connection with the OpenSSH and genisoimage backends.
    pub fn from_config(config: ComputeConfig) -> Result<Self> {
        let connection: Arc<dyn HypervisorConnection> = match config.backend {
            ConnectionBackend::Virsh => Arc::new(Self::virsh_connection(&config)?),
            ConnectionBackend::Libvirt => {
                #[cfg(feature = "libvirt")]
                {
                    Arc::new(
                        crate::libvirt::LibvirtConnection::new(&config.libvirt_uri)?
                            .with_volume_defaults(config.default_pool.clone(), config.default_capacity.clone()),
                    )
                }
                #[cfg(not(feature = "libvirt"))]
                {
                    warn!("Libvirt connection requested but not compiled in, falling back to virsh");
                    Arc::new(Self::virsh_connection(&config)?)
                }
            }
        };
        let image_builder = match &config.iso_tool {
            Some(tool) => GenisoimageBuilder::with_tool(tool.clone()),
            None => GenisoimageBuilder::new(),
        };

        info!(
            uri = %config.libvirt_uri,
            backend = ?config.backend,
            iso_tool = %image_builder.tool(),
            "Compute service initialized"
        );

        Ok(Self::new(
            connection,
            Arc::new(OpenSshExecutor::new()),
            Arc::new(image_builder),
            config,
        ))
    }

    fn virsh_connection(config: &ComputeConfig) -> Result<VirshConnection> {
        Ok(VirshConnection::new(&config.libvirt_uri, &config.virsh_path)?
            .with_volume_defaults(config.default_pool.clone(), config.default_capacity.clone()))
    }

    /// Build a new, unsaved server bound to this service.
    pub fn new_server(&self, attributes: ServerAttributes) -> Result<Server> {
        Server::new(self.clone(), attributes)
    }

    /// Load an existing server by UUID.
    pub async fn get_server(&self, id: &str) -> Result<Server> {
        Server::get(self.clone(), id).await
    }
}

impl fmt::Debug for ComputeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeService")
            .field("uri", &self.connection.uri().as_str())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
