//! # vmkeeper Compute
//!
//! Lifecycle management and address discovery for libvirt virtual machines.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Server                    │
//! │  (save, start, stop, destroy, ssh, ...) │
//! └──────┬──────────────┬───────────────┬───┘
//!        │              │               │
//!        ▼              ▼               ▼
//! ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//! │   Volume    │ │   Address   │ │  Cloud-init │
//! │ Provisioner │ │  Resolver   │ │  ISO image  │
//! └──────┬──────┘ └──┬───────┬──┘ └──────┬──────┘
//!        ▼           ▼       ▼           ▼
//!   HypervisorConnection  CommandExecutor  ImageBuilder
//!   (virsh / libvirt /    (OpenSSH / mock) (genisoimage / mock)
//!    mock)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vmkeeper_compute::{ComputeConfig, ComputeService, ServerAttributes};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = ComputeService::from_config(ComputeConfig::default())?;
//!
//!     let mut server = service.new_server(ServerAttributes {
//!         name: Some("web-1".to_string()),
//!         volume_template_name: Some("ubuntu-22.04.qcow2".to_string()),
//!         volume_format_type: Some("qcow2".to_string()),
//!         ..Default::default()
//!     })?;
//!
//!     server.save().await?;
//!     server.start().await?;
//!     println!("{:?}", server.public_ip_address().await?);
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod cloudinit;
pub mod config;
pub mod error;
pub mod libvirt;
pub mod mock;
pub mod provisioner;
pub mod remote;
pub mod server;
pub mod service;
pub mod traits;
pub mod types;
pub mod uri;
pub mod virsh;
pub mod xml;

pub use address::{AddressOptions, AddressResolver, AddressStrategy, DEFAULT_IP_COMMAND};
pub use cloudinit::{generate_config_iso, ConfigIso, GenisoimageBuilder};
pub use config::{ComputeConfig, ConnectionBackend, SetupConfig};
pub use error::{ComputeError, ConnectionError, Result, SessionError};
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtConnection;
pub use mock::{MockConnection, MockExecutor, MockHarness, MockImageBuilder};
pub use provisioner::{VolumeProvisioner, VolumeRequest};
pub use remote::{CommandResult, OpenSshExecutor, SessionOptions};
pub use server::{DestroyOptions, Server, ServerAttributes};
pub use service::ComputeService;
pub use traits::{CommandExecutor, HypervisorConnection, ImageBuilder};
pub use types::*;
pub use uri::{ConnectionUri, Transport};
pub use virsh::VirshConnection;
