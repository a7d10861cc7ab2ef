//! [`HypervisorConnection`] over the `virt` bindings.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{Error as VirtError, ErrorNumber};
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::stream::Stream;
use virt::sys;

use crate::error::{ComputeError, ConnectionError, Result};
use crate::traits::{ConnectionResult, HypervisorConnection};
use crate::types::*;
use crate::uri::ConnectionUri;
use crate::xml::{graphics_xml, parse_disk_sources, parse_graphics, parse_interfaces, volume_xml};

/// Bytes pushed per stream write during uploads.
const UPLOAD_CHUNK: usize = 256 * 1024;

/// Native libvirt connection.
pub struct LibvirtConnection {
    uri: ConnectionUri,
    connection: Connect,
    default_pool: String,
    default_capacity: String,
}

impl LibvirtConnection {
    /// Open a connection to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub fn new(uri: &str) -> Result<Self> {
        let parsed = ConnectionUri::parse(uri)?;
        info!(uri = %parsed, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| ComputeError::hypervisor(format!("Failed to connect to {}", uri), virt_error("open", e)))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: parsed,
            connection,
            default_pool: "default".to_string(),
            default_capacity: "10G".to_string(),
        })
    }

    /// Pool and capacity used when a volume request names none.
    pub fn with_volume_defaults(mut self, pool: impl Into<String>, capacity: impl Into<String>) -> Self {
        self.default_pool = pool.into();
        self.default_capacity = capacity.into();
        self
    }

    fn get_domain(&self, uuid: &str) -> ConnectionResult<Domain> {
        Domain::lookup_by_uuid_string(&self.connection, uuid)
            .map_err(|e| virt_error(&format!("domain {}", uuid), e))
    }

    fn get_pool(&self, name: &str) -> ConnectionResult<StoragePool> {
        StoragePool::lookup_by_name(&self.connection, name)
            .map_err(|e| virt_error(&format!("pool {}", name), e))
    }

    fn get_volume(&self, volume: &Volume) -> ConnectionResult<(StoragePool, StorageVol)> {
        let pool = self.get_pool(volume.pool_name.as_deref().unwrap_or(&self.default_pool))?;
        let vol = StorageVol::lookup_by_name(&pool, &volume.name)
            .map_err(|e| virt_error(&format!("volume {}", volume.name), e))?;
        Ok((pool, vol))
    }

    fn handle(domain: &Domain) -> ConnectionResult<DomainHandle> {
        Ok(DomainHandle {
            uuid: domain.get_uuid_string().map_err(|e| virt_error("domain uuid", e))?,
            name: domain.get_name().map_err(|e| virt_error("domain name", e))?,
        })
    }

    fn volume_record(pool: &StoragePool, vol: &StorageVol) -> ConnectionResult<Volume> {
        let pool_name = pool.get_name().map_err(|e| virt_error("pool name", e))?;
        let name = vol.get_name().map_err(|e| virt_error("volume name", e))?;
        let path = vol.get_path().map_err(|e| virt_error(&format!("volume {}", name), e))?;
        Ok(Volume::new(name).with_path(path).with_pool(pool_name))
    }

    /// Convert libvirt domain state to [`DomainState`].
    fn state_from_libvirt(state: sys::virDomainState) -> DomainState {
        match state {
            sys::VIR_DOMAIN_NOSTATE => DomainState::NoState,
            sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
            sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
            sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
            sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
            sys::VIR_DOMAIN_PMSUSPENDED => DomainState::PmSuspended,
            other => DomainState::Other(other.to_string()),
        }
    }
}

#[async_trait]
impl HypervisorConnection for LibvirtConnection {
    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> ConnectionResult<DomainHandle> {
        let domain = Domain::define_xml(&self.connection, xml).map_err(|e| virt_error("define", e))?;
        let handle = Self::handle(&domain)?;

        info!(vm_id = %handle.uuid, vm_name = %handle.name, "Domain defined");
        Ok(handle)
    }

    #[instrument(skip(self, xml))]
    async fn create_domain(&self, xml: &str) -> ConnectionResult<DomainHandle> {
        let domain = Domain::create_xml(&self.connection, xml, sys::VIR_DOMAIN_NONE)
            .map_err(|e| virt_error("create", e))?;
        let handle = Self::handle(&domain)?;

        info!(vm_id = %handle.uuid, vm_name = %handle.name, "Transient domain created");
        Ok(handle)
    }

    #[instrument(skip(self), fields(vm_id = %uuid))]
    async fn domain_action(&self, uuid: &str, action: DomainAction) -> ConnectionResult<bool> {
        let domain = self.get_domain(uuid)?;

        let outcome = match action {
            DomainAction::Create => domain.create().map(|_| ()),
            DomainAction::Destroy => domain.destroy().map(|_| ()),
            DomainAction::Reboot => domain.reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT).map(|_| ()),
            DomainAction::Shutdown => domain.shutdown().map(|_| ()),
            DomainAction::Resume => domain.resume().map(|_| ()),
            DomainAction::Suspend => domain.suspend().map(|_| ()),
            DomainAction::Undefine => domain.undefine().map(|_| ()),
        };
        outcome.map_err(|e| virt_error(action.as_str(), e))?;

        debug!(action = %action, "Domain action applied");
        Ok(true)
    }

    async fn domain_info(&self, uuid: &str) -> ConnectionResult<DomainInfo> {
        let domain = self.get_domain(uuid)?;

        let info = domain.get_info().map_err(|e| virt_error("domain info", e))?;
        let xml = domain.get_xml_desc(0).map_err(|e| virt_error("domain XML", e))?;

        Ok(DomainInfo {
            uuid: uuid.to_string(),
            name: domain.get_name().map_err(|e| virt_error("domain name", e))?,
            state: Self::state_from_libvirt(info.state),
            active: domain.is_active().map_err(|e| virt_error("domain activity", e))?,
            cputime: info.cpu_time as u64,
            cpus: info.nr_virt_cpu as u32,
            memory_size: info.memory as u64,
            max_memory_size: info.max_mem as u64,
            persistent: domain.is_persistent().map_err(|e| virt_error("domain persistence", e))?,
            // Transient domains have no autostart flag
            autostart: domain.get_autostart().unwrap_or_default(),
            os_type: domain.get_os_type().ok(),
            nics: parse_interfaces(&xml),
            volume_paths: parse_disk_sources(&xml),
            display: parse_graphics(&xml),
        })
    }

    async fn update_autostart(&self, uuid: &str, autostart: bool) -> ConnectionResult<()> {
        self.get_domain(uuid)?
            .set_autostart(autostart)
            .map_err(|e| virt_error("autostart", e))?;
        Ok(())
    }

    async fn update_display(&self, uuid: &str, display: &Display) -> ConnectionResult<()> {
        let xml = graphics_xml(display, "");
        self.get_domain(uuid)?
            .update_device_flags(&xml, sys::VIR_DOMAIN_AFFECT_CURRENT)
            .map_err(|e| virt_error("update graphics", e))?;
        Ok(())
    }

    async fn list_volumes(&self, filter: &VolumeFilter) -> ConnectionResult<Vec<Volume>> {
        let pools = self
            .connection
            .list_all_storage_pools(0)
            .map_err(|e| virt_error("list pools", e))?;

        let mut volumes = Vec::new();
        for pool in &pools {
            let vols = match pool.list_all_volumes(0) {
                Ok(vols) => vols,
                Err(e) => {
                    // Inactive pools cannot be listed
                    warn!(error = %e, "Skipping pool");
                    continue;
                }
            };
            for vol in &vols {
                let volume = Self::volume_record(pool, vol)?;
                if filter.matches(&volume) {
                    volumes.push(volume);
                }
            }
        }

        debug!(count = volumes.len(), "Listed volumes");
        Ok(volumes)
    }

    #[instrument(skip(self, options), fields(volume = %options.name))]
    async fn create_volume(&self, options: &VolumeOptions) -> ConnectionResult<Volume> {
        let pool = self.get_pool(options.pool_name.as_deref().unwrap_or(&self.default_pool))?;
        let xml = volume_xml(options, Some(&self.default_capacity));

        let vol = StorageVol::create_xml(&pool, &xml, 0).map_err(|e| virt_error("create volume", e))?;

        Ok(Volume {
            capacity: Some(options.capacity.clone().unwrap_or_else(|| self.default_capacity.clone())),
            allocation: options.allocation.clone(),
            format_type: options.format_type.clone(),
            ..Self::volume_record(&pool, &vol)?
        })
    }

    #[instrument(skip(self, source), fields(source = %source.name, target = %name))]
    async fn clone_volume(&self, source: &Volume, name: &str) -> ConnectionResult<Volume> {
        let (pool, source_vol) = self.get_volume(source)?;
        let xml = volume_xml(
            &VolumeOptions {
                name: name.to_string(),
                format_type: source.format_type.clone(),
                ..Default::default()
            },
            None,
        );

        let vol = StorageVol::create_xml_from(&pool, &xml, &source_vol, 0)
            .map_err(|e| virt_error("clone volume", e))?;
        let record = Self::volume_record(&pool, &vol)?;

        Ok(Volume {
            name: record.name,
            path: record.path,
            pool_name: record.pool_name,
            backing_volume: Some(source.name.clone()),
            ..source.clone()
        })
    }

    async fn upload_volume(&self, volume: &Volume, image: &Path) -> ConnectionResult<()> {
        let data = std::fs::read(image)
            .map_err(|e| ConnectionError::Failed(format!("failed to read {}: {}", image.display(), e)))?;
        let (_, vol) = self.get_volume(volume)?;

        let stream = Stream::new(&self.connection, 0).map_err(|e| virt_error("open stream", e))?;
        vol.upload(&stream, 0, data.len() as u64, 0)
            .map_err(|e| virt_error("upload volume", e))?;

        for chunk in data.chunks(UPLOAD_CHUNK) {
            let mut sent = 0;
            while sent < chunk.len() {
                sent += stream
                    .send(&chunk[sent..])
                    .map_err(|e| virt_error("upload volume", e))?;
            }
        }
        stream.finish().map_err(|e| virt_error("upload volume", e))?;

        debug!(volume = %volume.name, bytes = data.len(), "Volume uploaded");
        Ok(())
    }

    async fn delete_volume(&self, volume: &Volume) -> ConnectionResult<()> {
        let (_, vol) = self.get_volume(volume)?;
        vol.delete(0).map_err(|e| virt_error("delete volume", e))?;
        Ok(())
    }

    async fn list_networks(&self) -> ConnectionResult<Vec<VirtualNetwork>> {
        let networks = self
            .connection
            .list_all_networks(0)
            .map_err(|e| virt_error("list networks", e))?;

        networks
            .iter()
            .map(|network| {
                Ok(VirtualNetwork {
                    name: network.get_name().map_err(|e| virt_error("network name", e))?,
                    active: network.is_active().map_err(|e| virt_error("network state", e))?,
                })
            })
            .collect()
    }

    /// Leases are read through each running domain's lease-sourced
    /// interface addresses; they carry no expiry.
    async fn network_dhcp_leases(&self, network: &str, mac: &str) -> ConnectionResult<LeaseQuery> {
        Network::lookup_by_name(&self.connection, network)
            .map_err(|e| virt_error(&format!("network {}", network), e))?;

        let domains = self
            .connection
            .list_all_domains(sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE)
            .map_err(|e| virt_error("list domains", e))?;

        let mut leases = Vec::new();
        for domain in &domains {
            let interfaces = match domain.interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0) {
                Ok(interfaces) => interfaces,
                Err(e) if matches!(e.code(), ErrorNumber::NoSupport) => return Ok(LeaseQuery::Unsupported),
                Err(e) => {
                    debug!(error = %e, "Skipping domain without lease data");
                    continue;
                }
            };
            let hostname = domain.get_name().ok();

            for interface in interfaces {
                if !mac.is_empty() && !interface.hwaddr.eq_ignore_ascii_case(mac) {
                    continue;
                }
                leases.extend(
                    interface
                        .addrs
                        .iter()
                        .filter(|a| a.addr.parse::<Ipv4Addr>().is_ok())
                        .map(|a| DhcpLease {
                            ipaddr: a.addr.clone(),
                            mac: interface.hwaddr.clone(),
                            expirytime: 0,
                            hostname: hostname.clone(),
                        }),
                );
            }
        }

        Ok(LeaseQuery::Supported(leases))
    }

    async fn lib_version(&self) -> ConnectionResult<u64> {
        let version = self
            .connection
            .get_lib_version()
            .map_err(|e| virt_error("library version", e))?;
        Ok(version as u64)
    }

    fn uri(&self) -> &ConnectionUri {
        &self.uri
    }
}

fn virt_error(context: &str, e: VirtError) -> ConnectionError {
    let message = format!("{}: {}", context, e);
    match e.code() {
        ErrorNumber::NoDomain | ErrorNumber::NoNetwork | ErrorNumber::NoStoragePool | ErrorNumber::NoStorageVol => {
            ConnectionError::NotFound(message)
        }
        ErrorNumber::NoSupport => ConnectionError::Unsupported(message),
        _ => ConnectionError::Failed(message),
    }
}
