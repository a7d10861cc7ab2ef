//! The server entity and its lifecycle.
//!
//! A [`Server`] is built in memory from [`ServerAttributes`], persisted with
//! [`Server::save`], and then driven through start/stop/reboot/... Every
//! mutating call is followed by a refresh so the cached attributes match the
//! hypervisor.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

use crate::address::{AddressOptions, AddressResolver, AddressStrategy, AddressTarget};
use crate::cloudinit::generate_config_iso;
use crate::config::DEFAULT_ISO_DIR;
use crate::error::{ComputeError, ConnectionError, Result, SessionError};
use crate::provisioner::{VolumeProvisioner, VolumeRequest};
use crate::remote::{proxy_command, CommandResult, SessionOptions};
use crate::service::ComputeService;
use crate::types::*;
use crate::xml::DomainXmlBuilder;

/// Default memory, KiB.
pub const DEFAULT_MEMORY_KIB: u64 = 256 * 1024;

/// Construction parameters for a [`Server`].
///
/// Every field is optional; unset fields take the documented defaults.
/// Deserializable, so servers can be described in YAML or JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerAttributes {
    /// Hypervisor UUID
    #[serde(alias = "uuid")]
    pub id: Option<String>,
    pub name: Option<String>,
    pub arch: Option<String>,
    pub os_type: Option<String>,
    pub domain_type: Option<String>,
    pub cpus: Option<u32>,
    /// CPU descriptor, e.g. `mode`, `model`
    pub cpu: Option<BTreeMap<String, String>>,
    /// KiB
    pub memory_size: Option<u64>,
    /// KiB
    pub max_memory_size: Option<u64>,
    pub hugepages: Option<bool>,
    pub guest_agent: Option<bool>,
    /// RNG descriptor, e.g. `backend_model`, `backend_path`
    pub virtio_rng: Option<BTreeMap<String, String>>,
    /// Any combination of `cdrom`, `fd`, `hd`, `network`
    pub boot_order: Option<Vec<String>>,
    pub persistent: Option<bool>,
    pub autostart: Option<bool>,
    pub display: Option<Display>,
    pub nics: Option<Vec<Nic>>,
    pub volumes: Option<Vec<Volume>>,

    pub username: Option<String>,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub password: Option<String>,

    /// Raw domain XML, submitted as-is by `save`
    pub xml: Option<String>,
    pub network_interface_type: Option<NicType>,
    pub network_nat_network: Option<String>,
    pub network_bridge_name: Option<String>,
    pub volume_name: Option<String>,
    pub volume_pool_name: Option<String>,
    pub volume_format_type: Option<String>,
    pub volume_capacity: Option<String>,
    pub volume_allocation: Option<String>,
    pub volume_template_name: Option<String>,
    /// Cloud-init payload baked into a first-boot ISO by `save`
    pub user_data: Option<String>,
    pub iso_file: Option<String>,
    pub iso_dir: Option<String>,
}

/// Options for [`Server::destroy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Also delete every attached volume
    pub destroy_volumes: bool,
}

/// A virtual machine on a libvirt hypervisor.
#[derive(Debug)]
pub struct Server {
    service: ComputeService,

    id: Option<String>,
    pub(crate) name: String,
    pub(crate) arch: String,
    pub(crate) os_type: String,
    pub(crate) domain_type: String,
    pub(crate) cpus: u32,
    pub(crate) cpu: BTreeMap<String, String>,
    pub(crate) memory_size: u64,
    pub(crate) max_memory_size: u64,
    pub(crate) hugepages: bool,
    pub(crate) guest_agent: bool,
    pub(crate) virtio_rng: BTreeMap<String, String>,
    pub(crate) boot_order: Vec<BootDevice>,
    persistent: bool,
    autostart: bool,
    pub(crate) display: Display,

    // Refreshed from the hypervisor
    cputime: u64,
    active: bool,
    state: DomainState,
    pub(crate) nics: Vec<Nic>,
    volume_paths: Vec<String>,
    pub(crate) volumes: Option<Vec<Volume>>,

    username: String,
    public_key: Option<String>,
    private_key: Option<String>,
    password: Option<String>,

    // Only used to provision a new server
    xml: Option<String>,
    volume_request: VolumeRequest,
    user_data: Option<String>,
    pub(crate) iso_file: Option<String>,
    pub(crate) iso_dir: String,

    resolver: AddressResolver,
}

fn randomized_name() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("vmkeeper-{}", &hex[..12])
}

impl Server {
    /// Validate `attributes` and apply defaults. No hypervisor call is made.
    pub fn new(service: ComputeService, attributes: ServerAttributes) -> Result<Self> {
        let a = attributes;

        let boot_order = match &a.boot_order {
            Some(order) => BootDevice::parse_order(order)?,
            None => vec![BootDevice::Hd, BootDevice::Cdrom, BootDevice::Network],
        };

        let nics = match a.nics {
            Some(nics) if !nics.is_empty() => nics,
            _ => vec![Nic {
                nic_type: a.network_interface_type.unwrap_or_default(),
                network: Some(a.network_nat_network.unwrap_or_else(|| "default".to_string())),
                bridge: Some(a.network_bridge_name.unwrap_or_else(|| "br0".to_string())),
                ..Default::default()
            }],
        };

        let volumes = a.volumes.filter(|v| !v.is_empty());
        let memory_size = a.memory_size.unwrap_or(DEFAULT_MEMORY_KIB);

        let server = Self {
            service,
            id: a.id,
            name: a.name.unwrap_or_else(randomized_name),
            arch: a.arch.unwrap_or_else(|| "x86_64".to_string()),
            os_type: a.os_type.unwrap_or_else(|| "hvm".to_string()),
            domain_type: a.domain_type.unwrap_or_else(|| "kvm".to_string()),
            cpus: a.cpus.unwrap_or(1),
            cpu: a.cpu.unwrap_or_default(),
            memory_size,
            max_memory_size: a.max_memory_size.unwrap_or(memory_size),
            hugepages: a.hugepages.unwrap_or(false),
            guest_agent: a.guest_agent.unwrap_or(true),
            virtio_rng: a.virtio_rng.unwrap_or_default(),
            boot_order,
            persistent: a.persistent.unwrap_or(true),
            autostart: a.autostart.unwrap_or(false),
            display: a.display.unwrap_or_default(),
            cputime: 0,
            active: false,
            state: DomainState::default(),
            nics,
            volume_paths: Vec::new(),
            volumes,
            username: a.username.unwrap_or_else(|| "root".to_string()),
            public_key: a.public_key,
            private_key: a.private_key,
            password: a.password,
            xml: a.xml,
            volume_request: VolumeRequest {
                name: a.volume_name,
                pool_name: a.volume_pool_name,
                format_type: a.volume_format_type,
                capacity: a.volume_capacity,
                allocation: a.volume_allocation,
                template_name: a.volume_template_name,
            },
            user_data: a.user_data,
            iso_file: a.iso_file,
            iso_dir: a.iso_dir.unwrap_or_else(|| DEFAULT_ISO_DIR.to_string()),
            resolver: AddressResolver::new(),
        };

        debug!(vm_name = %server.name, "Server initialized");
        Ok(server)
    }

    /// Load an existing domain. Its volumes are resolved on first access.
    #[instrument(skip(service), fields(vm_id = %id))]
    pub async fn get(service: ComputeService, id: &str) -> Result<Self> {
        let info = service
            .connection
            .domain_info(id)
            .await
            .map_err(|e| ComputeError::hypervisor(format!("Failed to read domain {}", id), e))?;

        let mut server = Self::new(
            service,
            ServerAttributes {
                id: Some(id.to_string()),
                name: Some(info.name.clone()),
                ..Default::default()
            },
        )?;
        server.apply_info(info);
        Ok(server)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Provision storage and define the domain.
    ///
    /// Steps already completed are not undone when a later one fails.
    #[instrument(skip(self), fields(vm_name = %self.name))]
    pub async fn save(&mut self) -> Result<()> {
        if !self.is_new() {
            return Err(ComputeError::DuplicateResource(
                "Saving an existing server may create a duplicate".to_string(),
            ));
        }

        self.provision()
            .await
            .map_err(|e| e.into_provisioning("Error saving the server"))?;

        info!(vm_id = ?self.id, "Server saved");
        Ok(())
    }

    async fn provision(&mut self) -> Result<()> {
        if self.xml.is_none() && self.volumes.as_ref().map_or(true, Vec::is_empty) {
            let volumes = VolumeProvisioner::new(self.service.connection.as_ref())
                .provision(&self.name, &self.volume_request, self.volumes.take())
                .await?;
            self.volumes = Some(volumes);
        }

        if self.user_data.is_some() {
            self.create_user_data_iso().await?;
        }

        if self.xml.is_none() {
            self.xml = Some(DomainXmlBuilder::new(self).build());
        }
        let xml = self.xml.clone().unwrap_or_default();

        let conn = &self.service.connection;
        let defined = if self.persistent {
            conn.define_domain(&xml).await
        } else {
            conn.create_domain(&xml).await
        };
        let handle = defined
            .map_err(|e| ComputeError::hypervisor(format!("Failed to define domain {}", self.name), e))?;

        self.id = Some(handle.uuid);
        self.reload().await
    }

    /// Bake `user_data` into a first-boot ISO and upload it as a volume.
    #[instrument(skip(self), fields(vm_name = %self.name))]
    pub async fn create_user_data_iso(&mut self) -> Result<()> {
        let user_data = self
            .user_data
            .as_deref()
            .ok_or_else(|| ComputeError::Precondition("user_data".to_string()))?;

        let iso = generate_config_iso(self.service.image_builder.as_ref(), user_data).await?;
        let name = self.cloud_init_volume_name();
        let options = VolumeOptions {
            name: name.clone(),
            capacity: Some(format!("{}b", iso.size()?)),
            allocation: Some("0G".to_string()),
            ..Default::default()
        };

        let conn = &self.service.connection;
        let volume = conn
            .create_volume(&options)
            .await
            .map_err(|e| ComputeError::hypervisor(format!("Failed to create volume {}", name), e))?;
        conn.upload_volume(&volume, iso.path())
            .await
            .map_err(|e| ComputeError::hypervisor(format!("Failed to upload {}", name), e))?;

        if let Some(dir) = volume.path.as_deref().and_then(|p| Path::new(p).parent()) {
            self.iso_dir = dir.to_string_lossy().to_string();
        }
        self.iso_file = Some(name);

        info!(iso_file = ?self.iso_file, iso_dir = %self.iso_dir, "First-boot image uploaded");
        Ok(())
    }

    /// Re-read the domain from the hypervisor.
    pub async fn reload(&mut self) -> Result<()> {
        let id = self.require_id()?;

        match self.service.connection.domain_info(&id).await {
            Ok(info) => {
                self.apply_info(info);
                Ok(())
            }
            // Transient domains vanish once stopped
            Err(ConnectionError::NotFound(_)) if !self.persistent => {
                debug!(vm_id = %id, "Transient domain is gone");
                self.state = DomainState::Shutoff;
                self.active = false;
                Ok(())
            }
            Err(e) => Err(ComputeError::hypervisor(format!("Failed to read domain {}", id), e)),
        }
    }

    fn apply_info(&mut self, info: DomainInfo) {
        self.id = Some(info.uuid);
        self.name = info.name;
        self.state = info.state;
        self.active = info.active;
        self.cputime = info.cputime;
        self.cpus = info.cpus;
        self.memory_size = info.memory_size;
        self.max_memory_size = info.max_memory_size;
        self.persistent = info.persistent;
        self.autostart = info.autostart;
        if let Some(os_type) = info.os_type {
            self.os_type = os_type;
        }
        if !info.nics.is_empty() {
            self.nics = info.nics;
        }
        if let Some(display) = info.display {
            self.display = display;
        }
        self.volume_paths = info.volume_paths;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn action(&mut self, action: DomainAction) -> Result<bool> {
        let id = self.require_id()?;
        let status = self
            .service
            .connection
            .domain_action(&id, action)
            .await
            .map_err(|e| ComputeError::hypervisor(format!("Failed to {} domain {}", action, id), e))?;
        self.reload().await?;
        Ok(status)
    }

    /// Power on. Returns `true` at once when already active.
    #[instrument(skip(self), fields(vm_id = ?self.id, vm_name = %self.name))]
    pub async fn start(&mut self) -> Result<bool> {
        if self.active {
            return Ok(true);
        }
        info!("Starting server");
        self.action(DomainAction::Create).await
    }

    #[instrument(skip(self), fields(vm_id = ?self.id, vm_name = %self.name))]
    pub async fn reboot(&mut self) -> Result<bool> {
        info!("Rebooting server");
        self.action(DomainAction::Reboot).await
    }

    /// Hard power off.
    #[instrument(skip(self), fields(vm_id = ?self.id, vm_name = %self.name))]
    pub async fn poweroff(&mut self) -> Result<bool> {
        info!("Powering off server");
        self.action(DomainAction::Destroy).await
    }

    pub async fn halt(&mut self) -> Result<bool> {
        self.poweroff().await
    }

    /// Graceful ACPI shutdown.
    #[instrument(skip(self), fields(vm_id = ?self.id, vm_name = %self.name))]
    pub async fn shutdown(&mut self) -> Result<bool> {
        info!("Shutting down server");
        self.action(DomainAction::Shutdown).await
    }

    pub async fn stop(&mut self) -> Result<bool> {
        self.shutdown().await
    }

    #[instrument(skip(self), fields(vm_id = ?self.id, vm_name = %self.name))]
    pub async fn suspend(&mut self) -> Result<bool> {
        info!("Suspending server");
        self.action(DomainAction::Suspend).await
    }

    #[instrument(skip(self), fields(vm_id = ?self.id, vm_name = %self.name))]
    pub async fn resume(&mut self) -> Result<bool> {
        info!("Resuming server");
        self.action(DomainAction::Resume).await
    }

    /// Power off unless stopped, undefine, and optionally delete volumes.
    #[instrument(skip(self), fields(vm_id = ?self.id, vm_name = %self.name))]
    pub async fn destroy(&mut self, options: DestroyOptions) -> Result<bool> {
        let id = self.require_id()?;

        if !self.is_stopped() {
            self.poweroff().await?;
        }

        let volumes = if options.destroy_volumes {
            self.volumes().await?.to_vec()
        } else {
            Vec::new()
        };

        let conn = &self.service.connection;
        match conn.domain_action(&id, DomainAction::Undefine).await {
            Ok(_) => {}
            // A transient domain is gone once powered off
            Err(ConnectionError::NotFound(_)) if !self.persistent => {
                debug!("Transient domain already gone, nothing to undefine");
            }
            Err(e) => {
                return Err(ComputeError::hypervisor(format!("Failed to undefine domain {}", id), e));
            }
        }

        for volume in &volumes {
            conn.delete_volume(volume)
                .await
                .map_err(|e| ComputeError::hypervisor(format!("Failed to delete volume {}", volume.name), e))?;
            debug!(volume = %volume.name, "Volume deleted");
        }

        info!(volumes = volumes.len(), "Server destroyed");
        Ok(true)
    }

    /// Set the autostart flag on the hypervisor. No refresh follows.
    pub async fn update_autostart(&mut self, autostart: bool) -> Result<()> {
        let id = self.require_id()?;
        self.service
            .connection
            .update_autostart(&id, autostart)
            .await
            .map_err(|e| ComputeError::hypervisor(format!("Failed to set autostart on {}", id), e))?;
        self.autostart = autostart;
        Ok(())
    }

    /// Replace the graphics settings, then refresh.
    #[instrument(skip(self, display), fields(vm_id = ?self.id))]
    pub async fn update_display(&mut self, display: Display) -> Result<()> {
        let id = self.require_id()?;
        self.service
            .connection
            .update_display(&id, &display)
            .await
            .map_err(|e| ComputeError::hypervisor(format!("Failed to update display of {}", id), e))?;
        self.display = display;
        self.reload().await
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_stopped(&self) -> bool {
        self.state == DomainState::Shutoff
    }

    pub fn is_ready(&self) -> bool {
        self.state == DomainState::Running
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_autostart(&self) -> bool {
        self.autostart
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn os_type(&self) -> &str {
        &self.os_type
    }

    pub fn domain_type(&self) -> &str {
        &self.domain_type
    }

    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    pub fn cpu(&self) -> &BTreeMap<String, String> {
        &self.cpu
    }

    /// KiB
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    /// KiB
    pub fn max_memory_size(&self) -> u64 {
        self.max_memory_size
    }

    pub fn hugepages(&self) -> bool {
        self.hugepages
    }

    pub fn guest_agent(&self) -> bool {
        self.guest_agent
    }

    pub fn virtio_rng(&self) -> &BTreeMap<String, String> {
        &self.virtio_rng
    }

    pub fn boot_order(&self) -> &[BootDevice] {
        &self.boot_order
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn display(&self) -> &Display {
        &self.display
    }

    /// CPU time consumed, nanoseconds.
    pub fn cputime(&self) -> u64 {
        self.cputime
    }

    pub fn state(&self) -> &DomainState {
        &self.state
    }

    pub fn nics(&self) -> &[Nic] {
        &self.nics
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    /// The definition submitted (or to be submitted) to the hypervisor.
    pub fn xml(&self) -> Option<&str> {
        self.xml.as_deref()
    }

    pub fn user_data(&self) -> Option<&str> {
        self.user_data.as_deref()
    }

    pub fn iso_file(&self) -> Option<&str> {
        self.iso_file.as_deref()
    }

    pub fn iso_dir(&self) -> &str {
        &self.iso_dir
    }

    /// MAC of the first NIC.
    pub fn mac(&self) -> Option<&str> {
        self.nics.first().and_then(|n| n.mac.as_deref())
    }

    pub fn cloud_init_volume_name(&self) -> String {
        format!("{}-cloud-init.iso", self.name)
    }

    #[deprecated(note = "use display().port")]
    pub fn vnc_port(&self) -> &str {
        warn!(vm_name = %self.name, "Server::vnc_port is deprecated, use display().port instead");
        &self.display.port
    }

    /// Attached volumes, looked up by disk path on first access.
    pub async fn volumes(&mut self) -> Result<&[Volume]> {
        if self.volumes.is_none() {
            let mut resolved = Vec::with_capacity(self.volume_paths.len());
            for path in &self.volume_paths {
                let found = self
                    .service
                    .connection
                    .list_volumes(&VolumeFilter::by_path(path.clone()))
                    .await
                    .map_err(|e| ComputeError::hypervisor(format!("Failed to look up volume {}", path), e))?;
                match found.into_iter().next() {
                    Some(volume) => resolved.push(volume),
                    None => warn!(path = %path, "No volume found for disk"),
                }
            }
            self.volumes = Some(resolved);
        }

        Ok(self.volumes.as_deref().unwrap_or_default())
    }

    /// Path of the first volume.
    pub async fn disk_path(&mut self) -> Result<Option<String>> {
        Ok(self.volumes().await?.first().and_then(|v| v.path.clone()))
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    /// Addresses of the server, looked up with the strategy selected on
    /// first call.
    pub async fn addresses(&mut self, options: &AddressOptions) -> Result<Addresses> {
        let target = AddressTarget {
            name: &self.name,
            mac: self.nics.first().and_then(|n| n.mac.as_deref()),
            nics: &self.nics,
        };
        self.resolver.resolve(&self.service, target, options).await
    }

    /// The address lookup strategy, once selected.
    pub fn address_strategy(&self) -> Option<AddressStrategy> {
        self.resolver.strategy()
    }

    pub async fn public_ip_address(&mut self) -> Result<Option<String>> {
        let addresses = self.addresses(&AddressOptions::default()).await?;
        Ok(addresses.public.into_iter().next())
    }

    pub async fn private_ip_address(&mut self) -> Result<Option<String>> {
        let addresses = self.addresses(&AddressOptions::default()).await?;
        Ok(addresses.private.into_iter().next())
    }

    pub async fn ssh_ip_address(&mut self) -> Result<Option<String>> {
        self.public_ip_address().await
    }

    // =========================================================================
    // Remote access
    // =========================================================================

    /// Proxy through the hypervisor host when libvirt itself is reached
    /// over ssh.
    pub fn ssh_proxy(&self) -> Option<String> {
        let uri = self.service.connection.uri();
        if !uri.ssh_enabled() {
            return None;
        }
        uri.host
            .as_deref()
            .map(|host| proxy_command(host, uri.user.as_deref()))
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            password: self.password.clone(),
            key_data: self.private_key.iter().cloned().collect(),
            proxy_command: self.ssh_proxy(),
            ..Default::default()
        }
    }

    async fn require_ssh_target(&mut self) -> Result<String> {
        if self.username.is_empty() {
            return Err(ComputeError::Precondition("username".to_string()));
        }
        self.ssh_ip_address()
            .await?
            .ok_or_else(|| ComputeError::Precondition("ssh_ip_address".to_string()))
    }

    fn require_id(&self) -> Result<String> {
        self.id
            .clone()
            .ok_or_else(|| ComputeError::Precondition("id".to_string()))
    }

    /// Run commands on the server over ssh.
    #[instrument(skip(self, commands), fields(vm_name = %self.name))]
    pub async fn ssh(&mut self, commands: &[String]) -> Result<Vec<CommandResult>> {
        let host = self.require_ssh_target().await?;
        let options = self.session_options();

        self.service
            .executor
            .run(&host, Some(&self.username), &options, commands)
            .await
            .map_err(|e| session_error(&host, &self.username, e))
    }

    /// Copy a local file onto the server.
    #[instrument(skip(self), fields(vm_name = %self.name))]
    pub async fn scp(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        let host = self.require_ssh_target().await?;
        let options = self.session_options();

        self.service
            .executor
            .upload(&host, Some(&self.username), &options, local_path, remote_path)
            .await
            .map_err(|e| session_error(&host, &self.username, e))
    }

    /// Wait for ssh to come up, then install `public_key`.
    #[instrument(skip(self), fields(vm_name = %self.name))]
    pub async fn setup(&mut self) -> Result<()> {
        let public_key = self
            .public_key
            .clone()
            .ok_or_else(|| ComputeError::Precondition("public_key".to_string()))?;
        let host = self.require_ssh_target().await?;
        let options = self.session_options();

        self.wait_for_ssh(&host, &options).await?;

        let command = format!(
            "mkdir -p ~/.ssh && echo \"{}\" >> ~/.ssh/authorized_keys",
            public_key
        );
        let results = self
            .service
            .executor
            .run(&host, Some(&self.username), &options, &[command.clone()])
            .await
            .map_err(|e| session_error(&host, &self.username, e))?;

        if let Some(failed) = results.into_iter().find(|r| r.status != 0) {
            return Err(ComputeError::CommandFailed {
                command,
                status: Some(failed.status),
                output: failed.stderr,
            });
        }

        info!(host = %host, "Public key installed");
        Ok(())
    }

    async fn wait_for_ssh(&self, host: &str, options: &SessionOptions) -> Result<()> {
        let setup = &self.service.config.setup;
        let check = vec!["pwd".to_string()];
        let check_options = SessionOptions {
            timeout: Some(setup.session_timeout()),
            ..options.clone()
        };
        let executor = &self.service.executor;

        let wait = async {
            loop {
                let attempt = executor.run(host, Some(&self.username), &check_options, &check);
                match tokio::time::timeout(setup.attempt_timeout(), attempt).await {
                    Ok(Ok(_)) => return Ok(()),
                    Ok(Err(SessionError::ConnectionRefused)) => {
                        debug!(host = %host, "Connection refused, backing off");
                        tokio::time::sleep(setup.refused_backoff()).await;
                    }
                    Ok(Err(SessionError::AuthenticationFailed)) | Ok(Err(SessionError::Timeout)) | Err(_) => {
                        debug!(host = %host, "Host not ready yet, retrying");
                        tokio::task::yield_now().await;
                    }
                    Ok(Err(other)) => {
                        return Err(ComputeError::Remote {
                            host: host.to_string(),
                            source: other,
                        })
                    }
                }
            }
        };

        tokio::time::timeout(setup.timeout(), wait)
            .await
            .map_err(|_| ComputeError::Unreachable {
                host: host.to_string(),
                timeout: setup.timeout(),
            })?
    }
}

fn session_error(host: &str, user: &str, err: SessionError) -> ComputeError {
    match err {
        SessionError::ConnectionRefused => {
            ComputeError::Connectivity(format!("Connection was refused by host {}", host))
        }
        SessionError::AuthenticationFailed => ComputeError::Authentication(format!(
            "Error authenticating over ssh to host {} and user {}",
            host, user
        )),
        other => ComputeError::Remote {
            host: host.to_string(),
            source: other,
        },
    }
}
