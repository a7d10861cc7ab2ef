//! In-memory collaborators for testing and development.
//!
//! - [`MockConnection`] simulates domains, volumes, networks and DHCP leases
//!   and logs every call so tests can assert what reached the hypervisor.
//! - [`MockExecutor`] replays scripted session outcomes.
//! - [`MockImageBuilder`] writes a fake ISO, or fails on demand.
//!
//! [`MockHarness`] bundles the three into a [`ComputeService`].

use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument};

use crate::config::ComputeConfig;
use crate::error::{ConnectionError, SessionError};
use crate::remote::{CommandResult, SessionOptions};
use crate::service::ComputeService;
use crate::traits::{CommandExecutor, ConnectionResult, HypervisorConnection, ImageBuilder};
use crate::types::*;
use crate::uri::ConnectionUri;
use crate::xml::{parse_disk_sources, parse_graphics, parse_interfaces, xml_text};

/// Directory the mock pretends the `default` pool lives in.
pub const MOCK_POOL_DIR: &str = "/var/lib/libvirt/images";

fn poisoned() -> ConnectionError {
    ConnectionError::Failed("Lock poisoned".to_string())
}

fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

// =============================================================================
// CONNECTION
// =============================================================================

/// In-memory hypervisor connection.
pub struct MockConnection {
    uri: ConnectionUri,
    state: RwLock<MockState>,
}

struct MockState {
    domains: HashMap<String, MockDomain>,
    volumes: Vec<Volume>,
    uploads: HashMap<String, u64>,
    networks: Vec<VirtualNetwork>,
    leases: HashMap<String, Vec<DhcpLease>>,
    leases_supported: bool,
    lib_version: u64,
    failures: HashSet<String>,
    calls: Vec<String>,
}

struct MockDomain {
    name: String,
    state: DomainState,
    persistent: bool,
    autostart: bool,
    cpus: u32,
    memory_kib: u64,
    nics: Vec<Nic>,
    volume_paths: Vec<String>,
    display: Display,
}

impl MockConnection {
    /// Create a local (`qemu:///system`) mock with lease support and one
    /// `default` network.
    pub fn new() -> Self {
        Self::with_connection_uri(ConnectionUri::default())
    }

    /// Create a mock reporting the given connection URI.
    pub fn with_uri(uri: &str) -> crate::error::Result<Self> {
        Ok(Self::with_connection_uri(ConnectionUri::parse(uri)?))
    }

    fn with_connection_uri(uri: ConnectionUri) -> Self {
        info!(uri = %uri, "Creating mock hypervisor connection");
        Self {
            uri,
            state: RwLock::new(MockState {
                domains: HashMap::new(),
                volumes: Vec::new(),
                uploads: HashMap::new(),
                networks: vec![VirtualNetwork {
                    name: "default".to_string(),
                    active: true,
                }],
                leases: HashMap::new(),
                leases_supported: true,
                lib_version: 8_000_000,
                failures: HashSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    fn write(&self) -> ConnectionResult<std::sync::RwLockWriteGuard<'_, MockState>> {
        self.state.write().map_err(|_| poisoned())
    }

    /// Log the call and fail it if a failure was injected for `op`.
    fn enter(&self, op: &str, detail: &str) -> ConnectionResult<std::sync::RwLockWriteGuard<'_, MockState>> {
        let mut state = self.write()?;
        state.calls.push(if detail.is_empty() {
            op.to_string()
        } else {
            format!("{}:{}", op, detail)
        });
        if state.failures.contains(op) {
            return Err(ConnectionError::Failed(format!("injected failure: {}", op)));
        }
        Ok(state)
    }

    // =========================================================================
    // Test controls
    // =========================================================================

    /// Make every later call of `op` (a trait method name) fail.
    pub fn fail_on(&self, op: &str) {
        if let Ok(mut state) = self.state.write() {
            state.failures.insert(op.to_string());
        }
    }

    /// Clear injected failures.
    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.write() {
            state.failures.clear();
        }
    }

    pub fn set_leases_supported(&self, supported: bool) {
        if let Ok(mut state) = self.state.write() {
            state.leases_supported = supported;
        }
    }

    pub fn set_lib_version(&self, version: u64) {
        if let Ok(mut state) = self.state.write() {
            state.lib_version = version;
        }
    }

    pub fn add_network(&self, name: &str) {
        if let Ok(mut state) = self.state.write() {
            state.networks.push(VirtualNetwork {
                name: name.to_string(),
                active: true,
            });
        }
    }

    pub fn add_lease(&self, network: &str, lease: DhcpLease) {
        if let Ok(mut state) = self.state.write() {
            state.leases.entry(network.to_string()).or_default().push(lease);
        }
    }

    /// Seed an existing volume (e.g. a template).
    pub fn add_volume(&self, volume: Volume) {
        if let Ok(mut state) = self.state.write() {
            state.volumes.push(volume);
        }
    }

    /// Force a domain into a state, as if changed outside this process.
    pub fn set_domain_state(&self, uuid: &str, domain_state: DomainState) {
        if let Ok(mut state) = self.state.write() {
            if let Some(domain) = state.domains.get_mut(uuid) {
                domain.state = domain_state;
            }
        }
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.state.read().map(|s| s.volumes.clone()).unwrap_or_default()
    }

    pub fn domain_count(&self) -> usize {
        self.state.read().map(|s| s.domains.len()).unwrap_or_default()
    }

    /// Bytes uploaded into the named volume.
    pub fn uploaded_bytes(&self, volume: &str) -> Option<u64> {
        self.state.read().ok().and_then(|s| s.uploads.get(volume).copied())
    }

    /// Every call so far, as `op` or `op:detail`.
    pub fn calls(&self) -> Vec<String> {
        self.state.read().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Number of calls whose log entry starts with `prefix`.
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn add_domain(&self, op: &str, xml: &str, persistent: bool) -> ConnectionResult<DomainHandle> {
        let mut state = self.enter(op, "")?;

        let name = xml_text(xml, "name")
            .ok_or_else(|| ConnectionError::Failed("domain XML has no <name>".to_string()))?;
        if state.domains.values().any(|d| d.name == name) {
            return Err(ConnectionError::Failed(format!("domain '{}' already exists", name)));
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        let nics = parse_interfaces(xml)
            .into_iter()
            .map(|mut nic| {
                nic.mac.get_or_insert_with(random_mac);
                nic
            })
            .collect();

        state.domains.insert(
            uuid.clone(),
            MockDomain {
                name: name.clone(),
                state: if persistent { DomainState::Shutoff } else { DomainState::Running },
                persistent,
                autostart: false,
                cpus: xml_text(xml, "vcpu").and_then(|v| v.parse().ok()).unwrap_or(1),
                memory_kib: xml_text(xml, "memory").and_then(|v| v.parse().ok()).unwrap_or(0),
                nics,
                volume_paths: parse_disk_sources(xml),
                display: parse_graphics(xml).unwrap_or_default(),
            },
        );

        info!(vm_id = %uuid, vm_name = %name, persistent, "Mock domain added");
        Ok(DomainHandle { uuid, name })
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorConnection for MockConnection {
    async fn define_domain(&self, xml: &str) -> ConnectionResult<DomainHandle> {
        self.add_domain("define_domain", xml, true)
    }

    async fn create_domain(&self, xml: &str) -> ConnectionResult<DomainHandle> {
        self.add_domain("create_domain", xml, false)
    }

    #[instrument(skip(self), fields(vm_id = %uuid))]
    async fn domain_action(&self, uuid: &str, action: DomainAction) -> ConnectionResult<bool> {
        let mut state = self.enter("domain_action", &format!("{}:{}", uuid, action))?;

        let domain = state
            .domains
            .get_mut(uuid)
            .ok_or_else(|| ConnectionError::NotFound(format!("domain {}", uuid)))?;

        match action {
            DomainAction::Create | DomainAction::Reboot | DomainAction::Resume => {
                domain.state = DomainState::Running;
            }
            DomainAction::Destroy | DomainAction::Shutdown => {
                domain.state = DomainState::Shutoff;
                if !domain.persistent {
                    state.domains.remove(uuid);
                }
            }
            DomainAction::Suspend => domain.state = DomainState::Paused,
            DomainAction::Undefine => {
                state.domains.remove(uuid);
            }
        }

        debug!(action = %action, "Mock domain action applied");
        Ok(true)
    }

    async fn domain_info(&self, uuid: &str) -> ConnectionResult<DomainInfo> {
        let state = self.enter("domain_info", uuid)?;

        let domain = state
            .domains
            .get(uuid)
            .ok_or_else(|| ConnectionError::NotFound(format!("domain {}", uuid)))?;

        let active = matches!(
            domain.state,
            DomainState::Running | DomainState::Paused | DomainState::Blocked
        );

        Ok(DomainInfo {
            uuid: uuid.to_string(),
            name: domain.name.clone(),
            state: domain.state.clone(),
            active,
            cputime: if active { 1_500_000_000 } else { 0 },
            cpus: domain.cpus,
            memory_size: domain.memory_kib,
            max_memory_size: domain.memory_kib,
            persistent: domain.persistent,
            autostart: domain.autostart,
            os_type: Some("hvm".to_string()),
            nics: domain.nics.clone(),
            volume_paths: domain.volume_paths.clone(),
            display: Some(domain.display.clone()),
        })
    }

    async fn update_autostart(&self, uuid: &str, autostart: bool) -> ConnectionResult<()> {
        let mut state = self.enter("update_autostart", &format!("{}:{}", uuid, autostart))?;
        let domain = state
            .domains
            .get_mut(uuid)
            .ok_or_else(|| ConnectionError::NotFound(format!("domain {}", uuid)))?;
        domain.autostart = autostart;
        Ok(())
    }

    async fn update_display(&self, uuid: &str, display: &Display) -> ConnectionResult<()> {
        let mut state = self.enter("update_display", uuid)?;
        let domain = state
            .domains
            .get_mut(uuid)
            .ok_or_else(|| ConnectionError::NotFound(format!("domain {}", uuid)))?;
        domain.display = display.clone();
        Ok(())
    }

    async fn list_volumes(&self, filter: &VolumeFilter) -> ConnectionResult<Vec<Volume>> {
        let state = self.enter("list_volumes", "")?;
        Ok(state.volumes.iter().filter(|v| filter.matches(v)).cloned().collect())
    }

    #[instrument(skip(self, options), fields(volume = %options.name))]
    async fn create_volume(&self, options: &VolumeOptions) -> ConnectionResult<Volume> {
        let mut state = self.enter("create_volume", &options.name)?;

        if state.volumes.iter().any(|v| v.name == options.name) {
            return Err(ConnectionError::Failed(format!(
                "storage volume '{}' exists already",
                options.name
            )));
        }

        let pool = options.pool_name.clone().unwrap_or_else(|| "default".to_string());
        let volume = Volume {
            name: options.name.clone(),
            path: Some(format!("{}/{}", MOCK_POOL_DIR, options.name)),
            pool_name: Some(pool),
            capacity: options.capacity.clone(),
            allocation: options.allocation.clone(),
            format_type: options.format_type.clone(),
            backing_volume: None,
        };
        state.volumes.push(volume.clone());

        Ok(volume)
    }

    #[instrument(skip(self, source), fields(source = %source.name, target = %name))]
    async fn clone_volume(&self, source: &Volume, name: &str) -> ConnectionResult<Volume> {
        let mut state = self.enter("clone_volume", &format!("{}:{}", source.name, name))?;

        if !state.volumes.iter().any(|v| v.name == source.name) {
            return Err(ConnectionError::NotFound(format!("storage volume '{}'", source.name)));
        }
        if state.volumes.iter().any(|v| v.name == name) {
            return Err(ConnectionError::Failed(format!(
                "storage volume '{}' exists already",
                name
            )));
        }

        let volume = Volume {
            name: name.to_string(),
            path: Some(format!("{}/{}", MOCK_POOL_DIR, name)),
            backing_volume: Some(source.name.clone()),
            ..source.clone()
        };
        state.volumes.push(volume.clone());

        Ok(volume)
    }

    async fn upload_volume(&self, volume: &Volume, image: &Path) -> ConnectionResult<()> {
        let size = std::fs::metadata(image)
            .map_err(|e| ConnectionError::Failed(format!("cannot read {}: {}", image.display(), e)))?
            .len();

        let mut state = self.enter("upload_volume", &volume.name)?;
        if !state.volumes.iter().any(|v| v.name == volume.name) {
            return Err(ConnectionError::NotFound(format!("storage volume '{}'", volume.name)));
        }
        state.uploads.insert(volume.name.clone(), size);
        Ok(())
    }

    async fn delete_volume(&self, volume: &Volume) -> ConnectionResult<()> {
        let mut state = self.enter("delete_volume", &volume.name)?;

        let before = state.volumes.len();
        state.volumes.retain(|v| v.name != volume.name);
        if state.volumes.len() == before {
            return Err(ConnectionError::NotFound(format!("storage volume '{}'", volume.name)));
        }
        Ok(())
    }

    async fn list_networks(&self) -> ConnectionResult<Vec<VirtualNetwork>> {
        let state = self.enter("list_networks", "")?;
        Ok(state.networks.clone())
    }

    async fn network_dhcp_leases(&self, network: &str, mac: &str) -> ConnectionResult<LeaseQuery> {
        let state = self.enter("network_dhcp_leases", &format!("{}:{}", network, mac))?;

        if !state.leases_supported {
            return Ok(LeaseQuery::Unsupported);
        }
        if !state.networks.iter().any(|n| n.name == network) {
            return Err(ConnectionError::NotFound(format!("network '{}'", network)));
        }

        let leases = state
            .leases
            .get(network)
            .map(|all| all.iter().filter(|l| l.mac == mac).cloned().collect())
            .unwrap_or_default();

        Ok(LeaseQuery::Supported(leases))
    }

    async fn lib_version(&self) -> ConnectionResult<u64> {
        let state = self.enter("lib_version", "")?;
        Ok(state.lib_version)
    }

    fn uri(&self) -> &ConnectionUri {
        &self.uri
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

/// A recorded [`MockExecutor`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub host: String,
    pub user: Option<String>,
    pub options: SessionOptions,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone)]
enum Scripted {
    Output { status: i32, stdout: String },
    Error(SessionError),
    Hang,
}

/// Executor replaying scripted outcomes, one per call.
///
/// Once the script is exhausted every call succeeds with empty output.
#[derive(Default)]
pub struct MockExecutor {
    script: RwLock<VecDeque<Scripted>>,
    calls: RwLock<Vec<ExecCall>>,
    uploads: RwLock<Vec<(PathBuf, String)>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, step: Scripted) {
        if let Ok(mut script) = self.script.write() {
            script.push_back(step);
        }
    }

    /// Next call succeeds, every command printing `stdout`.
    pub fn push_output(&self, stdout: &str) {
        self.push_status(0, stdout);
    }

    /// Next call completes with the given exit status.
    pub fn push_status(&self, status: i32, stdout: &str) {
        self.push(Scripted::Output {
            status,
            stdout: stdout.to_string(),
        });
    }

    /// Next call fails with a session error.
    pub fn push_error(&self, error: SessionError) {
        self.push(Scripted::Error(error));
    }

    /// Next call never completes.
    pub fn push_hang(&self) {
        self.push(Scripted::Hang);
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.read().map(|u| u.clone()).unwrap_or_default()
    }

    fn next(&self) -> Scripted {
        self.script
            .write()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or(Scripted::Output {
                status: 0,
                stdout: String::new(),
            })
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn run(
        &self,
        host: &str,
        user: Option<&str>,
        options: &SessionOptions,
        commands: &[String],
    ) -> Result<Vec<CommandResult>, SessionError> {
        self.calls
            .write()
            .map_err(|_| SessionError::Other("Lock poisoned".to_string()))?
            .push(ExecCall {
                host: host.to_string(),
                user: user.map(str::to_string),
                options: options.clone(),
                commands: commands.to_vec(),
            });

        match self.next() {
            Scripted::Output { status, stdout } => Ok(commands
                .iter()
                .map(|command| CommandResult {
                    command: command.clone(),
                    status,
                    stdout: stdout.clone(),
                    stderr: String::new(),
                })
                .collect()),
            Scripted::Error(err) => Err(err),
            Scripted::Hang => std::future::pending().await,
        }
    }

    async fn upload(
        &self,
        host: &str,
        user: Option<&str>,
        options: &SessionOptions,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SessionError> {
        self.calls
            .write()
            .map_err(|_| SessionError::Other("Lock poisoned".to_string()))?
            .push(ExecCall {
                host: host.to_string(),
                user: user.map(str::to_string),
                options: options.clone(),
                commands: Vec::new(),
            });

        match self.next() {
            Scripted::Error(err) => Err(err),
            Scripted::Hang => std::future::pending().await,
            Scripted::Output { .. } => {
                self.uploads
                    .write()
                    .map_err(|_| SessionError::Other("Lock poisoned".to_string()))?
                    .push((local_path.to_path_buf(), remote_path.to_string()));
                Ok(())
            }
        }
    }
}

// =============================================================================
// IMAGE BUILDER
// =============================================================================

/// Image builder writing a small fake ISO next to the source directory.
#[derive(Default)]
pub struct MockImageBuilder {
    fail: bool,
    source_dirs: RwLock<Vec<PathBuf>>,
}

impl MockImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder whose every build fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Directory handed to the most recent build.
    pub fn last_source_dir(&self) -> Option<PathBuf> {
        self.source_dirs.read().ok().and_then(|d| d.last().cloned())
    }

    pub fn builds(&self) -> usize {
        self.source_dirs.read().map(|d| d.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ImageBuilder for MockImageBuilder {
    async fn build(&self, source_dir: &Path) -> std::io::Result<PathBuf> {
        self.source_dirs
            .write()
            .map_err(|_| std::io::Error::other("Lock poisoned"))?
            .push(source_dir.to_path_buf());

        if self.fail {
            return Err(std::io::Error::other("genisoimage: command not found"));
        }

        let user_data = std::fs::read(source_dir.join("user-data"))?;
        let iso_path = source_dir.with_extension("iso");
        let mut image = b"CD001".to_vec();
        image.extend_from_slice(&user_data);
        std::fs::write(&iso_path, image)?;
        Ok(iso_path)
    }
}

// =============================================================================
// HARNESS
// =============================================================================

/// The three doubles, kept reachable for assertions.
pub struct MockHarness {
    pub connection: Arc<MockConnection>,
    pub executor: Arc<MockExecutor>,
    pub images: Arc<MockImageBuilder>,
}

impl MockHarness {
    pub fn new() -> Self {
        Self::from_connection(MockConnection::new())
    }

    /// Harness whose connection reports `uri`.
    pub fn with_uri(uri: &str) -> crate::error::Result<Self> {
        Ok(Self::from_connection(MockConnection::with_uri(uri)?))
    }

    /// Harness whose image builder always fails.
    pub fn with_failing_images() -> Self {
        Self {
            images: Arc::new(MockImageBuilder::failing()),
            ..Self::new()
        }
    }

    fn from_connection(connection: MockConnection) -> Self {
        Self {
            connection: Arc::new(connection),
            executor: Arc::new(MockExecutor::new()),
            images: Arc::new(MockImageBuilder::new()),
        }
    }

    pub fn service(&self) -> ComputeService {
        self.service_with_config(ComputeConfig::default())
    }

    pub fn service_with_config(&self, config: ComputeConfig) -> ComputeService {
        ComputeService::new(
            self.connection.clone(),
            self.executor.clone(),
            self.images.clone(),
            config,
        )
    }
}

impl Default for MockHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = "<domain type='kvm'>
  <name>web-1</name>
  <memory unit='KiB'>262144</memory>
  <vcpu>2</vcpu>
  <devices>
    <disk type='file' device='disk'>
      <source file='/var/lib/libvirt/images/web-1.img'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/var/lib/libvirt/images/web-1-cloud-init.iso'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:aa:bb:cc'/>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
    <interface type='bridge'>
      <source bridge='br0'/>
      <model type='e1000'/>
    </interface>
  </devices>
</domain>";

    #[tokio::test]
    async fn test_domain_lifecycle() {
        let conn = MockConnection::new();
        let handle = conn.define_domain(XML).await.unwrap();

        let info = conn.domain_info(&handle.uuid).await.unwrap();
        assert_eq!(info.state, DomainState::Shutoff);
        assert_eq!(info.cpus, 2);
        assert!(info.nics[1].mac.is_some());

        conn.domain_action(&handle.uuid, DomainAction::Create).await.unwrap();
        assert!(conn.domain_info(&handle.uuid).await.unwrap().active);

        conn.domain_action(&handle.uuid, DomainAction::Suspend).await.unwrap();
        assert_eq!(
            conn.domain_info(&handle.uuid).await.unwrap().state,
            DomainState::Paused
        );

        conn.domain_action(&handle.uuid, DomainAction::Destroy).await.unwrap();
        conn.domain_action(&handle.uuid, DomainAction::Undefine).await.unwrap();
        assert!(matches!(
            conn.domain_info(&handle.uuid).await,
            Err(ConnectionError::NotFound(_))
        ));
        assert_eq!(conn.count_calls("domain_action"), 4);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let conn = MockConnection::new();
        conn.fail_on("define_domain");
        assert!(conn.define_domain(XML).await.is_err());
        assert_eq!(conn.domain_count(), 0);

        conn.clear_failures();
        assert!(conn.define_domain(XML).await.is_ok());
    }

    #[tokio::test]
    async fn test_leases_unsupported() {
        let conn = MockConnection::new();
        conn.set_leases_supported(false);
        assert_eq!(
            conn.network_dhcp_leases("default", "52:54:00:aa:bb:cc").await.unwrap(),
            LeaseQuery::Unsupported
        );
    }

    #[tokio::test]
    async fn test_executor_script() {
        let exec = MockExecutor::new();
        exec.push_error(SessionError::ConnectionRefused);
        exec.push_output("/root\n");

        let cmds = vec!["pwd".to_string()];
        let opts = SessionOptions::default();
        assert_eq!(
            exec.run("10.0.0.5", Some("root"), &opts, &cmds).await,
            Err(SessionError::ConnectionRefused)
        );
        let results = exec.run("10.0.0.5", Some("root"), &opts, &cmds).await.unwrap();
        assert_eq!(results[0].stdout, "/root\n");
        assert_eq!(exec.calls().len(), 2);
    }
}
