//! Type definitions shared by the server model and its collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ComputeError;

// =============================================================================
// BOOT ORDER
// =============================================================================

/// Boot device keyword accepted in a server's boot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Cdrom,
    Fd,
    Hd,
    Network,
}

impl BootDevice {
    /// Every accepted keyword, in documentation order.
    pub const ALL: [BootDevice; 4] = [
        BootDevice::Cdrom,
        BootDevice::Fd,
        BootDevice::Hd,
        BootDevice::Network,
    ];

    /// Get the libvirt `<boot dev=...>` value.
    pub fn as_str(&self) -> &'static str {
        match self {
            BootDevice::Cdrom => "cdrom",
            BootDevice::Fd => "fd",
            BootDevice::Hd => "hd",
            BootDevice::Network => "network",
        }
    }

    /// Validate a whole boot order given as keywords.
    pub fn parse_order<S: AsRef<str>>(order: &[S]) -> Result<Vec<BootDevice>, ComputeError> {
        order.iter().map(|b| b.as_ref().parse()).collect()
    }
}

impl FromStr for BootDevice {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BootDevice::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = BootDevice::ALL.iter().map(|d| d.as_str()).collect();
                ComputeError::Configuration(format!(
                    "invalid boot order '{}', possible values are any combination of: {}",
                    s,
                    valid.join(", ")
                ))
            })
    }
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// DOMAIN STATE
// =============================================================================

/// Domain lifecycle state as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    #[default]
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
    /// A state this crate does not model.
    Other(String),
}

impl DomainState {
    pub fn as_str(&self) -> &str {
        match self {
            DomainState::NoState => "nostate",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::PmSuspended => "pmsuspended",
            DomainState::Other(s) => s,
        }
    }

    /// Parse the state column printed by `virsh dominfo`/`domstate`.
    pub fn from_virsh(s: &str) -> Self {
        match s.trim() {
            "no state" | "nostate" => DomainState::NoState,
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" | "shutdown" => DomainState::Shutdown,
            "shut off" | "shutoff" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::PmSuspended,
            other => DomainState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action requested on a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainAction {
    /// Power on a defined domain.
    Create,
    /// Hard power off.
    Destroy,
    Reboot,
    /// Graceful ACPI shutdown.
    Shutdown,
    Resume,
    Suspend,
    /// Remove the persistent definition.
    Undefine,
}

impl DomainAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainAction::Create => "create",
            DomainAction::Destroy => "destroy",
            DomainAction::Reboot => "reboot",
            DomainAction::Shutdown => "shutdown",
            DomainAction::Resume => "resume",
            DomainAction::Suspend => "suspend",
            DomainAction::Undefine => "undefine",
        }
    }
}

impl fmt::Display for DomainAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// DEVICES
// =============================================================================

/// How a NIC attaches to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicType {
    /// libvirt virtual network (NAT)
    #[default]
    Network,
    /// Host bridge
    Bridge,
}

impl NicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicType::Network => "network",
            NicType::Bridge => "bridge",
        }
    }
}

impl FromStr for NicType {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(NicType::Network),
            "bridge" => Ok(NicType::Bridge),
            other => Err(ComputeError::Configuration(format!(
                "invalid network interface type '{}', expected network or bridge",
                other
            ))),
        }
    }
}

/// Network interface descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Nic {
    /// Attachment type
    #[serde(rename = "type")]
    pub nic_type: NicType,
    /// Virtual network name (for `network` NICs)
    pub network: Option<String>,
    /// Bridge name (for `bridge` NICs)
    pub bridge: Option<String>,
    /// Device model
    pub model: String,
    /// MAC address (assigned by the hypervisor if None)
    pub mac: Option<String>,
}

impl Default for Nic {
    fn default() -> Self {
        Self {
            nic_type: NicType::Network,
            network: None,
            bridge: None,
            model: "virtio".to_string(),
            mac: None,
        }
    }
}

/// Storage volume handle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    pub name: String,
    /// Path on the hypervisor host
    pub path: Option<String>,
    /// Storage pool holding the volume
    pub pool_name: Option<String>,
    /// Capacity with unit suffix, e.g. `10G`
    pub capacity: Option<String>,
    /// Allocation with unit suffix, e.g. `1G`
    pub allocation: Option<String>,
    /// Image format, e.g. `qcow2`
    pub format_type: Option<String>,
    /// Template this volume was cloned from
    pub backing_volume: Option<String>,
}

impl Volume {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool_name = Some(pool.into());
        self
    }
}

/// Graphical console settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Display {
    /// Port, `-1` for auto-assign
    pub port: String,
    /// Listen address
    pub listen: String,
    /// `vnc` or `spice`
    #[serde(rename = "type")]
    pub display_type: String,
    /// Console password, empty for none
    pub password: String,
}

impl Default for Display {
    fn default() -> Self {
        Self {
            port: "-1".to_string(),
            listen: "127.0.0.1".to_string(),
            display_type: "vnc".to_string(),
            password: String::new(),
        }
    }
}

// =============================================================================
// HYPERVISOR RECORDS
// =============================================================================

/// Returned by domain definition/creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    pub uuid: String,
    pub name: String,
}

/// Authoritative domain state read back after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainInfo {
    pub uuid: String,
    pub name: String,
    pub state: DomainState,
    pub active: bool,
    /// CPU time consumed, nanoseconds
    pub cputime: u64,
    pub cpus: u32,
    /// Current memory, KiB
    pub memory_size: u64,
    /// Maximum memory, KiB
    pub max_memory_size: u64,
    pub persistent: bool,
    pub autostart: bool,
    pub os_type: Option<String>,
    pub nics: Vec<Nic>,
    /// Source paths of attached disks
    pub volume_paths: Vec<String>,
    pub display: Option<Display>,
}

/// Selects volumes in [`HypervisorConnection::list_volumes`](crate::HypervisorConnection::list_volumes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFilter {
    pub name: Option<String>,
    pub path: Option<String>,
}

impl VolumeFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), path: None }
    }

    pub fn by_path(path: impl Into<String>) -> Self {
        Self { name: None, path: Some(path.into()) }
    }

    pub fn matches(&self, volume: &Volume) -> bool {
        self.name.as_ref().map_or(true, |n| *n == volume.name)
            && self.path.as_ref().map_or(true, |p| volume.path.as_ref() == Some(p))
    }
}

/// Options for creating a fresh volume.
///
/// Only options that were explicitly given are set; the connection applies
/// the hypervisor's own defaults for the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeOptions {
    pub name: String,
    pub pool_name: Option<String>,
    pub format_type: Option<String>,
    pub capacity: Option<String>,
    pub allocation: Option<String>,
}

/// libvirt virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualNetwork {
    pub name: String,
    pub active: bool,
}

/// DHCP lease observed by a virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub ipaddr: String,
    pub mac: String,
    /// Expiry, seconds since the epoch
    pub expirytime: i64,
    pub hostname: Option<String>,
}

/// Outcome of a DHCP lease query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseQuery {
    Supported(Vec<DhcpLease>),
    /// The connection or library cannot report leases.
    Unsupported,
}

/// Public and private addresses of a server.
///
/// Both lists hold at most one entry: one NIC is assumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addresses {
    pub public: Vec<String>,
    pub private: Vec<String>,
}

impl Addresses {
    /// Same address on both sides; `None` yields empty lists.
    pub fn single(ip: Option<String>) -> Self {
        let list: Vec<String> = ip.into_iter().collect();
        Self {
            public: list.clone(),
            private: list,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_order_accepts_every_valid_combination() {
        let order = BootDevice::parse_order(&["network", "fd", "hd", "cdrom", "hd"]).unwrap();
        assert_eq!(
            order,
            vec![
                BootDevice::Network,
                BootDevice::Fd,
                BootDevice::Hd,
                BootDevice::Cdrom,
                BootDevice::Hd
            ]
        );
        assert!(BootDevice::parse_order::<&str>(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_boot_order_rejects_unknown_device() {
        let err = BootDevice::parse_order(&["hd", "usb"]).unwrap_err();
        assert!(matches!(err, ComputeError::Configuration(_)));
        assert!(err.to_string().contains("cdrom, fd, hd, network"));
    }

    #[test]
    fn test_domain_state_from_virsh() {
        assert_eq!(DomainState::from_virsh("shut off"), DomainState::Shutoff);
        assert_eq!(DomainState::from_virsh("running"), DomainState::Running);
        assert_eq!(DomainState::from_virsh("in shutdown"), DomainState::Shutdown);
        assert_eq!(
            DomainState::from_virsh("migrating"),
            DomainState::Other("migrating".to_string())
        );
    }

    #[test]
    fn test_volume_filter() {
        let vol = Volume::new("base.qcow2").with_path("/var/lib/libvirt/images/base.qcow2");
        assert!(VolumeFilter::by_name("base.qcow2").matches(&vol));
        assert!(VolumeFilter::by_path("/var/lib/libvirt/images/base.qcow2").matches(&vol));
        assert!(!VolumeFilter::by_name("other").matches(&vol));
        assert!(VolumeFilter::default().matches(&vol));
    }

    #[test]
    fn test_addresses_single() {
        let addrs = Addresses::single(Some("10.0.0.9".to_string()));
        assert_eq!(addrs.public, vec!["10.0.0.9"]);
        assert_eq!(addrs.private, vec!["10.0.0.9"]);
        assert_eq!(Addresses::single(None), Addresses::default());
    }
}
