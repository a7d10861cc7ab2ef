//! Hypervisor connection driving the `virsh` CLI.
//!
//! Every call spawns `virsh -c <uri> ...` and parses its table output.
//! Definitions and graphics updates go through temporary XML files.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::{ConnectionError, Result};
use crate::traits::{ConnectionResult, HypervisorConnection};
use crate::types::*;
use crate::uri::ConnectionUri;
use crate::xml::graphics_xml;

/// [`HypervisorConnection`] backed by the `virsh` binary.
#[derive(Debug, Clone)]
pub struct VirshConnection {
    uri: ConnectionUri,
    virsh_path: String,
    default_pool: String,
    default_capacity: String,
}

impl VirshConnection {
    pub fn new(uri: &str, virsh_path: &str) -> Result<Self> {
        let uri = ConnectionUri::parse(uri)?;
        info!(uri = %uri, "Using virsh connection");

        Ok(Self {
            uri,
            virsh_path: virsh_path.to_string(),
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

    async fn virsh<S: AsRef<str>>(&self, args: &[S]) -> ConnectionResult<String> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        debug!(args = ?args, "Running virsh");

        let output = Command::new(&self.virsh_path)
            .arg("-c")
            .arg(self.uri.as_str())
            .args(&args)
            .output()
            .await
            .map_err(|e| ConnectionError::Failed(format!("failed to run {}: {}", self.virsh_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_error(args.first().copied().unwrap_or_default(), &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn with_xml_file<F, Fut, T>(xml: &str, f: F) -> ConnectionResult<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = ConnectionResult<T>>,
    {
        let mut file = NamedTempFile::new()
            .map_err(|e| ConnectionError::Failed(format!("failed to stage XML: {}", e)))?;
        file.write_all(xml.as_bytes())
            .map_err(|e| ConnectionError::Failed(format!("failed to stage XML: {}", e)))?;

        f(file.path().to_string_lossy().to_string()).await
    }

    async fn submit_domain(&self, command: &str, xml: &str) -> ConnectionResult<DomainHandle> {
        let output = Self::with_xml_file(xml, |path| async move {
            self.virsh(&[command, path.as_str()]).await
        })
        .await?;

        let name = parse_submitted_name(&output).ok_or_else(|| {
            ConnectionError::Failed(format!("unexpected virsh {} output: {}", command, output.trim()))
        })?;
        let uuid = self.virsh(&["domuuid", name.as_str()]).await?.trim().to_string();

        info!(vm_id = %uuid, vm_name = %name, command, "Domain submitted");
        Ok(DomainHandle { uuid, name })
    }

    fn pool_of<'v>(&'v self, volume: &'v Volume) -> &'v str {
        volume.pool_name.as_deref().unwrap_or(&self.default_pool)
    }

    async fn volume_path(&self, pool: &str, name: &str) -> ConnectionResult<Option<String>> {
        let path = self.virsh(&["vol-path", "--pool", pool, name]).await?;
        Ok(Some(path.trim().to_string()).filter(|p| !p.is_empty()))
    }
}

#[async_trait]
impl HypervisorConnection for VirshConnection {
    async fn define_domain(&self, xml: &str) -> ConnectionResult<DomainHandle> {
        self.submit_domain("define", xml).await
    }

    async fn create_domain(&self, xml: &str) -> ConnectionResult<DomainHandle> {
        self.submit_domain("create", xml).await
    }

    #[instrument(skip(self), fields(vm_id = %uuid))]
    async fn domain_action(&self, uuid: &str, action: DomainAction) -> ConnectionResult<bool> {
        let command = match action {
            DomainAction::Create => "start",
            DomainAction::Destroy => "destroy",
            DomainAction::Reboot => "reboot",
            DomainAction::Shutdown => "shutdown",
            DomainAction::Resume => "resume",
            DomainAction::Suspend => "suspend",
            DomainAction::Undefine => "undefine",
        };
        self.virsh(&[command, uuid]).await?;
        Ok(true)
    }

    async fn domain_info(&self, uuid: &str) -> ConnectionResult<DomainInfo> {
        let mut info = parse_dominfo(&self.virsh(&["dominfo", uuid]).await?);
        info.nics = parse_domiflist(&self.virsh(&["domiflist", uuid]).await?);
        info.volume_paths = parse_domblklist(&self.virsh(&["domblklist", uuid, "--details"]).await?);
        Ok(info)
    }

    async fn update_autostart(&self, uuid: &str, autostart: bool) -> ConnectionResult<()> {
        if autostart {
            self.virsh(&["autostart", uuid]).await?;
        } else {
            self.virsh(&["autostart", "--disable", uuid]).await?;
        }
        Ok(())
    }

    async fn update_display(&self, uuid: &str, display: &Display) -> ConnectionResult<()> {
        let xml = graphics_xml(display, "");
        Self::with_xml_file(&xml, |path| async move {
            self.virsh(&["update-device", uuid, path.as_str(), "--current"]).await
        })
        .await?;
        Ok(())
    }

    async fn list_volumes(&self, filter: &VolumeFilter) -> ConnectionResult<Vec<Volume>> {
        let pools = self.virsh(&["pool-list", "--all", "--name"]).await?;

        let mut volumes = Vec::new();
        for pool in pools.lines().map(str::trim).filter(|p| !p.is_empty()) {
            let listing = match self.virsh(&["vol-list", "--pool", pool]).await {
                Ok(listing) => listing,
                Err(e) => {
                    // Inactive pools cannot be listed
                    warn!(pool = %pool, error = %e, "Skipping pool");
                    continue;
                }
            };
            volumes.extend(
                parse_vol_list(&listing, pool)
                    .into_iter()
                    .filter(|v| filter.matches(v)),
            );
        }

        Ok(volumes)
    }

    #[instrument(skip(self, options), fields(volume = %options.name))]
    async fn create_volume(&self, options: &VolumeOptions) -> ConnectionResult<Volume> {
        let pool = options.pool_name.as_deref().unwrap_or(&self.default_pool);
        let capacity = options.capacity.as_deref().unwrap_or(&self.default_capacity);

        let mut args = vec!["vol-create-as", "--pool", pool, options.name.as_str(), capacity];
        if let Some(allocation) = &options.allocation {
            args.extend(["--allocation", allocation.as_str()]);
        }
        if let Some(format) = &options.format_type {
            args.extend(["--format", format.as_str()]);
        }
        self.virsh(&args).await?;

        Ok(Volume {
            name: options.name.clone(),
            path: self.volume_path(pool, &options.name).await?,
            pool_name: Some(pool.to_string()),
            capacity: Some(capacity.to_string()),
            allocation: options.allocation.clone(),
            format_type: options.format_type.clone(),
            backing_volume: None,
        })
    }

    #[instrument(skip(self, source), fields(source = %source.name, target = %name))]
    async fn clone_volume(&self, source: &Volume, name: &str) -> ConnectionResult<Volume> {
        let pool = self.pool_of(source);
        self.virsh(&["vol-clone", "--pool", pool, source.name.as_str(), name]).await?;

        Ok(Volume {
            name: name.to_string(),
            path: self.volume_path(pool, name).await?,
            pool_name: Some(pool.to_string()),
            backing_volume: Some(source.name.clone()),
            ..source.clone()
        })
    }

    async fn upload_volume(&self, volume: &Volume, image: &Path) -> ConnectionResult<()> {
        let image = image.to_string_lossy();
        self.virsh(&["vol-upload", "--pool", self.pool_of(volume), volume.name.as_str(), image.as_ref()])
            .await?;
        Ok(())
    }

    async fn delete_volume(&self, volume: &Volume) -> ConnectionResult<()> {
        self.virsh(&["vol-delete", "--pool", self.pool_of(volume), volume.name.as_str()])
            .await?;
        Ok(())
    }

    async fn list_networks(&self) -> ConnectionResult<Vec<VirtualNetwork>> {
        Ok(parse_net_list(&self.virsh(&["net-list", "--all"]).await?))
    }

    async fn network_dhcp_leases(&self, network: &str, mac: &str) -> ConnectionResult<LeaseQuery> {
        match self.virsh(&["net-dhcp-leases", network, "--mac", mac]).await {
            Ok(output) => Ok(LeaseQuery::Supported(parse_dhcp_leases(&output))),
            Err(ConnectionError::Unsupported(_)) => Ok(LeaseQuery::Unsupported),
            Err(e) => Err(e),
        }
    }

    async fn lib_version(&self) -> ConnectionResult<u64> {
        let output = self.virsh(&["version"]).await?;
        parse_lib_version(&output)
            .ok_or_else(|| ConnectionError::Failed(format!("unexpected virsh version output: {}", output.trim())))
    }

    fn uri(&self) -> &ConnectionUri {
        &self.uri
    }
}

// =============================================================================
// OUTPUT PARSING
// =============================================================================

fn classify_error(command: &str, stderr: &str) -> ConnectionError {
    let message = stderr.trim().trim_start_matches("error: ").to_string();
    let lower = stderr.to_lowercase();

    if lower.contains("unknown command") {
        ConnectionError::Unsupported(command.to_string())
    } else if lower.contains("not found") || lower.contains("failed to get domain") || lower.contains("no domain with") {
        ConnectionError::NotFound(message)
    } else {
        ConnectionError::Failed(message)
    }
}

/// Name from `Domain 'web-1' defined from /tmp/x.xml` (older virsh omits
/// the quotes).
fn parse_submitted_name(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.trim_start().starts_with("Domain "))?;
    let rest = line.trim_start().strip_prefix("Domain ")?;

    if let Some(quoted) = rest.strip_prefix('\'') {
        return quoted.split('\'').next().map(str::to_string);
    }
    rest.split(" defined from")
        .next()
        .and_then(|n| n.split(" created from").next())
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}

/// `262144 KiB` -> 262144
fn parse_kib(value: &str) -> u64 {
    value
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn parse_dominfo(output: &str) -> DomainInfo {
    let mut info = DomainInfo::default();

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match key.trim() {
            "Id" => info.active = value != "-",
            "Name" => info.name = value.to_string(),
            "UUID" => info.uuid = value.to_string(),
            "OS Type" => info.os_type = Some(value.to_string()),
            "State" => info.state = DomainState::from_virsh(value),
            "CPU(s)" => info.cpus = value.parse().unwrap_or(0),
            "CPU time" => {
                let secs: f64 = value.trim_end_matches('s').parse().unwrap_or(0.0);
                info.cputime = (secs * 1e9) as u64;
            }
            "Max memory" => info.max_memory_size = parse_kib(value),
            "Used memory" => info.memory_size = parse_kib(value),
            "Persistent" => info.persistent = value == "yes",
            "Autostart" => info.autostart = value == "enable",
            _ => {}
        }
    }

    info
}

/// Rows of a virsh table, after the dashed separator.
fn table_rows(output: &str) -> impl Iterator<Item = Vec<&str>> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|cols| !cols.is_empty())
}

fn parse_domiflist(output: &str) -> Vec<Nic> {
    table_rows(output)
        .filter(|cols| cols.len() >= 5)
        .map(|cols| {
            let nic_type: NicType = cols[1].parse().unwrap_or_default();
            let source = Some(cols[2].to_string()).filter(|s| s != "-");
            Nic {
                nic_type,
                network: source.clone().filter(|_| nic_type == NicType::Network),
                bridge: source.filter(|_| nic_type == NicType::Bridge),
                model: cols[3].to_string(),
                mac: Some(cols[4].to_string()),
            }
        })
        .collect()
}

fn parse_domblklist(output: &str) -> Vec<String> {
    table_rows(output)
        .filter(|cols| cols.len() >= 4 && cols[1] == "disk" && cols[3] != "-")
        .map(|cols| cols[3..].join(" "))
        .collect()
}

fn parse_vol_list(output: &str, pool: &str) -> Vec<Volume> {
    table_rows(output)
        .filter(|cols| cols.len() >= 2)
        .map(|cols| Volume::new(cols[0]).with_path(cols[1..].join(" ")).with_pool(pool))
        .collect()
}

fn parse_net_list(output: &str) -> Vec<VirtualNetwork> {
    table_rows(output)
        .filter(|cols| cols.len() >= 2)
        .map(|cols| VirtualNetwork {
            name: cols[0].to_string(),
            active: cols[1] == "active",
        })
        .collect()
}

fn parse_dhcp_leases(output: &str) -> Vec<DhcpLease> {
    table_rows(output)
        .filter(|cols| cols.len() >= 5 && cols[3] == "ipv4")
        .filter_map(|cols| {
            let expiry = NaiveDateTime::parse_from_str(&format!("{} {}", cols[0], cols[1]), "%Y-%m-%d %H:%M:%S")
                .map_err(|e| warn!(error = %e, "Unparseable lease expiry"))
                .ok()?;
            Some(DhcpLease {
                ipaddr: cols[4].split('/').next().unwrap_or_default().to_string(),
                mac: cols[2].to_string(),
                expirytime: expiry.and_utc().timestamp(),
                hostname: cols.get(5).filter(|h| **h != "-").map(|h| h.to_string()),
            })
        })
        .collect()
}

/// `Using library: libvirt 1.2.8` -> 1_002_008
fn parse_lib_version(output: &str) -> Option<u64> {
    let line = output.lines().find(|l| l.trim_start().starts_with("Using library:"))?;
    let version = line.split_whitespace().last()?;

    let mut parts = version.split('.').map(|p| p.parse::<u64>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let release = parts.next().flatten().unwrap_or(0);
    Some(major * 1_000_000 + minor * 1_000 + release)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submitted_name() {
        assert_eq!(
            parse_submitted_name("Domain 'web-1' defined from /tmp/.tmpX\n\n").as_deref(),
            Some("web-1")
        );
        assert_eq!(
            parse_submitted_name("Domain web-1 created from /tmp/.tmpX\n").as_deref(),
            Some("web-1")
        );
        assert_eq!(parse_submitted_name("garbage"), None);
    }

    #[test]
    fn test_parse_dominfo() {
        let output = "Id:             3
Name:           web-1
UUID:           6a2f9c1e-1111-4000-8000-000000000001
OS Type:        hvm
State:          running
CPU(s):         2
CPU time:       12.5s
Max memory:     524288 KiB
Used memory:    262144 KiB
Persistent:     yes
Autostart:      disable
Managed save:   no
";
        let info = parse_dominfo(output);
        assert_eq!(info.name, "web-1");
        assert_eq!(info.uuid, "6a2f9c1e-1111-4000-8000-000000000001");
        assert_eq!(info.state, DomainState::Running);
        assert!(info.active);
        assert_eq!(info.cpus, 2);
        assert_eq!(info.cputime, 12_500_000_000);
        assert_eq!(info.max_memory_size, 524288);
        assert_eq!(info.memory_size, 262144);
        assert!(info.persistent);
        assert!(!info.autostart);

        let info = parse_dominfo("Id:             -\nState:          shut off\n");
        assert!(!info.active);
        assert_eq!(info.state, DomainState::Shutoff);
    }

    #[test]
    fn test_parse_domiflist() {
        let output = " Interface   Type      Source    Model    MAC
-----------------------------------------------------------
 vnet0       network   default   virtio   52:54:00:0e:4b:2a
 -           bridge    br0       e1000    52:54:00:11:22:33
";
        let nics = parse_domiflist(output);
        assert_eq!(nics.len(), 2);
        assert_eq!(nics[0].network.as_deref(), Some("default"));
        assert_eq!(nics[0].bridge, None);
        assert_eq!(nics[0].mac.as_deref(), Some("52:54:00:0e:4b:2a"));
        assert_eq!(nics[1].nic_type, NicType::Bridge);
        assert_eq!(nics[1].bridge.as_deref(), Some("br0"));
        assert_eq!(nics[1].model, "e1000");
    }

    #[test]
    fn test_parse_domblklist() {
        let output = " Type   Device   Target   Source
------------------------------------------------------------
 file   disk     vda      /var/lib/libvirt/images/web-1.img
 file   cdrom    hdc      -
 file   disk     vdb      /var/lib/libvirt/images/data disk.img
";
        assert_eq!(
            parse_domblklist(output),
            vec![
                "/var/lib/libvirt/images/web-1.img",
                "/var/lib/libvirt/images/data disk.img"
            ]
        );
    }

    #[test]
    fn test_parse_vol_list() {
        let output = " Name          Path
------------------------------------------------------
 base.qcow2    /var/lib/libvirt/images/base.qcow2
 web-1.img     /var/lib/libvirt/images/web-1.img
";
        let volumes = parse_vol_list(output, "default");
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].name, "base.qcow2");
        assert_eq!(volumes[1].path.as_deref(), Some("/var/lib/libvirt/images/web-1.img"));
        assert_eq!(volumes[1].pool_name.as_deref(), Some("default"));
    }

    #[test]
    fn test_parse_net_list() {
        let output = " Name      State      Autostart   Persistent
--------------------------------------------------
 default   active     yes         yes
 isolated  inactive   no          yes
";
        let networks = parse_net_list(output);
        assert_eq!(networks.len(), 2);
        assert!(networks[0].active);
        assert!(!networks[1].active);
    }

    #[test]
    fn test_parse_dhcp_leases() {
        let output = " Expiry Time           MAC address         Protocol   IP address           Hostname   Client ID or DUID
---------------------------------------------------------------------------------------------------------------
 2024-05-01 12:00:00   52:54:00:aa:bb:cc   ipv4       192.168.122.45/24    web-1      01:52:54:00:aa:bb:cc
 2024-05-01 13:00:00   52:54:00:aa:bb:cc   ipv4       192.168.122.46/24    -          -
 2024-05-01 13:00:00   52:54:00:aa:bb:cc   ipv6       fd00::5/64           web-1      -
";
        let leases = parse_dhcp_leases(output);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].ipaddr, "192.168.122.45");
        assert_eq!(leases[0].hostname.as_deref(), Some("web-1"));
        assert_eq!(leases[1].hostname, None);
        assert_eq!(leases[1].expirytime - leases[0].expirytime, 3600);
    }

    #[test]
    fn test_parse_lib_version() {
        let output = "Compiled against library: libvirt 8.0.0
Using library: libvirt 1.2.8
Using API: QEMU 8.0.0
Running hypervisor: QEMU 6.2.0
";
        assert_eq!(parse_lib_version(output), Some(1_002_008));
        assert_eq!(parse_lib_version("nothing"), None);
    }

    #[test]
    fn test_classify_error() {
        assert!(matches!(
            classify_error("net-dhcp-leases", "error: unknown command: 'net-dhcp-leases'"),
            ConnectionError::Unsupported(_)
        ));
        assert!(matches!(
            classify_error("dominfo", "error: failed to get domain 'x'"),
            ConnectionError::NotFound(_)
        ));
        assert_eq!(
            classify_error("define", "error: internal error: boom\n"),
            ConnectionError::Failed("internal error: boom".to_string())
        );
    }
}
