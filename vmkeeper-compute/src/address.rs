//! IP address discovery for servers.
//!
//! libvirt has no reliable VM-to-IP mapping, so addresses are found one of
//! two ways:
//!
//! - **DHCP leases**: ask the virtual network the NIC is attached to for the
//!   leases handed to the NIC's MAC. Needs libvirt >= 1.2.8 and bindings
//!   exposing the call.
//! - **IP command**: run a shell command (arpwatch log lookup by default) on
//!   the hypervisor host, over ssh for remote connections.
//!
//! [`AddressResolver`] checks the connection on first use, picks a strategy
//! and keeps it for its lifetime.

use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::{ComputeError, Result, SessionError};
use crate::remote::SessionOptions;
use crate::service::ComputeService;
use crate::types::{Addresses, LeaseQuery, Nic};
use crate::uri::{ConnectionUri, Transport};

/// Default IP discovery command. Reads the last arpwatch entry for `$mac`.
///
/// Matches lines like:
/// ```text
/// Aug 24 17:34:41 juno arpwatch: new station 10.247.4.137 52:54:00:88:5a:0a eth0.4
/// Aug 24 17:37:19 juno arpwatch: changed ethernet address 10.247.4.137 52:54:00:27:33:00 (52:54:00:88:5a:0a) eth0.4
/// ```
pub const DEFAULT_IP_COMMAND: &str = r#"grep $mac /var/log/arpwatch.log|sed -e "s/new station//"|sed -e "s/changed ethernet address//g" |sed -e "s/reused old ethernet //" |tail -1 |cut -d ":" -f 4-| cut -d " " -f 3"#;

/// First libvirt release reporting DHCP leases (1.2.8).
pub const MIN_DHCP_LEASES_VERSION: u64 = 1_002_008;

/// How addresses are looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStrategy {
    DhcpLeases,
    IpCommand,
}

/// Whether the hypervisor answers DHCP lease queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseCapability {
    Supported,
    Unsupported,
}

/// Pick the lookup strategy from the lease capability and library version.
pub fn select_strategy(capability: LeaseCapability, lib_version: u64) -> AddressStrategy {
    if capability == LeaseCapability::Unsupported || lib_version < MIN_DHCP_LEASES_VERSION {
        AddressStrategy::IpCommand
    } else {
        AddressStrategy::DhcpLeases
    }
}

/// Replace everything but ASCII letters and digits with `_`.
pub fn clean_domain_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Dotted quad of 1-3 digit groups. Octet ranges are not checked.
pub fn is_ip_address(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| (1..=3).contains(&p.len()) && p.bytes().all(|b| b.is_ascii_digit()))
}

/// Per-call options for address lookups.
#[derive(Debug, Clone, Default)]
pub struct AddressOptions {
    /// Overrides the configured IP command template for this call
    pub ip_command: Option<String>,
}

/// What the resolver needs to know about a server.
#[derive(Debug, Clone, Copy)]
pub struct AddressTarget<'a> {
    pub name: &'a str,
    pub mac: Option<&'a str>,
    pub nics: &'a [Nic],
}

/// Resolves server addresses with a strategy chosen once.
#[derive(Debug, Clone, Default)]
pub struct AddressResolver {
    strategy: Option<AddressStrategy>,
}

impl AddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The strategy in use, if one was selected yet.
    pub fn strategy(&self) -> Option<AddressStrategy> {
        self.strategy
    }

    #[instrument(skip_all, fields(vm_name = %target.name))]
    pub async fn resolve(
        &mut self,
        service: &ComputeService,
        target: AddressTarget<'_>,
        options: &AddressOptions,
    ) -> Result<Addresses> {
        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => {
                let strategy = Self::detect_strategy(service, target.mac).await?;
                info!(?strategy, "Selected address lookup strategy");
                self.strategy = Some(strategy);
                strategy
            }
        };

        match strategy {
            AddressStrategy::DhcpLeases => lease_addresses(service, target).await,
            AddressStrategy::IpCommand => command_addresses(service, target, options).await,
        }
    }

    async fn detect_strategy(service: &ComputeService, mac: Option<&str>) -> Result<AddressStrategy> {
        let conn = &service.connection;

        let capability = match conn.list_networks().await {
            Ok(networks) => match networks.first() {
                Some(network) => match conn.network_dhcp_leases(&network.name, mac.unwrap_or_default()).await {
                    Ok(LeaseQuery::Unsupported) => LeaseCapability::Unsupported,
                    Ok(LeaseQuery::Supported(_)) => LeaseCapability::Supported,
                    Err(e) => {
                        debug!(error = %e, "Lease query failed, assuming leases are supported");
                        LeaseCapability::Supported
                    }
                },
                // Nothing to ask for leases
                None => LeaseCapability::Unsupported,
            },
            Err(e) => {
                debug!(error = %e, "Network listing failed, assuming leases are supported");
                LeaseCapability::Supported
            }
        };

        let version = conn
            .lib_version()
            .await
            .map_err(|e| ComputeError::hypervisor("Failed to read libvirt version", e))?;

        Ok(select_strategy(capability, version))
    }
}

/// The address of the latest lease for the primary NIC.
async fn lease_addresses(service: &ComputeService, target: AddressTarget<'_>) -> Result<Addresses> {
    let Some(mac) = target.mac else {
        return Ok(Addresses::default());
    };
    let Some(nic) = target.nics.iter().find(|n| n.mac.as_deref() == Some(mac)) else {
        return Ok(Addresses::default());
    };

    let conn = &service.connection;
    let networks = conn
        .list_networks()
        .await
        .map_err(|e| ComputeError::hypervisor("Failed to list networks", e))?;
    let Some(network) = networks.iter().find(|n| nic.network.as_deref() == Some(n.name.as_str())) else {
        return Ok(Addresses::default());
    };

    let leases = match conn
        .network_dhcp_leases(&network.name, mac)
        .await
        .map_err(|e| ComputeError::hypervisor(format!("Failed to read DHCP leases of {}", network.name), e))?
    {
        LeaseQuery::Supported(leases) => leases,
        LeaseQuery::Unsupported => {
            warn!(network = %network.name, "Network stopped reporting DHCP leases");
            return Ok(Addresses::default());
        }
    };

    // max_by_key keeps the last of equal maxima
    let ip = leases
        .into_iter()
        .filter(|l| l.mac.eq_ignore_ascii_case(mac))
        .max_by_key(|l| l.expirytime)
        .map(|l| l.ipaddr);

    Ok(Addresses::single(ip))
}

/// The address printed by the IP command.
async fn command_addresses(
    service: &ComputeService,
    target: AddressTarget<'_>,
    options: &AddressOptions,
) -> Result<Addresses> {
    let template = options
        .ip_command
        .as_deref()
        .or(service.config.ip_command.as_deref())
        .unwrap_or(DEFAULT_IP_COMMAND);

    let mac = target.mac.unwrap_or_default();
    let command = format!(
        "mac={}; server_name={}; {}",
        mac,
        clean_domain_name(target.name),
        template
    );

    let uri = service.connection.uri();
    let output = if uri.ssh_enabled() {
        ssh_ip_command(service, uri, &command, mac).await?
    } else if uri.transport == Transport::Tls {
        return Err(ComputeError::UnsupportedTransport(
            "TLS remote transport is not currently supported, only ssh".to_string(),
        ));
    } else {
        local_ip_command(&command).await?
    };

    let ip = output.trim();
    if ip.is_empty() {
        debug!("IP command found no address");
        return Ok(Addresses::default());
    }
    if !is_ip_address(ip) {
        return Err(ComputeError::MalformedResult {
            command,
            result: ip.to_string(),
        });
    }

    Ok(Addresses::single(Some(ip.to_string())))
}

async fn ssh_ip_command(
    service: &ComputeService,
    uri: &ConnectionUri,
    command: &str,
    mac: &str,
) -> Result<String> {
    let host = uri
        .host
        .as_deref()
        .ok_or_else(|| ComputeError::Configuration(format!("libvirt uri {} has no host", uri)))?;
    let user = uri.user.as_deref();

    let options = SessionOptions {
        keys: uri.keyfile.iter().map(Into::into).collect(),
        port: uri.port,
        no_verify: uri.no_verify,
        ..Default::default()
    };

    let results = service
        .executor
        .run(host, user, &options, &[command.to_string()])
        .await
        .map_err(|e| match e {
            SessionError::ConnectionRefused => ComputeError::Connectivity(format!(
                "Connection was refused to host {} to retrieve the ip_address for {}",
                host, mac
            )),
            SessionError::AuthenticationFailed => ComputeError::Authentication(format!(
                "Error authenticating over ssh to host {} and user {}",
                host,
                user.unwrap_or_default()
            )),
            other => ComputeError::Remote {
                host: host.to_string(),
                source: other,
            },
        })?;

    let result = results.into_iter().next().unwrap_or_default();
    if result.status != 0 {
        return Err(ComputeError::CommandFailed {
            command: command.to_string(),
            status: Some(result.status),
            output: result.stderr,
        });
    }

    Ok(result.stdout)
}

async fn local_ip_command(command: &str) -> Result<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| ComputeError::io("Failed to spawn sh", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ComputeError::CommandFailed {
            command: command.to_string(),
            status: output.status.code(),
            output: format!("{}{}", stdout, stderr),
        });
    }

    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_strategy() {
        assert_eq!(
            select_strategy(LeaseCapability::Supported, 1_002_008),
            AddressStrategy::DhcpLeases
        );
        assert_eq!(
            select_strategy(LeaseCapability::Supported, 1_002_007),
            AddressStrategy::IpCommand
        );
        assert_eq!(
            select_strategy(LeaseCapability::Unsupported, 9_000_000),
            AddressStrategy::IpCommand
        );
    }

    #[test]
    fn test_clean_domain_name() {
        assert_eq!(clean_domain_name("web-1.example_com"), "web_1_example_com");
        assert_eq!(clean_domain_name("héllo wörld"), "h_llo_w_rld");
        assert_eq!(clean_domain_name("héllo wörld-1"), "h_llo_w_rld_1");
        assert_eq!(clean_domain_name("plain"), "plain");
    }

    #[test]
    fn test_is_ip_address() {
        assert!(is_ip_address("192.168.1.10"));
        assert!(is_ip_address("999.1.1.1"));
        assert!(!is_ip_address("192.168.1"));
        assert!(!is_ip_address("192.168.1.1234"));
        assert!(!is_ip_address("a.b.c.d"));
        assert!(!is_ip_address("10.0.0.1 10.0.0.2"));
        assert!(!is_ip_address(""));
    }

    #[tokio::test]
    async fn test_local_ip_command() {
        assert_eq!(local_ip_command("echo 192.168.1.10").await.unwrap(), "192.168.1.10\n");

        let err = local_ip_command("echo oops >&2; exit 3").await.unwrap_err();
        match err {
            ComputeError::CommandFailed { status, output, .. } => {
                assert_eq!(status, Some(3));
                assert!(output.contains("oops"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
