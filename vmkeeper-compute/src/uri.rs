//! libvirt connection URI parsing.
//!
//! ```text
//! qemu:///system                                  local, unix socket
//! qemu+ssh://root@kvm1:2222/system?keyfile=...    tunneled over ssh
//! qemu+tls://kvm1/system                          remote, TLS
//! qemu://kvm1/system                              remote, TLS (libvirt default)
//! ```

use std::fmt;
use url::Url;

use crate::error::{ComputeError, Result};

/// Transport part of a libvirt URI (`driver+transport://`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Unix,
    Ssh,
    Tls,
    Tcp,
    Other(String),
}

impl Transport {
    pub fn as_str(&self) -> &str {
        match self {
            Transport::Unix => "unix",
            Transport::Ssh => "ssh",
            Transport::Tls => "tls",
            Transport::Tcp => "tcp",
            Transport::Other(s) => s,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed libvirt connection URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUri {
    raw: String,
    pub driver: String,
    pub transport: Transport,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// `?keyfile=` private key for the ssh transport
    pub keyfile: Option<String>,
    /// `?no_verify=1`
    pub no_verify: bool,
}

impl ConnectionUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| ComputeError::Configuration(format!("invalid libvirt uri '{}': {}", raw, e)))?;

        let (driver, explicit_transport) = match url.scheme().split_once('+') {
            Some((driver, transport)) => (driver.to_string(), Some(transport.to_string())),
            None => (url.scheme().to_string(), None),
        };

        let host = url.host_str().filter(|h| !h.is_empty()).map(str::to_string);
        let user = Some(url.username()).filter(|u| !u.is_empty()).map(str::to_string);

        let transport = match explicit_transport.as_deref() {
            Some("ssh") => Transport::Ssh,
            Some("tls") => Transport::Tls,
            Some("tcp") => Transport::Tcp,
            Some("unix") => Transport::Unix,
            Some(other) => Transport::Other(other.to_string()),
            // libvirt defaults to TLS for remote URIs without a transport
            None if host.is_some() => Transport::Tls,
            None => Transport::Unix,
        };

        let mut keyfile = None;
        let mut no_verify = false;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "keyfile" => keyfile = Some(value.into_owned()),
                "no_verify" => no_verify = value == "1",
                _ => {}
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            driver,
            transport,
            user,
            host,
            port: url.port(),
            keyfile,
            no_verify,
        })
    }

    /// The URI as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_remote(&self) -> bool {
        self.host.is_some()
    }

    /// Whether shell access to the hypervisor host is available over ssh.
    pub fn ssh_enabled(&self) -> bool {
        self.is_remote() && self.transport == Transport::Ssh
    }
}

impl Default for ConnectionUri {
    /// The local system connection, `qemu:///system`.
    fn default() -> Self {
        Self {
            raw: crate::config::DEFAULT_LIBVIRT_URI.to_string(),
            driver: "qemu".to_string(),
            transport: Transport::Unix,
            user: None,
            host: None,
            port: None,
            keyfile: None,
            no_verify: false,
        }
    }
}

impl fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_uri() {
        let uri = ConnectionUri::parse("qemu:///system").unwrap();
        assert_eq!(uri.driver, "qemu");
        assert_eq!(uri.transport, Transport::Unix);
        assert!(!uri.is_remote());
        assert!(!uri.ssh_enabled());
    }

    #[test]
    fn test_default_matches_parsed_local_uri() {
        let parsed = ConnectionUri::parse(crate::config::DEFAULT_LIBVIRT_URI).unwrap();
        assert_eq!(ConnectionUri::default(), parsed);
    }

    #[test]
    fn test_ssh_uri() {
        let uri = ConnectionUri::parse(
            "qemu+ssh://admin@kvm1.example.com:2222/system?keyfile=/home/admin/.ssh/id_ed25519&no_verify=1",
        )
        .unwrap();
        assert_eq!(uri.transport, Transport::Ssh);
        assert_eq!(uri.user.as_deref(), Some("admin"));
        assert_eq!(uri.host.as_deref(), Some("kvm1.example.com"));
        assert_eq!(uri.port, Some(2222));
        assert_eq!(uri.keyfile.as_deref(), Some("/home/admin/.ssh/id_ed25519"));
        assert!(uri.no_verify);
        assert!(uri.ssh_enabled());
    }

    #[test]
    fn test_remote_default_transport_is_tls() {
        let uri = ConnectionUri::parse("qemu://kvm1/system").unwrap();
        assert_eq!(uri.transport, Transport::Tls);
        assert!(!uri.ssh_enabled());
    }

    #[test]
    fn test_invalid_uri() {
        assert!(matches!(
            ConnectionUri::parse("not a uri"),
            Err(ComputeError::Configuration(_))
        ));
    }
}
