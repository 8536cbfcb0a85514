//! IPv4 network helpers for the scanner: interface enumeration, subnet
//! iteration, and TCP port probing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::InvalidArgument(format!(
                "invalid prefix length: {prefix} (must be 0-32)"
            )));
        }
        Ok(Self { addr, prefix })
    }

    /// Parse CIDR notation ("192.168.1.0/24"). A bare IP parses as a /32.
    pub fn parse(cidr: &str) -> Result<Self> {
        match cidr.split_once('/') {
            None => {
                let addr: Ipv4Addr = cidr
                    .parse()
                    .map_err(|e| Error::InvalidArgument(format!("invalid IP {cidr}: {e}")))?;
                Ok(Self { addr, prefix: 32 })
            }
            Some((ip, prefix)) => {
                let addr: Ipv4Addr = ip
                    .parse()
                    .map_err(|e| Error::InvalidArgument(format!("invalid IP {ip}: {e}")))?;
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|e| Error::InvalidArgument(format!("invalid prefix {prefix}: {e}")))?;
                Self::new(addr, prefix)
            }
        }
    }

    /// Enumerate the host addresses of the network. Network and broadcast
    /// addresses are skipped for /24 and longer prefixes; a /32 yields its
    /// single address.
    pub fn host_addrs(&self) -> Vec<Ipv4Addr> {
        if self.prefix == 32 {
            return vec![self.addr];
        }
        let base = u32::from(self.addr);
        let mask = if self.prefix == 0 {
            0
        } else {
            !((1u32 << (32 - self.prefix)) - 1)
        };
        let network = base & mask;
        let broadcast = network | !mask;

        let (start, end) = if self.prefix >= 24 {
            (network + 1, broadcast.saturating_sub(1))
        } else {
            (network, broadcast)
        };

        (start..=end).map(Ipv4Addr::from).collect()
    }

    /// Number of addresses covered by the prefix.
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix as u32)
    }
}

impl std::fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// One local IPv4 interface address, as reported by `ip -o -4 addr show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceNet {
    pub name: String,
    pub network: Ipv4Net,
}

/// Enumerate local IPv4 interfaces and their networks, excluding interfaces
/// whose name starts with any deny-list prefix.
pub async fn list_interface_networks(denylist: &[String]) -> Result<Vec<InterfaceNet>> {
    let output = Command::new("ip")
        .args(["-o", "-4", "addr", "show"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Transport(format!("could not run `ip addr`: {e}")))?;

    if !output.status.success() {
        return Err(Error::Transport(format!(
            "`ip addr` returned non-zero status: {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_ip_addr_output(&stdout, denylist))
}

/// Parse `ip -o -4 addr show` output.
/// Lines look like: "2: enp2s0    inet 192.168.1.5/24 brd 192.168.1.255 scope global ..."
fn parse_ip_addr_output(stdout: &str, denylist: &[String]) -> Vec<InterfaceNet> {
    let mut nets = Vec::new();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let _index = parts.next();
        let name = match parts.next() {
            Some(n) => n.trim_end_matches(':'),
            None => continue,
        };
        if denylist.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            continue;
        }
        // Find the "inet a.b.c.d/p" pair
        let mut rest = parts;
        while let Some(word) = rest.next() {
            if word == "inet" {
                if let Some(cidr) = rest.next() {
                    if let Ok(network) = Ipv4Net::parse(cidr) {
                        nets.push(InterfaceNet {
                            name: name.to_string(),
                            network,
                        });
                    }
                }
                break;
            }
        }
    }
    nets
}

/// Probe a single TCP port. Open means the connect succeeded within the
/// timeout; refusals and timeouts both count as closed.
pub async fn probe_port(ip: Ipv4Addr, port: u16, probe_timeout: Duration) -> bool {
    let addr = SocketAddr::new(IpAddr::V4(ip), port);
    matches!(timeout(probe_timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}
