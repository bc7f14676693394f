//! Registry of on-disk networks plus the per-container attach/detach flow:
//! allocate an IP, wire up a veth pair, enter the container's network
//! namespace to configure the peer end, and install any requested port DNAT.

use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::Command;

use nix::fcntl::OFlag;
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};

use crate::error::{err, Behavior, Category, Error, Result};
use crate::network::bridge;
use crate::network::ipam::Ipam;
use crate::paths;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    /// CIDR with the gateway IP substituted in as the address component.
    pub ip_range: String,
    pub driver: String,
}

impl Network {
    pub fn gateway(&self) -> Result<Ipv4Addr> {
        let (addr, _) = self.ip_range.split_once('/').ok_or_else(|| {
            err!(
                Category::Network,
                Behavior::InvalidParam,
                "network '{}' has a malformed ip_range",
                self.name
            )
        })?;
        addr.parse().map_err(|_| {
            err!(
                Category::Network,
                Behavior::InvalidParam,
                "network '{}' has an invalid gateway address",
                self.name
            )
        })
    }

    pub fn prefix_len(&self) -> Result<u8> {
        let (_, prefix) = self.ip_range.split_once('/').ok_or_else(|| {
            err!(
                Category::Network,
                Behavior::InvalidParam,
                "network '{}' has a malformed ip_range",
                self.name
            )
        })?;
        prefix.parse().map_err(|_| {
            err!(
                Category::Network,
                Behavior::InvalidParam,
                "network '{}' has an invalid prefix",
                self.name
            )
        })
    }
}

/// A container's attachment to a network. Not persisted; rebuilt on each
/// `run`/`rm` invocation from the container's stored port mappings.
pub struct EndPoint {
    pub id: String,
    pub ip_address: Ipv4Addr,
    pub port_mapping: Vec<String>,
}

pub struct NetworkManager {
    ipam: Ipam,
}

impl NetworkManager {
    pub fn new() -> Self {
        Self { ipam: Ipam::new() }
    }

    fn networks_dir(&self) -> PathBuf {
        paths::network_dir()
    }

    /// Loads every persisted network.
    pub fn list(&self) -> Result<Vec<Network>> {
        let dir = self.networks_dir();
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut out = vec![];
        for entry in fs::read_dir(&dir)
            .map_err(|e| Error::wrap(Category::Network, Behavior::Read, "listing networks dir", e))?
        {
            let entry = entry.map_err(|e| Error::wrap(Category::Network, Behavior::Read, "reading networks dir entry", e))?;
            let data = fs::read_to_string(entry.path())
                .map_err(|e| Error::wrap(Category::Network, Behavior::Read, "reading network file", e))?;
            let network: Network = serde_json::from_str(&data)
                .map_err(|e| Error::wrap(Category::Network, Behavior::Convert, "parsing network JSON", e))?;
            out.push(network);
        }
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Result<Network> {
        let path = paths::network_file(name);
        let data = fs::read_to_string(&path).map_err(|e| {
            Error::wrap(Category::Network, Behavior::NotFound, format!("network '{}' not found", name), e)
        })?;
        serde_json::from_str(&data)
            .map_err(|e| Error::wrap(Category::Network, Behavior::Convert, "parsing network JSON", e))
    }

    fn save(&self, network: &Network) -> Result<()> {
        let dir = self.networks_dir();
        fs::create_dir_all(&dir).map_err(|e| Error::wrap(Category::Network, Behavior::Write, "creating networks dir", e))?;
        let data = serde_json::to_string(network)
            .map_err(|e| Error::wrap(Category::Network, Behavior::Convert, "serializing network", e))?;
        fs::write(paths::network_file(&network.name), data)
            .map_err(|e| Error::wrap(Category::Network, Behavior::Write, "writing network file", e))
    }

    pub fn create_network(&self, driver: &str, subnet: &str, name: &str) -> Result<Network> {
        if driver != "bridge" {
            return Err(err!(
                Category::Network,
                Behavior::UnsupportedType,
                "unsupported network driver '{}'",
                driver
            ));
        }

        let gateway = self.ipam.allocate(subnet)?;
        let prefix = subnet.split_once('/').map(|(_, p)| p).unwrap_or("24");
        let ip_range = format!("{}/{}", gateway, prefix);

        bridge::create(subnet, &ip_range, name)?;

        let network = Network {
            name: name.to_string(),
            ip_range,
            driver: driver.to_string(),
        };
        self.save(&network)?;
        Ok(network)
    }

    pub fn delete_network(&self, name: &str) -> Result<()> {
        let network = self.get(name)?;
        let gateway = network.gateway()?;
        let subnet = self.subnet_of(&network)?;

        self.ipam.release(&subnet, gateway)?;
        bridge::delete(&subnet, name)?;

        fs::remove_file(paths::network_file(name))
            .map_err(|e| Error::wrap(Category::Network, Behavior::Write, "removing network file", e))
    }

    fn subnet_of(&self, network: &Network) -> Result<String> {
        let prefix = network.prefix_len()?;
        let gateway = u32::from(network.gateway()?);
        let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
        let network_addr = Ipv4Addr::from(gateway & mask);
        Ok(format!("{}/{}", network_addr, prefix))
    }

    /// Attaches `container_pid`'s network namespace to `network_name`,
    /// assigning it an IP and publishing `port_mapping`.
    pub fn connect(
        &self,
        network_name: &str,
        container_id: &str,
        container_pid: i32,
        port_mapping: &[String],
    ) -> Result<EndPoint> {
        let network = self.get(network_name)?;
        let subnet = self.subnet_of(&network)?;
        let ip = self.ipam.allocate(&subnet)?;

        let endpoint_id = format!("{}-{}", container_id, network_name);
        let (host_side, container_side) = bridge::connect(network_name, &endpoint_id)?;

        configure_peer_in_namespace(
            &container_side,
            container_pid,
            ip,
            network.prefix_len()?,
            network.gateway()?,
        )
        .map_err(|e| {
            let _ = Command::new("ip").args(["link", "delete", &host_side]).status();
            e
        })?;

        for mapping in port_mapping {
            if let Err(e) = add_port_mapping(mapping, ip) {
                log::warn!("skipping malformed port mapping '{}': {}", mapping, e);
            }
        }

        Ok(EndPoint {
            id: endpoint_id,
            ip_address: ip,
            port_mapping: port_mapping.to_vec(),
        })
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Guards a setns() call with automatic restoration of the caller's original
/// network namespace. `setns` is per-OS-thread; this crate runs its CLI
/// logic on a single thread with no pool, so "pin to one OS thread" is
/// satisfied by construction rather than by an explicit lock.
struct NetnsGuard {
    original: RawFd,
}

impl NetnsGuard {
    fn enter(pid: i32) -> Result<Self> {
        let original = nix::fcntl::open("/proc/self/ns/net", OFlag::O_RDONLY, Mode::empty())
            .map_err(|e| netns_err("opening current netns", e))?;

        let target = nix::fcntl::open(
            format!("/proc/{}/ns/net", pid).as_str(),
            OFlag::O_RDONLY,
            Mode::empty(),
        )
        .map_err(|e| netns_err("opening target netns", e))?;

        let result = setns(target, CloneFlags::CLONE_NEWNET).map_err(|e| netns_err("entering target netns", e));
        let _ = nix::unistd::close(target);

        result?;
        Ok(Self { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.original, CloneFlags::CLONE_NEWNET) {
            log::error!("failed to restore original network namespace: {}", e);
        }
        let _ = nix::unistd::close(self.original);
    }
}

fn netns_err(msg: &str, e: nix::Error) -> Error {
    Error::wrap(
        Category::Network,
        Behavior::Addr,
        msg,
        std::io::Error::from_raw_os_error(e as i32),
    )
}

fn configure_peer_in_namespace(
    container_side: &str,
    container_pid: i32,
    ip: Ipv4Addr,
    prefix: u8,
    gateway: Ipv4Addr,
) -> Result<()> {
    run_ip(&["link", "set", container_side, "netns", &container_pid.to_string()])?;

    let _guard = NetnsGuard::enter(container_pid)?;

    run_ip(&["addr", "add", &format!("{}/{}", ip, prefix), "dev", container_side])?;
    run_ip(&["link", "set", container_side, "up"])?;
    run_ip(&["link", "set", "lo", "up"])?;
    run_ip(&[
        "route", "add", "default", "via", &gateway.to_string(), "dev", container_side,
    ])?;

    Ok(())
}

fn run_ip(args: &[&str]) -> Result<()> {
    let status = Command::new("ip").args(args).status().map_err(|e| {
        Error::wrap(Category::Network, Behavior::DriverExec, format!("running ip {}", args.join(" ")), e)
    })?;
    if !status.success() {
        return Err(err!(
            Category::Network,
            Behavior::Link,
            "ip {} exited with {:?}",
            args.join(" "),
            status.code()
        ));
    }
    Ok(())
}

fn add_port_mapping(mapping: &str, container_ip: Ipv4Addr) -> Result<()> {
    let (host_port, container_port) = mapping.split_once(':').ok_or_else(|| {
        err!(
            Category::Network,
            Behavior::InvalidParam,
            "port mapping '{}' must be 'hostPort:containerPort'",
            mapping
        )
    })?;

    let status = Command::new("iptables")
        .args([
            "-t",
            "nat",
            "-A",
            "PREROUTING",
            "-p",
            "tcp",
            "-m",
            "tcp",
            "--dport",
            host_port,
            "-j",
            "DNAT",
            "--to-destination",
            &format!("{}:{}", container_ip, container_port),
        ])
        .status()
        .map_err(|e| Error::wrap(Category::Network, Behavior::Iptables, "adding DNAT rule", e))?;

    if !status.success() {
        return Err(err!(
            Category::Network,
            Behavior::Iptables,
            "iptables DNAT rule for {} exited with {:?}",
            mapping,
            status.code()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_and_prefix_parse_from_ip_range() {
        let network = Network {
            name: "testnet".into(),
            ip_range: "192.168.10.1/24".into(),
            driver: "bridge".into(),
        };
        assert_eq!(network.gateway().unwrap(), "192.168.10.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(network.prefix_len().unwrap(), 24);
    }

    #[test]
    fn add_port_mapping_rejects_spec_without_colon() {
        let err = add_port_mapping("8080", "10.0.0.2".parse().unwrap()).unwrap_err();
        assert_eq!(err.behavior(), Behavior::InvalidParam);
    }
}
