//! Bridge network driver: creates a Linux bridge, assigns it the subnet
//! gateway, attaches veth pairs to it, and installs the SNAT rule that lets
//! traffic from the bridge reach the outside world.
//!
//! Link/address/route mutation is done by shelling out to the `ip` utility,
//! the same way this crate already treats `mount`/`umount`/`iptables`/`tar`
//! as external collaborators: this crate's own netlink code only reads
//! interface state (RTM_GETLINK/RTM_GETADDR dumps), it has no write-side
//! (RTM_NEWLINK/RTM_NEWADDR) support to build a from-scratch driver on.

use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

use crate::error::{err, Behavior, Category, Result};

const LINK_LOOKUP_RETRIES: u32 = 2;
const LINK_LOOKUP_BACKOFF: Duration = Duration::from_secs(2);

fn run_ip(args: &[&str]) -> Result<()> {
    let status = Command::new("ip").args(args).status().map_err(|e| {
        crate::error::Error::wrap(
            Category::Network,
            Behavior::DriverExec,
            format!("running ip {}", args.join(" ")),
            e,
        )
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

fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", name])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Creates (idempotently) a bridge named `name`, assigns it `gateway_cidr`
/// (e.g. "192.168.10.1/24"), brings it up, and adds the subnet's SNAT rule.
pub fn create(subnet: &str, gateway_cidr: &str, name: &str) -> Result<()> {
    if !link_exists(name) {
        run_ip(&["link", "add", name, "type", "bridge"])?;
    }

    let mut attempt = 0;
    loop {
        match run_ip(&["addr", "add", gateway_cidr, "dev", name]) {
            Ok(()) => break,
            Err(_) if attempt < LINK_LOOKUP_RETRIES => {
                attempt += 1;
                sleep(LINK_LOOKUP_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }

    run_ip(&["link", "set", name, "up"])?;

    add_snat_rule(subnet, name)
}

fn add_snat_rule(subnet: &str, bridge: &str) -> Result<()> {
    let status = Command::new("iptables")
        .args([
            "-t", "nat", "-A", "POSTROUTING", "-s", subnet, "!", "-o", bridge, "-j", "MASQUERADE",
        ])
        .status()
        .map_err(|e| {
            crate::error::Error::wrap(Category::Network, Behavior::Iptables, "adding SNAT rule", e)
        })?;
    if !status.success() {
        return Err(err!(
            Category::Network,
            Behavior::Iptables,
            "iptables SNAT rule for subnet {} exited with {:?}",
            subnet,
            status.code()
        ));
    }
    Ok(())
}

fn remove_snat_rule(subnet: &str, bridge: &str) -> Result<()> {
    // -D mirrors the -A invocation; absence of the rule is not fatal.
    let _ = Command::new("iptables")
        .args([
            "-t", "nat", "-D", "POSTROUTING", "-s", subnet, "!", "-o", bridge, "-j", "MASQUERADE",
        ])
        .status();
    Ok(())
}

/// Removes the bridge link and its SNAT rule. Symmetric teardown of
/// [`create`] (a design improvement over leaving the iptables rule behind).
pub fn delete(subnet: &str, name: &str) -> Result<()> {
    remove_snat_rule(subnet, name)?;
    if link_exists(name) {
        run_ip(&["link", "delete", name])?;
    }
    Ok(())
}

/// Creates a veth pair, attaches the host side to `bridge`, and brings the
/// host side up. Returns `(host_side, container_side)` device names.
pub fn connect(bridge: &str, endpoint_id: &str) -> Result<(String, String)> {
    let suffix: String = endpoint_id.chars().take(5).collect();
    let host_side = suffix.clone();
    let container_side = format!("cif-{}", suffix);

    run_ip(&[
        "link", "add", &host_side, "type", "veth", "peer", "name", &container_side,
    ])?;
    run_ip(&["link", "set", &host_side, "master", bridge])?;
    run_ip(&["link", "set", &host_side, "up"])?;

    Ok((host_side, container_side))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_derives_device_names_from_endpoint_prefix() {
        let suffix: String = "abcde12345-mynet".chars().take(5).collect();
        let (host, container) = (suffix.clone(), "cif-abcde".to_string());
        assert_eq!(host, suffix);
        assert_eq!(container, format!("cif-{}", suffix));
    }
}
