//! Bitmap IP address allocator over a CIDR, persisted to a single JSON file.
//!
//! Index 0 is reserved for the network's gateway (the first allocation on a
//! fresh subnet always returns it). Allocation is first-fit, left to right.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::error::{err, Behavior, Category, Error, Result};
use crate::paths;

pub struct Ipam {
    path: PathBuf,
}

fn parse_cidr(cidr: &str) -> Result<(u32, u8)> {
    let (addr, prefix) = cidr.split_once('/').ok_or_else(|| {
        err!(
            Category::Network,
            Behavior::InvalidParam,
            "subnet '{}' is not a CIDR",
            cidr
        )
    })?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| {
        err!(
            Category::Network,
            Behavior::InvalidParam,
            "subnet '{}' has an invalid address",
            cidr
        )
    })?;
    let prefix: u8 = prefix.parse().map_err(|_| {
        err!(
            Category::Network,
            Behavior::InvalidParam,
            "subnet '{}' has an invalid prefix",
            cidr
        )
    })?;
    Ok((u32::from(addr), prefix))
}

fn bitmap_len(prefix: u8) -> usize {
    1usize << (32 - prefix as u32)
}

impl Ipam {
    pub fn new() -> Self {
        Self {
            path: paths::ipam_default_allocator_path(),
        }
    }

    #[cfg(test)]
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read_to_string(&self.path).map_err(|e| {
            Error::wrap(Category::Network, Behavior::Read, "reading IPAM state", e)
        })?;
        serde_json::from_str(&data).map_err(|e| {
            Error::wrap(Category::Network, Behavior::Convert, "parsing IPAM state JSON", e)
        })
    }

    fn save(&self, subnets: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::wrap(Category::Network, Behavior::Write, "creating IPAM state dir", e)
            })?;
        }
        let data = serde_json::to_string(subnets).map_err(|e| {
            Error::wrap(Category::Network, Behavior::Convert, "serializing IPAM state", e)
        })?;
        fs::write(&self.path, data).map_err(|e| {
            Error::wrap(Category::Network, Behavior::Write, "writing IPAM state", e)
        })
    }

    /// Allocates the first free address in `subnet`, reserving it.
    pub fn allocate(&self, subnet: &str) -> Result<Ipv4Addr> {
        let (network, prefix) = parse_cidr(subnet)?;
        let mut subnets = self.load()?;

        let bitmap = subnets
            .entry(subnet.to_string())
            .or_insert_with(|| "0".repeat(bitmap_len(prefix)));

        let index = bitmap.find('0').ok_or_else(|| {
            err!(
                Category::Network,
                Behavior::IpamExec,
                "subnet '{}' has no free addresses",
                subnet
            )
        })?;

        let mut bytes: Vec<u8> = bitmap.bytes().collect();
        bytes[index] = b'1';
        *bitmap = String::from_utf8(bytes).unwrap();

        self.save(&subnets)?;

        Ok(Ipv4Addr::from(network.wrapping_add(index as u32).wrapping_add(1)))
    }

    /// Releases a previously allocated address back to `subnet`.
    pub fn release(&self, subnet: &str, ip: Ipv4Addr) -> Result<()> {
        let (network, prefix) = parse_cidr(subnet)?;
        let mut subnets = self.load()?;

        let bitmap = subnets
            .entry(subnet.to_string())
            .or_insert_with(|| "0".repeat(bitmap_len(prefix)));

        let ip_u32 = u32::from(ip);
        let index = (ip_u32.wrapping_sub(network).wrapping_sub(1)) as usize;

        let mut bytes: Vec<u8> = bitmap.bytes().collect();
        if index >= bytes.len() {
            return Err(err!(
                Category::Network,
                Behavior::InvalidParam,
                "address {} is not part of subnet '{}'",
                ip,
                subnet
            ));
        }
        bytes[index] = b'0';
        *bitmap = String::from_utf8(bytes).unwrap();

        self.save(&subnets)
    }
}

impl Default for Ipam {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_ipam() -> (Ipam, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subnet.json");
        (Ipam::at(path), dir)
    }

    #[test]
    fn first_allocation_is_the_gateway() {
        let (ipam, _dir) = scratch_ipam();
        let ip = ipam.allocate("192.168.10.0/24").unwrap();
        assert_eq!(ip, "192.168.10.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn allocations_are_monotonic_first_fit() {
        let (ipam, _dir) = scratch_ipam();
        let a = ipam.allocate("192.168.10.0/24").unwrap();
        let b = ipam.allocate("192.168.10.0/24").unwrap();
        let c = ipam.allocate("192.168.10.0/24").unwrap();
        assert_eq!(a, "192.168.10.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b, "192.168.10.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(c, "192.168.10.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn release_then_allocate_reuses_the_freed_index() {
        let (ipam, _dir) = scratch_ipam();
        let a = ipam.allocate("192.168.10.0/24").unwrap();
        let b = ipam.allocate("192.168.10.0/24").unwrap();
        ipam.release("192.168.10.0/24", a).unwrap();
        let c = ipam.allocate("192.168.10.0/24").unwrap();
        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn full_round_trip_restores_all_zero_bitmap() {
        let (ipam, dir) = scratch_ipam();
        let subnet = "10.0.0.0/30"; // 4 addresses
        let mut allocated = vec![];
        for _ in 0..4 {
            allocated.push(ipam.allocate(subnet).unwrap());
        }
        for ip in allocated {
            ipam.release(subnet, ip).unwrap();
        }

        let raw = fs::read_to_string(dir.path().join("subnet.json")).unwrap();
        let subnets: HashMap<String, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(subnets[subnet], "0000");
    }
}
