//! Centralizes every on-disk path this crate touches so components never
//! hand-assemble path strings. Each root is overridable by an environment
//! variable for testability; defaults match the bit-exact layout.

use std::path::PathBuf;

pub const MYDOCKER_CGROUP_NAME: &str = "mydocker-cgroup";

fn env_or(var: &str, default: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

/// Root directory holding image archives and per-container overlay trees.
pub fn root_dir() -> PathBuf {
    env_or("MYDOCKER_ROOT_DIR", "/root")
}

/// Root directory holding detached container logs.
pub fn log_dir() -> PathBuf {
    env_or("MYDOCKER_LOG_DIR", "/var/run/mydocker/log")
}

/// Root directory holding per-container config.json metadata.
pub fn json_dir() -> PathBuf {
    env_or("MYDOCKER_JSON_DIR", "/var/run/mydocker/containers")
}

/// Root directory holding per-network JSON records.
pub fn network_dir() -> PathBuf {
    env_or("MYDOCKER_NETWORK_DIR", "/var/run/Mydocker/network/network")
}

/// Path of the IPAM bitmap-allocator state file.
pub fn ipam_default_allocator_path() -> PathBuf {
    env_or(
        "MYDOCKER_IPAM_FILE",
        "/var/run/Mydocker/network/ipam/subnet.json",
    )
}

pub fn image_archive_path(image: &str) -> PathBuf {
    root_dir().join(format!("{}.tar", image))
}

pub fn image_commit_path(image: &str) -> PathBuf {
    root_dir().join(format!("{}.tar.gz", image))
}

pub fn container_root(name: &str) -> PathBuf {
    root_dir().join(name)
}

pub fn lower_dir(name: &str) -> PathBuf {
    container_root(name).join("lower")
}

pub fn upper_dir(name: &str) -> PathBuf {
    container_root(name).join("upper")
}

pub fn work_dir(name: &str) -> PathBuf {
    container_root(name).join("work")
}

pub fn merged_dir(name: &str) -> PathBuf {
    container_root(name).join("merged")
}

pub fn container_log_dir(name: &str) -> PathBuf {
    log_dir().join(name)
}

pub fn container_log_file(name: &str) -> PathBuf {
    container_log_dir(name).join("container.log")
}

pub fn container_meta_dir(name: &str) -> PathBuf {
    json_dir().join(name)
}

pub fn container_config_file(name: &str) -> PathBuf {
    container_meta_dir(name).join("config.json")
}

pub fn network_file(name: &str) -> PathBuf {
    network_dir().join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_bit_exact_paths() {
        std::env::remove_var("MYDOCKER_ROOT_DIR");
        assert_eq!(image_archive_path("busybox"), PathBuf::from("/root/busybox.tar"));
        assert_eq!(
            merged_dir("c1").to_str().unwrap(),
            "/root/c1/merged"
        );
    }

    #[test]
    fn env_override_is_honored() {
        std::env::set_var("MYDOCKER_ROOT_DIR", "/tmp/scratch-root");
        assert_eq!(
            image_archive_path("busybox"),
            PathBuf::from("/tmp/scratch-root/busybox.tar")
        );
        std::env::remove_var("MYDOCKER_ROOT_DIR");
    }
}
