//! The three cgroup-v1 controllers this runtime configures: memory, cpu and
//! cpuset. Each shares the same Set/Apply/Remove skeleton with a different
//! set of files.

use std::fs;

use crate::cgroup::mount::cgroup_path;
use crate::error::{Behavior, Category, Result};

/// Resource limits requested for one container. An empty/zero field means
/// "leave untouched", not "set to zero".
#[derive(Debug, Clone, Default)]
pub struct ResourceConfig {
    pub memory_limit: String,
    pub cpu_cfs_quota: i64,
    pub cpu_share: String,
    pub cpu_set: String,
}

const CPU_CFS_PERIOD_US: i64 = 100_000;

fn write_cgroup_file(controller: &str, rel: &str, file: &str, contents: &str) -> Result<()> {
    let dir = cgroup_path(controller, rel, true)?;
    fs::write(dir.join(file), contents).map_err(|e| {
        crate::error::Error::wrap(
            Category::Cgroups,
            Behavior::Write,
            format!("writing {}/{}", rel, file),
            e,
        )
    })
}

pub trait Controller {
    /// The controller's subsystem name as it appears in mountinfo.
    fn name(&self) -> &'static str;

    /// Writes the limit files for this controller. A no-op when the config
    /// carries nothing relevant to this controller.
    fn set(&self, rel: &str, config: &ResourceConfig) -> Result<()>;

    /// Adds `pid` to the `tasks` file of the (auto-created) cgroup directory.
    fn apply(&self, rel: &str, pid: u32) -> Result<()> {
        write_cgroup_file(self.name(), rel, "tasks", &pid.to_string())
    }

    /// Deletes the cgroup directory and everything under it. Best-effort:
    /// absence of the directory is not an error.
    fn remove(&self, rel: &str) -> Result<()> {
        match cgroup_path(self.name(), rel, false) {
            Ok(dir) => {
                if dir.exists() {
                    fs::remove_dir_all(&dir).map_err(|e| {
                        crate::error::Error::wrap(
                            Category::Cgroups,
                            Behavior::Write,
                            format!("removing cgroup directory {:?}", dir),
                            e,
                        )
                    })?;
                }
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }
}

pub struct MemoryController;

impl Controller for MemoryController {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set(&self, rel: &str, config: &ResourceConfig) -> Result<()> {
        if config.memory_limit.is_empty() {
            return Ok(());
        }
        write_cgroup_file(self.name(), rel, "memory.limit_in_bytes", &config.memory_limit)
    }
}

pub struct CpuController;

impl Controller for CpuController {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn set(&self, rel: &str, config: &ResourceConfig) -> Result<()> {
        if !config.cpu_share.is_empty() {
            write_cgroup_file(self.name(), rel, "cpu.shares", &config.cpu_share)?;
        }
        if config.cpu_cfs_quota != 0 {
            write_cgroup_file(
                self.name(),
                rel,
                "cpu.cfs_period_us",
                &CPU_CFS_PERIOD_US.to_string(),
            )?;
            let quota = CPU_CFS_PERIOD_US / 100 * config.cpu_cfs_quota;
            write_cgroup_file(self.name(), rel, "cpu.cfs_quota_us", &quota.to_string())?;
        }
        Ok(())
    }
}

pub struct CpuSetController;

impl Controller for CpuSetController {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn set(&self, rel: &str, config: &ResourceConfig) -> Result<()> {
        if config.cpu_set.is_empty() {
            return Ok(());
        }
        write_cgroup_file(self.name(), rel, "cpuset.cpus", &config.cpu_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quota_formula_matches_spec() {
        let config = ResourceConfig {
            cpu_cfs_quota: 20,
            ..Default::default()
        };
        let quota = CPU_CFS_PERIOD_US / 100 * config.cpu_cfs_quota;
        assert_eq!(CPU_CFS_PERIOD_US, 100_000);
        assert_eq!(quota, 20_000);
    }

    #[test]
    fn empty_config_is_not_an_error_to_construct() {
        let config = ResourceConfig::default();
        assert!(config.memory_limit.is_empty());
        assert_eq!(config.cpu_cfs_quota, 0);
    }
}
