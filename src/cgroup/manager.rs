//! Fans a single [`ResourceConfig`] out across all cgroup-v1 controllers for
//! one container's cgroup path.

use crate::cgroup::controller::{Controller, CpuController, CpuSetController, MemoryController, ResourceConfig};
use crate::error::Result;
use crate::paths::MYDOCKER_CGROUP_NAME;

pub struct CgroupManager {
    rel: String,
    controllers: Vec<Box<dyn Controller>>,
}

impl CgroupManager {
    pub fn new() -> Self {
        Self {
            rel: MYDOCKER_CGROUP_NAME.to_string(),
            controllers: vec![
                Box::new(MemoryController),
                Box::new(CpuController),
                Box::new(CpuSetController),
            ],
        }
    }

    /// Writes limit files for every controller. Aborts on the first failing
    /// controller: a partially-applied limit is worse than a clearly failed
    /// run.
    pub fn set(&self, config: &ResourceConfig) -> Result<()> {
        for controller in &self.controllers {
            controller.set(&self.rel, config)?;
        }
        Ok(())
    }

    /// Adds `pid` to every controller's `tasks` file.
    pub fn apply(&self, pid: u32) -> Result<()> {
        for controller in &self.controllers {
            controller.apply(&self.rel, pid)?;
        }
        Ok(())
    }

    /// Removes the cgroup directory from every controller. Best-effort: a
    /// failure on one controller does not stop the others from being tried.
    pub fn remove(&self) {
        for controller in &self.controllers {
            if let Err(e) = controller.remove(&self.rel) {
                log::warn!("failed to remove {} cgroup: {}", controller.name(), e);
            }
        }
    }
}

impl Default for CgroupManager {
    fn default() -> Self {
        Self::new()
    }
}
