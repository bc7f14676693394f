//! Resolves cgroup-v1 controller mountpoints from `/proc/self/mountinfo`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{err, Behavior, Category, Result};

/// Finds the host mountpoint backing a cgroup-v1 controller (e.g. "memory",
/// "cpu", "cpuset") by scanning `/proc/self/mountinfo`.
///
/// Each mountinfo line looks like:
///   36 35 0:28 / /sys/fs/cgroup/memory rw,... - cgroup cgroup rw,memory
/// Field 5 (0-indexed 4) is the mount path; the super-options after the
/// trailing " - " segment name the controllers bound there.
pub fn find_cgroup_mount_point(controller: &str) -> Result<PathBuf> {
    let data = fs::read_to_string("/proc/self/mountinfo").map_err(|e| {
        err_wrap_io("reading /proc/self/mountinfo", e)
    })?;

    for line in data.lines() {
        let separator = match line.find(" - ") {
            Some(idx) => idx,
            None => continue,
        };
        let (pre, post) = line.split_at(separator);
        let post = &post[3..]; // skip " - "

        let pre_fields: Vec<&str> = pre.split_whitespace().collect();
        let post_fields: Vec<&str> = post.split_whitespace().collect();
        if pre_fields.len() < 5 || post_fields.len() < 3 {
            continue;
        }

        let fs_type = post_fields[1];
        if fs_type != "cgroup" {
            continue;
        }
        let super_options = post_fields[2];
        if super_options.split(',').any(|opt| opt == controller) {
            return Ok(PathBuf::from(pre_fields[4]));
        }
    }

    Err(err!(
        Category::Cgroups,
        Behavior::NotFound,
        "no mountpoint found for cgroup controller '{}'",
        controller
    ))
}

fn err_wrap_io(msg: &str, e: std::io::Error) -> crate::error::Error {
    crate::error::Error::wrap(Category::Cgroups, Behavior::Read, msg, e)
}

/// Joins a controller's mountpoint with a relative cgroup path, creating the
/// directory when `auto_create` is true and it does not yet exist.
pub fn cgroup_path(controller: &str, rel: &str, auto_create: bool) -> Result<PathBuf> {
    let mount_point = find_cgroup_mount_point(controller)?;
    let absolute = join_rel(&mount_point, rel);

    if auto_create && !absolute.exists() {
        fs::create_dir_all(&absolute).map_err(|e| {
            crate::error::Error::wrap(
                Category::Cgroups,
                Behavior::Write,
                format!("creating cgroup directory {:?}", absolute),
                e,
            )
        })?;
    }

    Ok(absolute)
}

fn join_rel(base: &Path, rel: &str) -> PathBuf {
    let rel = rel.trim_start_matches('/');
    base.join(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mount_path_from_a_representative_line() {
        let line = "36 35 0:28 / /sys/fs/cgroup/memory rw,nosuid,nodev,noexec,relatime shared:16 - cgroup cgroup rw,memory";
        let sep = line.find(" - ").unwrap();
        let (pre, post) = line.split_at(sep);
        let post = &post[3..];
        let pre_fields: Vec<&str> = pre.split_whitespace().collect();
        let post_fields: Vec<&str> = post.split_whitespace().collect();
        assert_eq!(pre_fields[4], "/sys/fs/cgroup/memory");
        assert_eq!(post_fields[1], "cgroup");
        assert!(post_fields[2].split(',').any(|o| o == "memory"));
    }

    #[test]
    fn join_rel_strips_leading_slash() {
        let base = Path::new("/sys/fs/cgroup/cpu");
        assert_eq!(
            join_rel(base, "/mydocker-cgroup"),
            PathBuf::from("/sys/fs/cgroup/cpu/mydocker-cgroup")
        );
    }
}
