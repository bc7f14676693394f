//! Archives a container's merged overlay directory into a new image archive.

use std::process::Command;

use crate::error::{err, Behavior, Category, Error, Result};
use crate::paths;

/// Tars and gzips `<root>/<container>/merged` into `<root>/<image>.tar.gz`.
/// Refuses to overwrite an existing archive rather than silently clobbering
/// it.
pub fn commit(container_name: &str, image_name: &str) -> Result<()> {
    let target = paths::image_commit_path(image_name);
    if target.exists() {
        return Err(err!(
            Category::Container,
            Behavior::InvalidParam,
            "image archive {:?} already exists",
            target
        ));
    }

    let merged = paths::merged_dir(container_name);
    let status = Command::new("tar")
        .arg("-czf")
        .arg(&target)
        .arg("-C")
        .arg(&merged)
        .arg(".")
        .status()
        .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "running tar to commit image", e))?;

    if !status.success() {
        return Err(err!(
            Category::Container,
            Behavior::Write,
            "tar exited with {:?} while committing {:?}",
            status.code(),
            target
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn commit_refuses_to_overwrite_an_existing_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("MYDOCKER_ROOT_DIR", dir.path());

        let target = paths::image_commit_path("already-there");
        fs::write(&target, b"existing archive").unwrap();

        let err = commit("some-container", "already-there").unwrap_err();
        assert_eq!(err.behavior(), Behavior::InvalidParam);
        assert_eq!(fs::read(&target).unwrap(), b"existing archive");

        std::env::remove_var("MYDOCKER_ROOT_DIR");
    }
}
