//! Builds and tears down a container's overlay root: a shared, image-derived
//! `lower` directory, a per-container `upper`/`work` pair, and the `merged`
//! mountpoint that the container actually runs from.

use std::fs;
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::error::{err, Behavior, Category, Error, Result};
use crate::paths;

fn io_err(behavior: Behavior, msg: String, e: std::io::Error) -> Error {
    Error::wrap(Category::Container, behavior, msg, e)
}

fn mount_err(msg: String, e: nix::Error) -> Error {
    Error::wrap(
        Category::Container,
        Behavior::Mount,
        msg,
        std::io::Error::from_raw_os_error(e as i32),
    )
}

/// Extracts an image tar archive into `lower`, by shelling out to `tar` (this
/// crate treats the archive format as opaque, same as it treats `mount` and
/// `iptables` as external collaborators).
fn untar_image(image: &str, lower: &Path) -> Result<()> {
    let archive = paths::image_archive_path(image);
    let status = std::process::Command::new("tar")
        .arg("-xf")
        .arg(&archive)
        .arg("-C")
        .arg(lower)
        .status()
        .map_err(|e| io_err(Behavior::Read, format!("running tar to unpack {:?}", archive), e))?;

    if !status.success() {
        return Err(err!(
            Category::Container,
            Behavior::Read,
            "tar exited with {:?} while unpacking {:?}",
            status.code(),
            archive
        ));
    }
    Ok(())
}

/// Builds the overlay workspace for `name` derived from `image`, optionally
/// bind-mounting `volume` ("host:container") into the merged view.
pub fn new_workspace(volume: Option<&str>, image: &str, name: &str) -> Result<()> {
    let lower = paths::lower_dir(name);
    if !lower.exists() {
        fs::create_dir_all(&lower).map_err(|e| {
            io_err(Behavior::Write, format!("creating lower dir {:?}", lower), e)
        })?;
        untar_image(image, &lower)?;
    }

    let upper = paths::upper_dir(name);
    fs::create_dir_all(&upper)
        .map_err(|e| io_err(Behavior::Write, format!("creating upper dir {:?}", upper), e))?;

    let work = paths::work_dir(name);
    fs::create_dir(&work).or_else(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            Ok(())
        } else {
            Err(io_err(Behavior::Write, format!("creating work dir {:?}", work), e))
        }
    })?;

    let merged = paths::merged_dir(name);
    fs::create_dir_all(&merged)
        .map_err(|e| io_err(Behavior::Write, format!("creating merged dir {:?}", merged), e))?;
    fs::set_permissions(
        &merged,
        <fs::Permissions as std::os::unix::fs::PermissionsExt>::from_mode(0o777),
    )
        .map_err(|e| io_err(Behavior::Write, format!("chmod merged dir {:?}", merged), e))?;

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );
    mount(
        Some("overlay"),
        &merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| mount_err(format!("mounting overlay at {:?}", merged), e))?;

    if let Some(volume) = volume {
        mount_volume(volume, &merged)?;
    }

    Ok(())
}

fn mount_volume(volume: &str, merged: &Path) -> Result<()> {
    let (host, container) = volume.split_once(':').ok_or_else(|| {
        err!(
            Category::Container,
            Behavior::InvalidParam,
            "volume spec '{}' must be 'host:container'",
            volume
        )
    })?;

    let host_path = Path::new(host);
    fs::create_dir_all(host_path)
        .map_err(|e| io_err(Behavior::Write, format!("creating volume host dir {:?}", host_path), e))?;

    let container_path = merged.join(container.trim_start_matches('/'));
    fs::create_dir_all(&container_path).map_err(|e| {
        io_err(
            Behavior::Write,
            format!("creating volume mountpoint {:?}", container_path),
            e,
        )
    })?;

    mount(
        Some(host_path),
        &container_path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| mount_err(format!("bind mounting volume {} into {:?}", volume, container_path), e))
}

/// Tears down everything [`new_workspace`] set up, in reverse order. Does
/// *not* remove `lower`: it is shared across every container started from the
/// same image, so removing it here would force a needless re-untar later.
pub fn delete_workspace(volume: Option<&str>, name: &str) -> Result<()> {
    let merged = paths::merged_dir(name);

    if let Some(volume) = volume {
        if let Some((_, container)) = volume.split_once(':') {
            let container_path = merged.join(container.trim_start_matches('/'));
            if container_path.exists() {
                umount2(&container_path, MntFlags::MNT_DETACH).map_err(|e| {
                    mount_err(format!("unmounting volume at {:?}", container_path), e)
                })?;
            }
        }
    }

    if merged.exists() {
        umount2(&merged, MntFlags::MNT_DETACH)
            .map_err(|e| mount_err(format!("unmounting overlay at {:?}", merged), e))?;
        fs::remove_dir_all(&merged)
            .map_err(|e| io_err(Behavior::Write, format!("removing merged dir {:?}", merged), e))?;
    }

    let upper = paths::upper_dir(name);
    if upper.exists() {
        fs::remove_dir_all(&upper)
            .map_err(|e| io_err(Behavior::Write, format!("removing upper dir {:?}", upper), e))?;
    }

    let work = paths::work_dir(name);
    if work.exists() {
        fs::remove_dir_all(&work)
            .map_err(|e| io_err(Behavior::Write, format!("removing work dir {:?}", work), e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_volume_rejects_spec_without_colon() {
        let err = mount_volume("no-colon-here", Path::new("/tmp/merged")).unwrap_err();
        assert_eq!(err.behavior(), Behavior::InvalidParam);
    }
}
