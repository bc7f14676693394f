//! The child side of the two-phase launch: runs only when argv[1] == "init".
//!
//! Reassigns mount propagation to private, pivots into the overlay merged
//! directory, mounts /proc, then execs the user command read from fd 3.

use std::ffi::CString;
use std::fs;
use std::os::unix::io::{FromRawFd, RawFd};
use std::io::Read;
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, execvp};

use crate::error::{err, Behavior, Category, Error, Result};

const CMD_PIPE_FD: RawFd = 3;

fn mount_err(msg: String, e: nix::Error) -> Error {
    Error::wrap(
        Category::Container,
        Behavior::Mount,
        msg,
        std::io::Error::from_raw_os_error(e as i32),
    )
}

/// Reads the space-separated user cmdline the parent wrote into fd 3.
fn read_cmdline() -> Result<Vec<String>> {
    let mut file = unsafe { fs::File::from_raw_fd(CMD_PIPE_FD) };
    let mut buf = String::new();
    file.read_to_string(&mut buf)
        .map_err(|e| Error::wrap(Category::Container, Behavior::Read, "reading cmdline pipe", e))?;

    let argv: Vec<String> = buf.split_whitespace().map(String::from).collect();
    if argv.is_empty() {
        return Err(err!(
            Category::Container,
            Behavior::InvalidParam,
            "empty container command"
        ));
    }
    Ok(argv)
}

/// Re-mounts `/` as private+recursive so the pivot_root below does not leak
/// into the host mount namespace.
fn set_private_propagation() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err("remounting / as private".into(), e))
}

/// Swaps the process root to `new_root` via the literal pivot_root syscall,
/// staging the old root under `new_root/.pivot_root` and detaching it.
fn pivot_root(new_root: &Path) -> Result<()> {
    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err(format!("bind-mounting new root {:?} onto itself", new_root), e))?;

    let staging = new_root.join(".pivot_root");
    fs::create_dir_all(&staging)
        .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "creating pivot_root staging dir", e))?;

    let new_root_c = CString::new(new_root.to_str().unwrap()).unwrap();
    let staging_c = CString::new(staging.to_str().unwrap()).unwrap();

    let rc = unsafe { libc::syscall(libc::SYS_pivot_root, new_root_c.as_ptr(), staging_c.as_ptr()) };
    if rc != 0 {
        return Err(Error::wrap(
            Category::Container,
            Behavior::Mount,
            "pivot_root syscall failed",
            std::io::Error::last_os_error(),
        ));
    }

    chdir("/").map_err(|e| mount_err("chdir to new /".into(), e))?;

    let old_root_in_new = Path::new("/.pivot_root");
    umount2(old_root_in_new, MntFlags::MNT_DETACH)
        .map_err(|e| mount_err("lazy-unmounting old root".into(), e))?;
    fs::remove_dir(old_root_in_new)
        .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "removing pivot_root staging dir", e))?;

    Ok(())
}

fn mount_proc() -> Result<()> {
    fs::create_dir_all("/proc")
        .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "creating /proc mountpoint", e))?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| mount_err("mounting /proc".into(), e))
}

/// Entry point for the `init` subcommand. Never returns on success: the
/// process image is replaced by the user command.
///
/// The parent has already set the child's working directory to the merged
/// overlay root before exec'ing into `init`, so that directory is what gets
/// pivoted into.
pub fn run_init() -> Result<()> {
    let new_root = std::env::current_dir()
        .map_err(|e| Error::wrap(Category::Container, Behavior::Read, "reading current directory", e))?;
    let argv = read_cmdline()?;

    set_private_propagation()?;
    pivot_root(&new_root)?;
    mount_proc()?;

    let cargv: Vec<CString> = argv.iter().map(|s| CString::new(s.as_str()).unwrap()).collect();

    execvp(&cargv[0], &cargv).map_err(|e| {
        Error::wrap(
            Category::Container,
            Behavior::Write,
            format!("exec'ing container command {:?}", argv),
            std::io::Error::from_raw_os_error(e as i32),
        )
    })?;

    unreachable!("execvp only returns on error")
}
