//! The parent side of the two-phase launch: clones a child directly into new
//! namespaces (clone(), not fork()+unshare(), so the child lands in the new
//! PID namespace as soon as it exists) and re-execs the current binary as
//! `init` inside them.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;

use nix::sched::CloneFlags;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{Behavior, Category, Error, Result};
use crate::overlay;
use crate::paths;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// stdio wiring requested for the container's init process.
pub enum Stdio {
    /// Inherit the caller's stdio (interactive `-it` runs).
    Inherit,
    /// Redirect stdout/stderr to a detached log file under `<logDir>/<name>/container.log`.
    Detached(PathBuf),
}

pub struct SpawnedContainer {
    pub pid: Pid,
    /// Write end of the cmdline pipe; the caller must write the user argv and
    /// drop this once cgroups/network setup has finished.
    pub cmd_pipe_write: File,
}

fn io_err(behavior: Behavior, msg: String, e: std::io::Error) -> Error {
    Error::wrap(Category::Container, behavior, msg, e)
}

/// Builds the overlay workspace and clones a child that will re-exec itself
/// as `init` once it receives the user cmdline through a pipe.
pub fn spawn(
    name: &str,
    image: &str,
    volume: Option<&str>,
    env: &[String],
    stdio: Stdio,
) -> Result<SpawnedContainer> {
    overlay::new_workspace(volume, image, name)?;

    let merged = paths::merged_dir(name);

    let (read_fd, write_fd) = nix::unistd::pipe2(nix::fcntl::OFlag::empty())
        .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "creating cmdline pipe", std::io::Error::from_raw_os_error(e as i32)))?;

    let exe = fs::read_link("/proc/self/exe")
        .map_err(|e| io_err(Behavior::Read, "reading /proc/self/exe".into(), e))?;

    let log_file = match &stdio {
        Stdio::Inherit => None,
        Stdio::Detached(log_path) => {
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| io_err(Behavior::Write, format!("creating log dir {:?}", parent), e))?;
            }
            Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(log_path)
                    .map_err(|e| io_err(Behavior::Write, format!("creating log file {:?}", log_path), e))?,
            )
        }
    };

    let env: Vec<String> = env.to_vec();

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let read_raw: RawFd = read_fd;
    let log_raw: Option<RawFd> = log_file.as_ref().map(|f| f.as_raw_fd());
    let merged_clone = merged.clone();
    let exe_clone = exe.clone();

    let child_fn = Box::new(move || -> isize {
        match run_in_child(&exe_clone, &merged_clone, read_raw, log_raw, &env) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("container init setup failed: {}", e);
                1
            }
        }
    });

    let flags = CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC;

    let pid = nix::sched::clone(child_fn, &mut stack, flags, Some(libc::SIGCHLD))
        .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "clone() for container child", std::io::Error::from_raw_os_error(e as i32)))?;

    // The read end now belongs to the child's copy; close our reference.
    let _ = nix::unistd::close(read_fd);

    let cmd_pipe_write = unsafe { File::from_raw_fd(write_fd) };

    Ok(SpawnedContainer { pid, cmd_pipe_write })
}

/// Runs inside the cloned child, before it execs itself as `init`.
fn run_in_child(
    exe: &std::path::Path,
    merged: &std::path::Path,
    read_fd: RawFd,
    log_fd: Option<RawFd>,
    env: &[String],
) -> Result<()> {
    if let Some(log_fd) = log_fd {
        nix::unistd::dup2(log_fd, libc::STDOUT_FILENO)
            .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "redirecting stdout to log", std::io::Error::from_raw_os_error(e as i32)))?;
        nix::unistd::dup2(log_fd, libc::STDERR_FILENO)
            .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "redirecting stderr to log", std::io::Error::from_raw_os_error(e as i32)))?;
    }

    // Move the cmdline pipe's read end onto fd 3, the contract init.rs relies on.
    if read_fd != 3 {
        nix::unistd::dup2(read_fd, 3)
            .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "moving cmdline pipe to fd 3", std::io::Error::from_raw_os_error(e as i32)))?;
    }

    nix::unistd::chdir(merged)
        .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "chdir into merged root", std::io::Error::from_raw_os_error(e as i32)))?;

    let exe_c = CString::new(exe.to_str().unwrap()).unwrap();
    let argv = [exe_c.clone(), CString::new("init").unwrap()];

    let mut envp: Vec<CString> = std::env::vars()
        .map(|(k, v)| CString::new(format!("{}={}", k, v)).unwrap())
        .collect();
    for kv in env {
        envp.push(CString::new(kv.as_str()).unwrap());
    }

    nix::unistd::execve(&exe_c, &argv, &envp)
        .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "exec'ing self as init", std::io::Error::from_raw_os_error(e as i32)))?;

    unreachable!("execve only returns on error")
}

/// Blocks until `pid` exits, returning its exit code (signals are mapped to
/// 128+signum, matching shell convention).
pub fn wait_for_exit(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::empty())) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(e) => {
                return Err(Error::wrap(
                    Category::Container,
                    Behavior::Read,
                    "waitpid on container child",
                    std::io::Error::from_raw_os_error(e as i32),
                ))
            }
        }
    }
}
