//! Glues the cgroup, overlay, network and store subsystems together into the
//! operations the CLI exposes: run, exec, stop, rm, logs.

use std::fs;
use std::io::Write;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::cgroup::{CgroupManager, ResourceConfig};
use crate::container::process::{self, Stdio};
use crate::error::{err, Behavior, Category, Error, Result};
use crate::id;
use crate::network::NetworkManager;
use crate::nsenter;
use crate::overlay;
use crate::paths;
use crate::store::{self, Info};

pub struct RunOptions {
    pub tty: bool,
    pub detach: bool,
    pub image: String,
    pub argv: Vec<String>,
    pub name: Option<String>,
    pub volume: Option<String>,
    pub env: Vec<String>,
    pub network: Option<String>,
    pub ports: Vec<String>,
    pub resources: ResourceConfig,
}

/// Runs a new container. Returns the container's name.
pub fn run(opts: RunOptions) -> Result<String> {
    if opts.tty && opts.detach {
        return Err(err!(
            Category::Container,
            Behavior::InvalidParam,
            "-it and -d are mutually exclusive"
        ));
    }

    let container_id = id::generate();
    let name = opts.name.clone().unwrap_or_else(|| container_id.clone());

    let stdio = if opts.tty {
        Stdio::Inherit
    } else {
        Stdio::Detached(paths::container_log_file(&name))
    };

    let spawned = process::spawn(&name, &opts.image, opts.volume.as_deref(), &opts.env, stdio)?;
    let pid = spawned.pid.as_raw();

    let info = Info::new(
        container_id,
        name.clone(),
        pid as u32,
        opts.argv.join(" "),
        opts.volume.clone().unwrap_or_default(),
        opts.ports.clone(),
    );
    store::put(&info)?;

    let cgroups = CgroupManager::new();
    cgroups.set(&opts.resources)?;
    cgroups.apply(pid as u32)?;

    if let Some(network) = &opts.network {
        let manager = NetworkManager::new();
        manager.connect(network, &info.id, pid, &opts.ports)?;
    }

    let mut pipe = spawned.cmd_pipe_write;
    pipe.write_all(opts.argv.join(" ").as_bytes())
        .map_err(|e| Error::wrap(Category::Container, Behavior::Write, "writing cmdline to child", e))?;
    drop(pipe);

    if opts.tty {
        let exit_code = process::wait_for_exit(spawned.pid)?;
        log::info!("container '{}' exited with code {}", name, exit_code);

        cgroups.remove();
        overlay::delete_workspace(opts.volume.as_deref(), &name)?;
        let dir = paths::container_meta_dir(&name);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| Error::wrap(Category::Meta, Behavior::Write, "removing container record after tty run", e))?;
        }
    }

    Ok(name)
}

/// Re-execs the current binary with the namespace-entry env vars set; the
/// pre-main constructor in [`crate::nsenter`] does the rest.
pub fn exec(name: &str, argv: &[String]) -> Result<()> {
    let info = store::get(name)?;
    if info.pid.trim().is_empty() {
        return Err(err!(
            Category::Container,
            Behavior::InvalidParam,
            "container '{}' is not running",
            name
        ));
    }

    std::env::set_var(nsenter::ENV_PID, &info.pid);
    std::env::set_var(nsenter::ENV_CMD, argv.join(" "));

    let exe = fs::read_link("/proc/self/exe")
        .map_err(|e| Error::wrap(Category::Nsenter, Behavior::Read, "reading /proc/self/exe", e))?;
    let exe_c = std::ffi::CString::new(exe.to_str().unwrap()).unwrap();

    nix::unistd::execv(&exe_c, &[exe_c.clone()]).map_err(|e| {
        Error::wrap(
            Category::Nsenter,
            Behavior::Write,
            "re-exec'ing self for exec",
            std::io::Error::from_raw_os_error(e as i32),
        )
    })?;

    unreachable!("execv only returns on error")
}

pub fn stop(name: &str) -> Result<()> {
    let info = store::get(name)?;
    let pid: i32 = info.pid.trim().parse().map_err(|_| {
        err!(
            Category::Container,
            Behavior::InvalidParam,
            "container '{}' has no live pid to stop",
            name
        )
    })?;

    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|e| {
        Error::wrap(
            Category::Container,
            Behavior::Write,
            format!("sending SIGTERM to pid {}", pid),
            std::io::Error::from_raw_os_error(e as i32),
        )
    })?;

    store::mark_stopped(name)
}

pub fn rm(name: &str) -> Result<()> {
    let info = store::get(name)?;
    if info.status != store::Status::Stopped {
        return Err(err!(
            Category::Container,
            Behavior::InvalidParam,
            "container '{}' must be stopped before it can be removed",
            name
        ));
    }

    overlay::delete_workspace(
        if info.volume.is_empty() { None } else { Some(info.volume.as_str()) },
        name,
    )?;
    store::remove(name)
}

pub fn logs(name: &str) -> Result<String> {
    let path = paths::container_log_file(name);
    fs::read_to_string(&path)
        .map_err(|e| Error::wrap(Category::Container, Behavior::Read, format!("reading logs for '{}'", name), e))
}

pub fn ps() -> Result<Vec<Info>> {
    store::list()
}
