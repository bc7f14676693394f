//! Namespace-entry shim powering `exec`.
//!
//! The dedicated native compilation unit the original tool uses to guarantee
//! this code runs before any userspace threads exist is replaced here with a
//! pre-main constructor: no threads exist before a constructor runs either,
//! so the guarantee holds just as well without a second binary.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use ctor::ctor;
use nix::fcntl::OFlag;
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;

const NAMESPACES: [(&str, CloneFlags); 5] = [
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("net", CloneFlags::CLONE_NEWNET),
    ("pid", CloneFlags::CLONE_NEWPID),
    ("mnt", CloneFlags::CLONE_NEWNS),
];

pub const ENV_PID: &str = "mydocker_pid";
pub const ENV_CMD: &str = "mydocker_cmd";

#[ctor]
fn enter_namespaces_before_main() {
    let pid = match std::env::var(ENV_PID) {
        Ok(v) => v,
        Err(_) => return,
    };
    let cmd = match std::env::var(ENV_CMD) {
        Ok(v) => v,
        Err(_) => return,
    };

    for (name, flag) in NAMESPACES.iter() {
        let path = format!("/proc/{}/ns/{}", pid, name);
        let fd: RawFd = match nix::fcntl::open(path.as_str(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(fd) => fd,
            Err(e) => {
                eprintln!("nsenter: failed to open {}: {}", path, e);
                continue;
            }
        };
        if let Err(e) = setns(fd, *flag) {
            eprintln!("nsenter: setns({}) failed: {}", name, e);
        }
        let _ = nix::unistd::close(fd);
    }

    let shell = CString::new("/bin/sh").unwrap();
    let flag = CString::new("-c").unwrap();
    let cmd_c = CString::new(cmd).unwrap();
    let argv = [shell.clone(), flag, cmd_c];

    match nix::unistd::execvp(&shell, &argv) {
        Ok(_) => unreachable!("execvp only returns on error"),
        Err(e) => {
            eprintln!("nsenter: exec failed: {}", e);
            std::process::exit(1);
        }
    }
}
