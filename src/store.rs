//! JSON-on-disk container records: one directory per container name holding
//! a single `config.json`.

use std::fs;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::{err, Behavior, Category, Error, Result};
use crate::paths;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    Running,
    Stopped,
    Exited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub id: String,
    pub name: String,
    pub pid: String,
    pub command: String,
    pub create_time: String,
    pub status: Status,
    pub volume: String,
    pub port_mapping: Vec<String>,
}

impl Info {
    pub fn new(id: String, name: String, pid: u32, command: String, volume: String, port_mapping: Vec<String>) -> Self {
        Self {
            id,
            name,
            pid: pid.to_string(),
            command,
            create_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            status: Status::Running,
            volume,
            port_mapping,
        }
    }
}

fn dir_err(behavior: Behavior, msg: String, e: std::io::Error) -> Error {
    Error::wrap(Category::Meta, behavior, msg, e)
}

/// Writes a freshly created container's record.
pub fn put(info: &Info) -> Result<()> {
    let dir = paths::container_meta_dir(&info.name);
    fs::create_dir_all(&dir).map_err(|e| dir_err(Behavior::Write, format!("creating meta dir {:?}", dir), e))?;

    let data = serde_json::to_string(info)
        .map_err(|e| Error::wrap(Category::Meta, Behavior::Convert, "serializing container Info", e))?;

    fs::write(paths::container_config_file(&info.name), data)
        .map_err(|e| dir_err(Behavior::Write, "writing config.json".into(), e))
}

pub fn get(name: &str) -> Result<Info> {
    let path = paths::container_config_file(name);
    let data = fs::read_to_string(&path).map_err(|e| {
        Error::wrap(Category::Meta, Behavior::NotFound, format!("container '{}' not found", name), e)
    })?;
    serde_json::from_str(&data)
        .map_err(|e| Error::wrap(Category::Meta, Behavior::Convert, "parsing container Info", e))
}

pub fn list() -> Result<Vec<Info>> {
    let dir = paths::json_dir();
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut out = vec![];
    for entry in fs::read_dir(&dir).map_err(|e| dir_err(Behavior::Read, "listing containers dir".into(), e))? {
        let entry = entry.map_err(|e| dir_err(Behavior::Read, "reading containers dir entry".into(), e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match get(&name) {
            Ok(info) => out.push(info),
            Err(e) => log::warn!("skipping unreadable container record '{}': {}", name, e),
        }
    }
    Ok(out)
}

/// Marks a container stopped: `Pid` becomes a single space, matching the
/// on-disk sentinel for "no live process".
pub fn mark_stopped(name: &str) -> Result<()> {
    let mut info = get(name)?;
    info.status = Status::Stopped;
    info.pid = " ".to_string();
    put(&info)
}

/// Deletes a container's record directory. Refuses unless the container is
/// stopped.
pub fn remove(name: &str) -> Result<()> {
    let info = get(name)?;
    if info.status != Status::Stopped {
        return Err(err!(
            Category::Meta,
            Behavior::InvalidParam,
            "container '{}' must be stopped before it can be removed",
            name
        ));
    }

    let dir = paths::container_meta_dir(name);
    fs::remove_dir_all(&dir).map_err(|e| dir_err(Behavior::Write, format!("removing meta dir {:?}", dir), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_scratch_root<F: FnOnce()>(f: F) {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("MYDOCKER_JSON_DIR", dir.path());
        f();
        std::env::remove_var("MYDOCKER_JSON_DIR");
    }

    #[test]
    fn stop_then_remove_round_trip() {
        with_scratch_root(|| {
            let info = Info::new(
                "abc1234567".into(),
                "c1".into(),
                4242,
                "/bin/sh".into(),
                String::new(),
                vec![],
            );
            put(&info).unwrap();

            mark_stopped("c1").unwrap();
            let reloaded = get("c1").unwrap();
            assert_eq!(reloaded.status, Status::Stopped);
            assert_eq!(reloaded.pid, " ");

            remove("c1").unwrap();
            assert!(get("c1").is_err());
        });
    }

    #[test]
    fn remove_refuses_a_running_container() {
        with_scratch_root(|| {
            let info = Info::new("abc1234568".into(), "c2".into(), 4243, "/bin/sh".into(), String::new(), vec![]);
            put(&info).unwrap();

            let err = remove("c2").unwrap_err();
            assert_eq!(err.behavior(), Behavior::InvalidParam);
        });
    }
}
