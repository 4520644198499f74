use std::fs::{self, create_dir, read_dir, remove_dir};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{kill, Signal};

use crate::syscall::Pid;
use crate::{Error, Result};

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const PARENT_GROUP: &str = "microbox";
const CPU_PERIOD_USEC: u64 = 100_000;

/// A per-sandbox cgroup v2 directory with limits applied.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Creates the group, writes the limits and attaches the child. The
    /// attach comes last so the child never runs unlimited.
    pub(crate) fn setup(pid: Pid, cpus: f64, memory_bytes: u64) -> Result<Self> {
        let mount = Path::new(CGROUP_MOUNT);
        let parent = mount.join(PARENT_GROUP);
        ignore_kind(create_dir(&parent), ErrorKind::AlreadyExists).map_err(|v| {
            Error::CgroupFailed(format!("cannot create {}: {v}", parent.display()))
        })?;
        enable_controllers(&mount.join("cgroup.subtree_control"))?;
        enable_controllers(&parent.join("cgroup.subtree_control"))?;
        // The nanosecond suffix keeps recycled pids from colliding.
        let path = parent.join(format!("sbx-{pid}-{}", nanos_now()));
        create_dir(&path)
            .map_err(|v| Error::CgroupFailed(format!("cannot create {}: {v}", path.display())))?;
        let cgroup = Self { path };
        cgroup.write_file("cpu.max", &cpu_max_value(cpus))?;
        cgroup.write_file("memory.max", &memory_max_value(memory_bytes))?;
        // Swap off is best-effort: the controller file is absent on
        // swapless kernels.
        let _ = fs::write(cgroup.path.join("memory.swap.max"), "0");
        cgroup.write_file("cgroup.procs", &pid.to_string())?;
        Ok(cgroup)
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, name: &str, data: &str) -> Result<()> {
        let path = self.path.join(name);
        fs::write(&path, data).map_err(|v| {
            Error::CgroupFailed(format!("cannot write {data:?} to {}: {v}", path.display()))
        })
    }

    /// Kills whatever is left in the group and removes the directory.
    pub(crate) fn kill_and_remove(&self) -> Result<()> {
        if fs::write(self.path.join("cgroup.kill"), "1").is_err() {
            // Pre-5.14 kernels: signal the remaining members directly.
            if let Ok(procs) = fs::read_to_string(self.path.join("cgroup.procs")) {
                for line in procs.lines() {
                    if let Ok(pid) = line.trim().parse::<nix::libc::pid_t>() {
                        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                    }
                }
            }
        }
        // rmdir races the members exiting.
        for _ in 0..50 {
            match remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                Err(err) if err.raw_os_error() == Some(nix::libc::EBUSY) => {
                    sleep(Duration::from_millis(20));
                }
                Err(err) => {
                    return Err(Error::CgroupFailed(format!(
                        "cannot remove {}: {err}",
                        self.path.display()
                    )));
                }
            }
        }
        Err(Error::CgroupFailed(format!(
            "{} still has members",
            self.path.display()
        )))
    }
}

/// Removes empty per-sandbox groups left behind by dead launchers.
pub(crate) fn collect_stale() {
    let parent = Path::new(CGROUP_MOUNT).join(PARENT_GROUP);
    let entries = match read_dir(&parent) {
        Ok(v) => v,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("sbx-") {
            continue;
        }
        let procs = entry.path().join("cgroup.procs");
        match fs::read_to_string(procs) {
            Ok(v) if v.trim().is_empty() => {
                let _ = remove_dir(entry.path());
            }
            _ => {}
        }
    }
}

/// EBUSY means a controller is busy propagating; the write still took
/// effect for the others, so it is not fatal.
fn enable_controllers(path: &Path) -> Result<()> {
    match fs::write(path, "+cpu +memory") {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(nix::libc::EBUSY) => Ok(()),
        Err(err) => Err(Error::CgroupFailed(format!(
            "cannot enable controllers in {}: {err}",
            path.display()
        ))),
    }
}

fn cpu_max_value(cpus: f64) -> String {
    if cpus == 0.0 {
        format!("max {CPU_PERIOD_USEC}")
    } else {
        let quota = (cpus * CPU_PERIOD_USEC as f64).round() as u64;
        format!("{quota} {CPU_PERIOD_USEC}")
    }
}

fn memory_max_value(memory_bytes: u64) -> String {
    if memory_bytes == 0 {
        "max".to_owned()
    } else {
        memory_bytes.to_string()
    }
}

fn nanos_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|v| v.as_nanos())
        .unwrap_or(0)
}

fn ignore_kind(result: std::io::Result<()>, kind: ErrorKind) -> std::io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == kind => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_max_unlimited() {
        assert_eq!(cpu_max_value(0.0), "max 100000");
    }

    #[test]
    fn cpu_max_fractional() {
        assert_eq!(cpu_max_value(1.5), "150000 100000");
        assert_eq!(cpu_max_value(0.5), "50000 100000");
        assert_eq!(cpu_max_value(4.0), "400000 100000");
    }

    #[test]
    fn memory_max_values() {
        assert_eq!(memory_max_value(0), "max");
        assert_eq!(memory_max_value(64 * 1024 * 1024), "67108864");
    }
}
