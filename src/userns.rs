use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::process::Command;
use std::str::FromStr;

use nix::unistd::{Gid, Uid, User};

use crate::syscall::Pid;
use crate::{Error, Result};

/// One `<container> <host> <length>` line of an id map table.
#[derive(Clone, Copy, Debug)]
struct IdMap {
    container_id: u32,
    host_id: u32,
    size: u32,
}

/// Installs uid/gid mappings for the child's fresh user namespace. Must
/// complete before the child is woken so it never runs unmapped.
pub(crate) fn map_user(pid: Pid) -> Result<()> {
    if Uid::effective().is_root() {
        map_direct(pid)
    } else {
        map_with_helpers(pid)
    }
}

/// Root caller: write the map files directly, container root is host root.
fn map_direct(pid: Pid) -> Result<()> {
    write_map(
        &format!("/proc/{pid}/setgroups"),
        "deny",
    )?;
    write_map(
        &format!("/proc/{pid}/uid_map"),
        &format!("0 {} 1", Uid::effective().as_raw()),
    )?;
    write_map(
        &format!("/proc/{pid}/gid_map"),
        &format!("0 {} 1", Gid::effective().as_raw()),
    )
}

fn write_map(path: &str, data: &str) -> Result<()> {
    std::fs::write(path, data)
        .map_err(|v| Error::IdMapFailed(format!("cannot write {path}: {v}")))
}

/// Unprivileged caller: delegate to the setuid new{u,g}idmap helpers,
/// which verify the subordinate ranges in /etc/sub{u,g}id.
fn map_with_helpers(pid: Pid) -> Result<()> {
    let uid = Uid::effective();
    let gid = Gid::effective();
    let user = User::from_uid(uid)
        .map_err(|v| Error::IdMapFailed(format!("cannot resolve user {uid}: {v}")))?
        .ok_or_else(|| Error::IdMapFailed(format!("unknown user: {uid}")))?;
    let uid_map = subid_map("/etc/subuid", uid.as_raw(), &user)?;
    let gid_map = subid_map("/etc/subgid", gid.as_raw(), &user)?;
    run_id_map(&uid_map, "newuidmap", pid)?;
    run_id_map(&gid_map, "newgidmap", pid)?;
    Ok(())
}

/// Container root is the caller, the subordinate range fills ids 1 and up.
fn subid_map(path: &str, id: u32, user: &User) -> Result<Vec<IdMap>> {
    let (start, size) = find_subid(path, user)?.ok_or_else(|| {
        Error::IdMapFailed(format!(
            "no subordinate range for {} in {path}; add \"{}:100000:65536\" there or run as root",
            user.name, user.name,
        ))
    })?;
    Ok(vec![
        IdMap {
            container_id: 0,
            host_id: id,
            size: 1,
        },
        IdMap {
            container_id: 1,
            host_id: start,
            size,
        },
    ])
}

fn find_subid(path: &str, user: &User) -> Result<Option<(u32, u32)>> {
    let file = BufReader::new(
        File::open(path).map_err(|v| Error::IdMapFailed(format!("cannot read {path}: {v}")))?,
    );
    for line in file.lines() {
        let line = line.map_err(|v| Error::IdMapFailed(format!("cannot read {path}: {v}")))?;
        let parts: Vec<_> = line.split(':').collect();
        if parts.len() >= 3 && parts[0] == user.name {
            let start = u32::from_str(parts[1])
                .map_err(|v| Error::IdMapFailed(format!("bad range start in {path}: {v}")))?;
            let size = u32::from_str(parts[2])
                .map_err(|v| Error::IdMapFailed(format!("bad range size in {path}: {v}")))?;
            return Ok(Some((start, size)));
        }
    }
    Ok(None)
}

fn run_id_map(id_map: &[IdMap], binary: &str, pid: Pid) -> Result<()> {
    let mut cmd = Command::new(binary);
    cmd.arg(pid.as_raw().to_string());
    for v in id_map {
        cmd.arg(v.container_id.to_string())
            .arg(v.host_id.to_string())
            .arg(v.size.to_string());
    }
    let status = match cmd.status() {
        Ok(v) => v,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(Error::IdMapFailed(format!(
                "{binary} not found; install the uidmap package or run as root"
            )));
        }
        Err(err) => {
            return Err(Error::IdMapFailed(format!("cannot run {binary}: {err}")));
        }
    };
    if !status.success() {
        return Err(Error::IdMapFailed(format!("{binary} exited with {status}")));
    }
    Ok(())
}
